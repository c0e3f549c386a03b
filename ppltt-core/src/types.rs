use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AnalysisError;

// ============================================================================
// Geography
// ============================================================================

/// First three digits of a US ZIP code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Zip3([u8; 3]);

impl Zip3 {
    pub const CHICAGO: Zip3 = Zip3(*b"606");

    /// Parse a raw extract value. Integer-like values are zero-padded
    /// (`60` -> `060`, `"606.0"` -> `606`); anything else is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim();
        let s = s.strip_suffix(".0").unwrap_or(s);
        if s.is_empty() || s.len() > 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let mut digits = [b'0'; 3];
        digits[3 - s.len()..].copy_from_slice(s.as_bytes());
        Some(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        // Only ASCII digits are ever stored.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }

    /// Human-readable market name for the ZIP3s that show up in reports.
    pub fn area_name(&self) -> Option<&'static str> {
        AREA_NAMES
            .binary_search_by(|(z, _)| z.cmp(&self.as_str()))
            .ok()
            .map(|i| AREA_NAMES[i].1)
    }
}

/// Sorted by ZIP3.
const AREA_NAMES: &[(&str, &str)] = &[
    ("077", "Long Branch, NJ"),
    ("100", "Manhattan, NY"),
    ("112", "Brooklyn, NY"),
    ("210", "Baltimore, MD"),
    ("220", "N. Virginia"),
    ("247", "Roanoke, VA"),
    ("258", "Beckley, WV"),
    ("273", "Greensboro, NC"),
    ("277", "Raleigh, NC"),
    ("288", "Asheville, NC"),
    ("294", "Charleston, SC"),
    ("301", "Atlanta, GA"),
    ("303", "Atlanta, GA"),
    ("337", "St. Petersburg, FL"),
    ("348", "Macon, GA"),
    ("387", "Columbus, GA"),
    ("527", "Rochester, MN"),
    ("588", "Rapid City, SD"),
    ("606", "Chicago, IL"),
    ("631", "Nassau, NY"),
    ("711", "Shreveport, LA"),
    ("715", "Eau Claire, WI"),
    ("738", "Tulsa, OK"),
    ("765", "Lafayette, IN"),
    ("785", "Rio Grande Valley, TX"),
    ("786", "Austin, TX"),
    ("803", "Columbia, SC"),
    ("830", "Wyoming"),
    ("836", "Brownsville, TX"),
    ("865", "Flagstaff, AZ"),
    ("890", "Las Vegas, NV"),
    ("900", "Los Angeles, CA"),
    ("923", "San Bernardino, CA"),
    ("943", "Palo Alto, CA"),
];

impl fmt::Display for Zip3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Zip3 {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Zip3::parse(s).ok_or_else(|| AnalysisError::InvalidConfig(format!("invalid ZIP3 `{s}`")))
    }
}

impl Serialize for Zip3 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Zip3 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Records
// ============================================================================

/// One card transaction after loading and type conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub cardid: String,
    pub date: NaiveDate,
    /// `None` when the raw amount did not parse as a number.
    pub amount: Option<f64>,
    pub merchid: String,
    pub service: String,
    /// `None` until a ZIP3 source has been attached, or when the card is unmatched.
    pub zip3: Option<Zip3>,
}

/// One row of the card table.
#[derive(Debug, Clone, PartialEq)]
pub struct CardRecord {
    pub cardid: String,
    pub cardlinkid: String,
    pub source_group: Option<i64>,
    pub cardtype: Option<String>,
    pub zip3: Option<Zip3>,
}

impl CardRecord {
    /// Debit cards from source group 1 are excluded from panel construction.
    pub fn is_usa1_debit(&self) -> bool {
        self.source_group == Some(1) && self.cardtype.as_deref() == Some("DEBIT")
    }
}

/// A card's address validity interval (both ends inclusive).
#[derive(Debug, Clone, PartialEq)]
pub struct AddressSpan {
    pub cardid: String,
    pub zip3: Zip3,
    pub valid_begin: NaiveDate,
    pub valid_end: NaiveDate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip3_pads_and_validates() {
        assert_eq!(Zip3::parse("606").unwrap().as_str(), "606");
        assert_eq!(Zip3::parse("60").unwrap().as_str(), "060");
        assert_eq!(Zip3::parse("7").unwrap().as_str(), "007");
        assert_eq!(Zip3::parse(" 606.0 ").unwrap().as_str(), "606");
        assert!(Zip3::parse("nan").is_none());
        assert!(Zip3::parse("6061").is_none());
        assert!(Zip3::parse("").is_none());
        assert!(Zip3::parse("6a6").is_none());
    }

    #[test]
    fn area_names_resolve() {
        assert_eq!(Zip3::CHICAGO.area_name(), Some("Chicago, IL"));
        assert_eq!(Zip3::parse("77").unwrap().area_name(), Some("Long Branch, NJ"));
        assert_eq!(Zip3::parse("999").unwrap().area_name(), None);
        assert!(AREA_NAMES.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn zip3_serializes_as_string() {
        let z = Zip3::parse("077").unwrap();
        assert_eq!(serde_json::to_string(&z).unwrap(), "\"077\"");
        let back: Zip3 = serde_json::from_str("\"077\"").unwrap();
        assert_eq!(back, z);
    }

    #[test]
    fn usa1_debit_detection() {
        let mut card = CardRecord {
            cardid: "c1".into(),
            cardlinkid: "l1".into(),
            source_group: Some(1),
            cardtype: Some("DEBIT".into()),
            zip3: None,
        };
        assert!(card.is_usa1_debit());
        card.cardtype = Some("CREDIT".into());
        assert!(!card.is_usa1_debit());
        card.source_group = Some(2);
        card.cardtype = Some("DEBIT".into());
        assert!(!card.is_usa1_debit());
    }
}
