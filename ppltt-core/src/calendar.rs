//! Month and week arithmetic over `chrono::NaiveDate`.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AnalysisError;

/// A calendar month. Orders chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(self) -> NaiveDate {
        self.next().first_day().pred_opt().unwrap_or(NaiveDate::MAX)
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Months since an arbitrary epoch; differences are month counts.
    pub fn ordinal(self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    /// Every month from `start` to `end`, both included.
    pub fn range_inclusive(start: Self, end: Self) -> Vec<Self> {
        let mut months = Vec::new();
        let mut m = start;
        while m <= end {
            months.push(m);
            m = m.next();
        }
        months
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || AnalysisError::InvalidConfig(format!("expected YYYY-MM, got `{s}`"));
        let (y, m) = s.trim().split_once('-').ok_or_else(bad)?;
        let year = y.parse().map_err(|_| bad())?;
        let month = m.parse().map_err(|_| bad())?;
        Self::new(year, month).ok_or_else(bad)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Monday of the week containing `date` (weeks run Monday..Sunday).
pub fn week_start(date: NaiveDate) -> NaiveDate {
    let back = date.weekday().num_days_from_monday() as u64;
    date.checked_sub_days(Days::new(back)).unwrap_or(date)
}

/// Days shared by two inclusive date ranges; 0 when disjoint.
pub fn overlap_days(a: (NaiveDate, NaiveDate), b: (NaiveDate, NaiveDate)) -> i64 {
    let start = a.0.max(b.0);
    let end = a.1.min(b.1);
    if end < start {
        0
    } else {
        (end - start).num_days() + 1
    }
}

/// Parse the `YYYY-MM-DD` prefix of a date or timestamp string.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn month_bounds_handle_leap_years() {
        let feb = YearMonth::new(2024, 2).unwrap();
        assert_eq!(feb.first_day(), d(2024, 2, 1));
        assert_eq!(feb.last_day(), d(2024, 2, 29));
        assert_eq!(YearMonth::new(2023, 12).unwrap().next(), YearMonth::new(2024, 1).unwrap());
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let months = YearMonth::range_inclusive(
            YearMonth::new(2022, 11).unwrap(),
            YearMonth::new(2023, 2).unwrap(),
        );
        let labels: Vec<String> = months.iter().map(|m| m.to_string()).collect();
        assert_eq!(labels, ["2022-11", "2022-12", "2023-01", "2023-02"]);
    }

    #[test]
    fn parses_month_labels() {
        assert_eq!("2023-09".parse::<YearMonth>().unwrap(), YearMonth::new(2023, 9).unwrap());
        assert!("2023-13".parse::<YearMonth>().is_err());
        assert!("202309".parse::<YearMonth>().is_err());
    }

    #[test]
    fn week_starts_on_monday() {
        // 2023-10-01 is a Sunday.
        assert_eq!(week_start(d(2023, 10, 1)), d(2023, 9, 25));
        assert_eq!(week_start(d(2023, 10, 2)), d(2023, 10, 2));
    }

    #[test]
    fn overlap_counts_inclusive_days() {
        let jan = (d(2023, 1, 1), d(2023, 1, 31));
        assert_eq!(overlap_days(jan, (d(2022, 12, 20), d(2023, 1, 10))), 10);
        assert_eq!(overlap_days(jan, (d(2023, 1, 31), d(2023, 3, 1))), 1);
        assert_eq!(overlap_days(jan, (d(2023, 2, 1), d(2023, 3, 1))), 0);
    }

    #[test]
    fn parses_dates_with_time_suffix() {
        assert_eq!(parse_date("2023-10-01 00:00:00.000"), Some(d(2023, 10, 1)));
        assert_eq!(parse_date("2023-10-01"), Some(d(2023, 10, 1)));
        assert_eq!(parse_date("10/01/2023"), None);
    }
}
