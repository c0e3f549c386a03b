//! Size-matched control selection.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::info;

use crate::config::{DonorConfig, SizeMetric, StudyDates};
use crate::error::{AnalysisError, Result};
use crate::types::{Transaction, Zip3};

#[derive(Debug, Clone, Serialize)]
pub struct DonorPool {
    pub treated: Zip3,
    pub treated_size: f64,
    pub lower: f64,
    pub upper: f64,
    /// Ascending by ZIP3.
    pub donors: Vec<Zip3>,
}

impl DonorPool {
    /// Treated unit first, then the donors.
    pub fn units(&self) -> Vec<Zip3> {
        std::iter::once(self.treated).chain(self.donors.iter().copied()).collect()
    }
}

/// Size of every ZIP3 over `[start, size_window_end)`.
pub fn unit_sizes(
    transactions: &[Transaction],
    dates: &StudyDates,
    metric: SizeMetric,
) -> BTreeMap<Zip3, f64> {
    let mut trans: BTreeMap<Zip3, usize> = BTreeMap::new();
    let mut users: BTreeMap<Zip3, HashSet<&str>> = BTreeMap::new();
    for t in transactions {
        let Some(zip3) = t.zip3 else { continue };
        if t.date < dates.start || t.date >= dates.size_window_end {
            continue;
        }
        *trans.entry(zip3).or_default() += 1;
        users.entry(zip3).or_default().insert(t.cardid.as_str());
    }
    match metric {
        SizeMetric::Transactions => trans.into_iter().map(|(z, n)| (z, n as f64)).collect(),
        SizeMetric::Users => users.into_iter().map(|(z, u)| (z, u.len() as f64)).collect(),
    }
}

/// ZIP3s within `±size_window` of the treated unit's size, treated excluded.
pub fn select_size_matched(
    transactions: &[Transaction],
    treated: Zip3,
    dates: &StudyDates,
    config: &DonorConfig,
) -> Result<DonorPool> {
    let sizes = unit_sizes(transactions, dates, config.size_metric);
    let treated_size = sizes
        .get(&treated)
        .copied()
        .ok_or_else(|| AnalysisError::MissingTreatedUnit {
            zip3: treated.to_string(),
            context: format!("between {} and {}", dates.start, dates.size_window_end),
        })?;
    let lower = treated_size * (1.0 - config.size_window);
    let upper = treated_size * (1.0 + config.size_window);

    let donors: Vec<Zip3> = sizes
        .iter()
        .filter(|(z, s)| **z != treated && **s >= lower && **s <= upper)
        .map(|(z, _)| *z)
        .collect();

    info!(
        treated = %treated,
        treated_size,
        window_pct = config.size_window * 100.0,
        donors = donors.len(),
        "selected size-matched controls"
    );
    Ok(DonorPool {
        treated,
        treated_size,
        lower,
        upper,
        donors,
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn tx(card: &str, zip: &str, month: u32) -> Transaction {
        Transaction {
            cardid: card.into(),
            date: NaiveDate::from_ymd_opt(2023, month, 10).unwrap(),
            amount: Some(20.0),
            merchid: "m".into(),
            service: "chatgpt".into(),
            zip3: Zip3::parse(zip),
        }
    }

    fn sample() -> Vec<Transaction> {
        let mut trans = Vec::new();
        // 606: 10 transactions from 2 users in the window.
        for i in 0..10 {
            trans.push(tx(if i % 2 == 0 { "a" } else { "b" }, "606", 4));
        }
        // 600: 6 transactions (inside the 50% window), 6 users.
        for i in 0..6 {
            trans.push(tx(&format!("c{i}"), "600", 5));
        }
        // 601: 16 transactions, outside the window.
        for _ in 0..16 {
            trans.push(tx("d", "601", 5));
        }
        // 602: only outside the sizing window.
        for _ in 0..10 {
            trans.push(tx("e", "602", 9));
        }
        trans
    }

    #[test]
    fn selects_units_within_window() {
        let pool = select_size_matched(
            &sample(),
            Zip3::CHICAGO,
            &StudyDates::default(),
            &DonorConfig::default(),
        )
        .unwrap();
        assert_eq!(pool.treated_size, 10.0);
        assert_eq!(pool.donors, vec![Zip3::parse("600").unwrap()]);
        assert_eq!(pool.units()[0], Zip3::CHICAGO);
    }

    #[test]
    fn user_metric_changes_the_match() {
        let config = DonorConfig {
            size_window: 0.5,
            size_metric: SizeMetric::Users,
        };
        let pool =
            select_size_matched(&sample(), Zip3::CHICAGO, &StudyDates::default(), &config).unwrap();
        assert_eq!(pool.treated_size, 2.0);
        // 601 has one user, inside [1, 3]; 600 has six.
        assert_eq!(pool.donors, vec![Zip3::parse("601").unwrap()]);
    }

    #[test]
    fn missing_treated_unit_is_an_error() {
        let trans: Vec<Transaction> = sample().into_iter().filter(|t| t.zip3 != Some(Zip3::CHICAGO)).collect();
        let err = select_size_matched(
            &trans,
            Zip3::CHICAGO,
            &StudyDates::default(),
            &DonorConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AnalysisError::MissingTreatedUnit { .. }));
    }
}
