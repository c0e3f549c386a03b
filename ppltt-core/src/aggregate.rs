//! ZIP3-level aggregation and the wide outcome panel.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDate;
use serde::Serialize;

use crate::calendar::{YearMonth, week_start};
use crate::config::Outcome;
use crate::types::{Transaction, Zip3};

// ============================================================================
// Small statistics
// ============================================================================

pub fn mean(xs: &[f64]) -> Option<f64> {
    (!xs.is_empty()).then(|| xs.iter().sum::<f64>() / xs.len() as f64)
}

/// Sample standard deviation (n - 1 denominator).
pub fn std_dev(xs: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let m = mean(xs)?;
    let ss: f64 = xs.iter().map(|x| (x - m).powi(2)).sum();
    Some((ss / (xs.len() - 1) as f64).sqrt())
}

/// Quantile with linear interpolation between order statistics.
pub fn quantile(xs: &[f64], q: f64) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn median(xs: &[f64]) -> Option<f64> {
    quantile(xs, 0.5)
}

// ============================================================================
// Grouped counts
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyStat {
    pub zip3: Zip3,
    pub month: YearMonth,
    /// Every row counts, including those with an unparsed amount.
    pub n_trans: usize,
    pub n_users: usize,
    /// Rows with a parsed amount; the denominator of a mean price.
    pub n_priced: usize,
    pub total_spend: f64,
    pub median_price: Option<f64>,
}

impl MonthlyStat {
    pub fn outcome_level(&self, outcome: Outcome) -> f64 {
        match outcome {
            Outcome::Transactions => self.n_trans as f64,
            Outcome::UniqueUsers => self.n_users as f64,
            Outcome::Spend => self.total_spend,
        }
    }
}

/// Per (zip3, month). Transactions without a ZIP3 are skipped.
pub fn aggregate_monthly(transactions: &[Transaction]) -> Vec<MonthlyStat> {
    #[derive(Default)]
    struct Acc<'a> {
        n: usize,
        users: HashSet<&'a str>,
        amounts: Vec<f64>,
    }

    let mut groups: BTreeMap<(Zip3, YearMonth), Acc> = BTreeMap::new();
    for t in transactions {
        let Some(zip3) = t.zip3 else { continue };
        let acc = groups.entry((zip3, YearMonth::from_date(t.date))).or_default();
        acc.n += 1;
        acc.users.insert(t.cardid.as_str());
        if let Some(a) = t.amount {
            acc.amounts.push(a);
        }
    }

    groups
        .into_iter()
        .map(|((zip3, month), acc)| MonthlyStat {
            zip3,
            month,
            n_trans: acc.n,
            n_users: acc.users.len(),
            n_priced: acc.amounts.len(),
            total_spend: acc.amounts.iter().sum(),
            median_price: median(&acc.amounts),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyStat {
    pub zip3: Zip3,
    pub week_start: NaiveDate,
    /// Calendar month of the transactions; a week spanning two months yields two rows.
    pub month: YearMonth,
    pub n_trans: usize,
}

pub fn aggregate_weekly(transactions: &[Transaction]) -> Vec<WeeklyStat> {
    let mut groups: BTreeMap<(Zip3, NaiveDate, YearMonth), usize> = BTreeMap::new();
    for t in transactions {
        let Some(zip3) = t.zip3 else { continue };
        *groups
            .entry((zip3, week_start(t.date), YearMonth::from_date(t.date)))
            .or_default() += 1;
    }
    groups
        .into_iter()
        .map(|((zip3, week_start, month), n_trans)| WeeklyStat {
            zip3,
            week_start,
            month,
            n_trans,
        })
        .collect()
}

// ============================================================================
// Wide panel
// ============================================================================

/// Months x units matrix of log outcomes. Missing cells are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomePanel {
    pub months: Vec<YearMonth>,
    pub units: Vec<Zip3>,
    values: Vec<Vec<Option<f64>>>,
}

impl OutcomePanel {
    /// Log of the outcome level; non-positive levels are missing.
    pub fn from_monthly(stats: &[MonthlyStat], outcome: Outcome) -> Self {
        let months: Vec<YearMonth> = stats
            .iter()
            .map(|s| s.month)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let units: Vec<Zip3> = stats
            .iter()
            .map(|s| s.zip3)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut values = vec![vec![None; units.len()]; months.len()];
        for s in stats {
            let level = s.outcome_level(outcome);
            if level <= 0.0 {
                continue;
            }
            if let (Ok(r), Ok(c)) = (months.binary_search(&s.month), units.binary_search(&s.zip3)) {
                values[r][c] = Some(level.ln());
            }
        }
        Self {
            months,
            units,
            values,
        }
    }

    /// Build from per-unit `(month, value)` series, values taken as given.
    pub fn from_series(series: &[(Zip3, Vec<(YearMonth, f64)>)]) -> Self {
        let months: Vec<YearMonth> = series
            .iter()
            .flat_map(|(_, s)| s.iter().map(|(m, _)| *m))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let units: Vec<Zip3> = series
            .iter()
            .map(|(u, _)| *u)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut values = vec![vec![None; units.len()]; months.len()];
        for (unit, s) in series {
            let Ok(c) = units.binary_search(unit) else { continue };
            for (m, v) in s {
                if let Ok(r) = months.binary_search(m) {
                    values[r][c] = Some(*v);
                }
            }
        }
        Self {
            months,
            units,
            values,
        }
    }

    pub fn unit_index(&self, unit: Zip3) -> Option<usize> {
        self.units.binary_search(&unit).ok()
    }

    pub fn has_unit(&self, unit: Zip3) -> bool {
        self.unit_index(unit).is_some()
    }

    pub fn get(&self, row: usize, unit: Zip3) -> Option<f64> {
        let c = self.unit_index(unit)?;
        self.values.get(row)?.get(c).copied().flatten()
    }

    /// One unit's value in every month (`None` for unknown units too).
    pub fn series(&self, unit: Zip3) -> Vec<Option<f64>> {
        match self.unit_index(unit) {
            Some(c) => self.values.iter().map(|row| row[c]).collect(),
            None => vec![None; self.months.len()],
        }
    }

    /// Keep months matching `keep`.
    pub fn filter_months(&self, keep: impl Fn(YearMonth) -> bool) -> Self {
        let mut months = Vec::new();
        let mut values = Vec::new();
        for (m, row) in self.months.iter().zip(&self.values) {
            if keep(*m) {
                months.push(*m);
                values.push(row.clone());
            }
        }
        Self {
            months,
            units: self.units.clone(),
            values,
        }
    }

    /// Drop months where `unit` has no value.
    pub fn drop_missing(&self, unit: Zip3) -> Self {
        let Some(c) = self.unit_index(unit) else {
            return self.filter_months(|_| false);
        };
        let keep: BTreeSet<YearMonth> = self
            .months
            .iter()
            .zip(&self.values)
            .filter(|(_, row)| row[c].is_some())
            .map(|(m, _)| *m)
            .collect();
        self.filter_months(|m| keep.contains(&m))
    }

    /// True when `unit` is observed in every month matching `within`.
    pub fn is_complete(&self, unit: Zip3, within: impl Fn(YearMonth) -> bool) -> bool {
        let Some(c) = self.unit_index(unit) else {
            return false;
        };
        self.months
            .iter()
            .zip(&self.values)
            .filter(|(m, _)| within(**m))
            .all(|(_, row)| row[c].is_some())
    }

    /// Mean of a unit's observed values in months matching `within`.
    pub fn unit_mean(&self, unit: Zip3, within: impl Fn(YearMonth) -> bool) -> Option<f64> {
        let vals: Vec<f64> = self
            .months
            .iter()
            .zip(self.series(unit))
            .filter(|(m, _)| within(**m))
            .filter_map(|(_, v)| v)
            .collect();
        mean(&vals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(card: &str, zip: &str, y: i32, m: u32, d: u32, amount: Option<f64>) -> Transaction {
        Transaction {
            cardid: card.into(),
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            amount,
            merchid: "m".into(),
            service: "chatgpt".into(),
            zip3: Zip3::parse(zip),
        }
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let xs = [20.0, 21.8, 22.0, 25.0];
        assert!((quantile(&xs, 0.5).unwrap() - 21.9).abs() < 1e-12);
        assert!((quantile(&xs, 0.25).unwrap() - 21.35).abs() < 1e-12);
        assert_eq!(quantile(&xs, 1.0), Some(25.0));
        assert_eq!(median(&[]), None);
        assert!((std_dev(&[1.0, 2.0, 3.0]).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn monthly_counts_users_once() {
        let trans = vec![
            tx("a", "606", 2023, 10, 1, Some(21.8)),
            tx("a", "606", 2023, 10, 20, Some(21.8)),
            tx("b", "606", 2023, 10, 5, None),
            tx("c", "600", 2023, 10, 5, Some(20.0)),
            tx("d", "bad", 2023, 10, 5, Some(20.0)),
        ];
        let stats = aggregate_monthly(&trans);
        assert_eq!(stats.len(), 2, "unmatched zip3 dropped");
        let chi = stats.iter().find(|s| s.zip3 == Zip3::CHICAGO).unwrap();
        assert_eq!(chi.n_trans, 3);
        assert_eq!(chi.n_users, 2);
        assert!((chi.total_spend - 43.6).abs() < 1e-9);
        assert_eq!(chi.median_price, Some(21.8));
    }

    #[test]
    fn weekly_groups_split_month_boundaries() {
        // Mon 2023-10-30 through Wed 2023-11-01 share a week but not a month.
        let trans = vec![
            tx("a", "606", 2023, 10, 30, None),
            tx("b", "606", 2023, 10, 31, None),
            tx("c", "606", 2023, 11, 1, None),
        ];
        let weeks = aggregate_weekly(&trans);
        assert_eq!(weeks.len(), 2);
        assert!(weeks.iter().all(|w| w.week_start == NaiveDate::from_ymd_opt(2023, 10, 30).unwrap()));
        assert_eq!(weeks[0].n_trans, 2);
        assert_eq!(weeks[1].n_trans, 1);
    }

    #[test]
    fn panel_takes_logs_and_tracks_gaps() {
        let trans = vec![
            tx("a", "606", 2023, 9, 1, Some(20.0)),
            tx("b", "606", 2023, 9, 2, Some(20.0)),
            tx("a", "606", 2023, 10, 1, Some(20.0)),
            tx("c", "600", 2023, 10, 1, Some(20.0)),
        ];
        let panel = OutcomePanel::from_monthly(&aggregate_monthly(&trans), Outcome::Transactions);
        assert_eq!(panel.months.len(), 2);
        let chicago = panel.series(Zip3::CHICAGO);
        assert!((chicago[0].unwrap() - 2f64.ln()).abs() < 1e-12);
        assert_eq!(chicago[1], Some(0.0));

        let z600 = Zip3::parse("600").unwrap();
        assert_eq!(panel.series(z600)[0], None);
        assert!(!panel.is_complete(z600, |_| true));
        assert!(panel.is_complete(z600, |m| m.month == 10));
        assert_eq!(panel.drop_missing(z600).months.len(), 1);
    }
}
