//! Descriptive series: the treated market's prices, national price mix, and a
//! scan for other markets whose prices jumped.

use std::collections::BTreeMap;
use std::collections::HashSet;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::aggregate::{median, quantile};
use crate::calendar::YearMonth;
use crate::config::{DescribeConfig, StudyDates};
use crate::types::{Transaction, Zip3};

// ============================================================================
// Treated market
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TreatedMonth {
    pub month: YearMonth,
    /// Transactions with a parsed amount.
    pub transactions: usize,
    pub total_spend: f64,
    pub unique_users: usize,
    pub median: Option<f64>,
    pub p25: Option<f64>,
    pub p75: Option<f64>,
}

/// Monthly price distribution of `treated` for transactions before `end`.
pub fn treated_monthly_summary(transactions: &[Transaction], treated: Zip3, end: NaiveDate) -> Vec<TreatedMonth> {
    let mut groups: BTreeMap<YearMonth, (Vec<f64>, HashSet<&str>)> = BTreeMap::new();
    for t in transactions {
        if t.zip3 != Some(treated) || t.date >= end {
            continue;
        }
        let (amounts, users) = groups.entry(YearMonth::from_date(t.date)).or_default();
        if let Some(a) = t.amount {
            amounts.push(a);
        }
        users.insert(t.cardid.as_str());
    }
    groups
        .into_iter()
        .map(|(month, (amounts, users))| TreatedMonth {
            month,
            transactions: amounts.len(),
            total_spend: amounts.iter().sum(),
            unique_users: users.len(),
            median: median(&amounts),
            p25: quantile(&amounts, 0.25),
            p75: quantile(&amounts, 0.75),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct PassThroughCheck {
    pub label: String,
    pub rate: f64,
    pub from: NaiveDate,
    pub until: Option<NaiveDate>,
    /// Base price grossed up by the full tax.
    pub full_pass_through: f64,
    pub months: usize,
    /// Median of the monthly medians in the period.
    pub observed: Option<f64>,
    pub difference: Option<f64>,
}

/// Observed prices in each tax period against full pass-through.
pub fn pass_through_check(monthly: &[TreatedMonth], config: &DescribeConfig) -> Vec<PassThroughCheck> {
    let mut periods = config.tax_periods.clone();
    periods.sort_by_key(|p| p.from);
    periods
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let until = periods.get(i + 1).map(|next| next.from);
            let medians: Vec<f64> = monthly
                .iter()
                .filter(|m| {
                    let first = m.month.first_day();
                    first >= p.from && until.is_none_or(|u| first < u)
                })
                .filter_map(|m| m.median)
                .collect();
            let full_pass_through = config.base_price * (1.0 + p.rate);
            let observed = median(&medians);
            PassThroughCheck {
                label: p.label.clone(),
                rate: p.rate,
                from: p.from,
                until,
                full_pass_through,
                months: medians.len(),
                observed,
                difference: observed.map(|o| o - full_pass_through),
            }
        })
        .collect()
}

/// Treated-market price level around the treatment date.
#[derive(Debug, Clone, Serialize)]
pub struct PriceStats {
    /// Mean of monthly medians over the study months before treatment.
    pub pre_mean: Option<f64>,
    pub post_mean: Option<f64>,
    pub treatment_month: Option<f64>,
}

pub fn price_stats(monthly: &[TreatedMonth], dates: &StudyDates) -> PriceStats {
    let cutoff = dates.treatment_month();
    let in_study: Vec<&TreatedMonth> = monthly
        .iter()
        .filter(|m| dates.contains(m.month.first_day()))
        .collect();
    let mean_where = |post: bool| {
        let medians: Vec<f64> = in_study
            .iter()
            .filter(|m| (m.month >= cutoff) == post)
            .filter_map(|m| m.median)
            .collect();
        crate::aggregate::mean(&medians)
    };
    PriceStats {
        pre_mean: mean_where(false),
        post_mean: mean_where(true),
        treatment_month: in_study.iter().find(|m| m.month == cutoff).and_then(|m| m.median),
    }
}

// ============================================================================
// National price mix
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PriceBucket {
    Plus,
    Pro,
    Other,
}

impl PriceBucket {
    pub fn of(amount: Option<f64>) -> Self {
        match amount {
            Some(a) if (20.0..=25.0).contains(&a) => PriceBucket::Plus,
            Some(a) if (200.0..=250.0).contains(&a) => PriceBucket::Pro,
            _ => PriceBucket::Other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PriceBucket::Plus => "$20-25 (Plus)",
            PriceBucket::Pro => "$200-250 (Pro)",
            PriceBucket::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketMonth {
    pub month: YearMonth,
    pub plus: usize,
    pub pro: usize,
    pub other: usize,
}

impl BucketMonth {
    pub fn total(&self) -> usize {
        self.plus + self.pro + self.other
    }

    /// Percent shares in `Plus, Pro, Other` order.
    pub fn shares(&self) -> [f64; 3] {
        let total = self.total().max(1) as f64;
        [self.plus, self.pro, self.other].map(|n| 100.0 * n as f64 / total)
    }
}

/// Monthly transaction counts by price bucket across every ZIP3.
pub fn price_buckets(transactions: &[Transaction]) -> Vec<BucketMonth> {
    let mut months: BTreeMap<YearMonth, BucketMonth> = BTreeMap::new();
    for t in transactions {
        let month = YearMonth::from_date(t.date);
        let row = months.entry(month).or_insert(BucketMonth {
            month,
            plus: 0,
            pro: 0,
            other: 0,
        });
        match PriceBucket::of(t.amount) {
            PriceBucket::Plus => row.plus += 1,
            PriceBucket::Pro => row.pro += 1,
            PriceBucket::Other => row.other += 1,
        }
    }
    months.into_values().collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketPeriod {
    pub label: String,
    pub months: usize,
    pub plus_pct: f64,
    pub pro_pct: f64,
    pub other_pct: f64,
}

/// Mean monthly shares before and after `split`.
pub fn bucket_periods(monthly: &[BucketMonth], split: NaiveDate) -> Vec<BucketPeriod> {
    let before = format!("before {split}");
    let after = format!("{split} onward");
    [(before, false), (after, true)]
        .into_iter()
        .filter_map(|(label, post)| {
            let rows: Vec<[f64; 3]> = monthly
                .iter()
                .filter(|m| (m.month.first_day() >= split) == post)
                .map(BucketMonth::shares)
                .collect();
            if rows.is_empty() {
                return None;
            }
            let n = rows.len() as f64;
            let col = |i: usize| rows.iter().map(|r| r[i]).sum::<f64>() / n;
            Some(BucketPeriod {
                label,
                months: rows.len(),
                plus_pct: col(0),
                pro_pct: col(1),
                other_pct: col(2),
            })
        })
        .collect()
}

// ============================================================================
// Tax-change scan
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PriceChange {
    pub zip3: Zip3,
    pub area: Option<&'static str>,
    pub baseline_median: f64,
    pub baseline_n: usize,
    pub comparison_median: f64,
    pub comparison_n: usize,
    pub pct_change: f64,
    pub flagged: bool,
}

/// Median price change per ZIP3 between two months, largest increase first.
pub fn tax_change_scan(transactions: &[Transaction], config: &DescribeConfig) -> Vec<PriceChange> {
    let mut amounts: BTreeMap<(Zip3, bool), Vec<f64>> = BTreeMap::new();
    for t in transactions {
        let (Some(zip3), Some(amount)) = (t.zip3, t.amount) else { continue };
        let month = YearMonth::from_date(t.date);
        let is_comparison = if month == config.scan_baseline {
            false
        } else if month == config.scan_comparison {
            true
        } else {
            continue;
        };
        amounts.entry((zip3, is_comparison)).or_default().push(amount);
    }

    let mut changes: Vec<PriceChange> = amounts
        .iter()
        .filter(|((_, is_comparison), _)| !is_comparison)
        .filter_map(|((zip3, _), base)| {
            let comp = amounts.get(&(*zip3, true))?;
            if base.len() < config.scan_min_trans || comp.len() < config.scan_min_trans {
                return None;
            }
            let baseline_median = median(base)?;
            let comparison_median = median(comp)?;
            let pct_change = 100.0 * (comparison_median - baseline_median) / baseline_median;
            Some(PriceChange {
                zip3: *zip3,
                area: zip3.area_name(),
                baseline_median,
                baseline_n: base.len(),
                comparison_median,
                comparison_n: comp.len(),
                pct_change,
                flagged: pct_change >= config.scan_flag_pct,
            })
        })
        .collect();
    changes.sort_by(|a, b| b.pct_change.total_cmp(&a.pct_change).then(a.zip3.cmp(&b.zip3)));

    info!(
        baseline = %config.scan_baseline,
        comparison = %config.scan_comparison,
        zip3s = changes.len(),
        flagged = changes.iter().filter(|c| c.flagged).count(),
        "scanned for price changes"
    );
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(zip: &str, y: i32, m: u32, amount: Option<f64>, card: &str) -> Transaction {
        Transaction {
            cardid: card.into(),
            date: NaiveDate::from_ymd_opt(y, m, 15).unwrap(),
            amount,
            merchid: "m".into(),
            service: "chatgpt".into(),
            zip3: Zip3::parse(zip),
        }
    }

    #[test]
    fn treated_summary_ignores_other_markets() {
        let trans = vec![
            tx("606", 2023, 9, Some(20.0), "a"),
            tx("606", 2023, 9, Some(20.0), "a"),
            tx("606", 2023, 9, None, "b"),
            tx("606", 2023, 10, Some(21.8), "a"),
            tx("600", 2023, 10, Some(99.0), "c"),
            tx("606", 2026, 1, Some(21.8), "a"),
        ];
        let end = NaiveDate::from_ymd_opt(2025, 12, 1).unwrap();
        let monthly = treated_monthly_summary(&trans, Zip3::CHICAGO, end);
        assert_eq!(monthly.len(), 2);
        assert_eq!(monthly[0].transactions, 2);
        assert_eq!(monthly[0].unique_users, 2);
        assert_eq!(monthly[1].median, Some(21.8));
    }

    #[test]
    fn pass_through_splits_at_the_next_rate() {
        let month = |y, m, med| TreatedMonth {
            month: YearMonth::new(y, m).unwrap(),
            transactions: 1,
            total_spend: med,
            unique_users: 1,
            median: Some(med),
            p25: None,
            p75: None,
        };
        let monthly = vec![
            month(2023, 9, 20.0),
            month(2023, 10, 21.8),
            month(2024, 6, 21.8),
            month(2024, 12, 21.0),
            month(2025, 1, 22.2),
        ];
        let checks = pass_through_check(&monthly, &DescribeConfig::default());
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].months, 3);
        assert!((checks[0].full_pass_through - 21.8).abs() < 1e-9);
        assert!((checks[0].observed.unwrap() - 21.8).abs() < 1e-9);
        assert_eq!(checks[1].months, 1);
        assert!((checks[1].difference.unwrap()).abs() < 1e-9);

        let stats = price_stats(&monthly, &StudyDates::default());
        assert_eq!(stats.pre_mean, Some(20.0));
        // 2024-12 and 2025-01 fall after the study end.
        assert!((stats.post_mean.unwrap() - 21.8).abs() < 1e-9);
        assert_eq!(stats.treatment_month, Some(21.8));
    }

    #[test]
    fn buckets_split_by_price() {
        assert_eq!(PriceBucket::of(Some(21.8)), PriceBucket::Plus);
        assert_eq!(PriceBucket::of(Some(218.0)), PriceBucket::Pro);
        assert_eq!(PriceBucket::of(Some(30.0)), PriceBucket::Other);
        assert_eq!(PriceBucket::of(None), PriceBucket::Other);

        let trans = vec![
            tx("606", 2024, 11, Some(20.0), "a"),
            tx("600", 2024, 11, Some(20.0), "b"),
            tx("600", 2024, 12, Some(200.0), "b"),
            tx("600", 2024, 12, Some(20.0), "c"),
        ];
        let monthly = price_buckets(&trans);
        assert_eq!(monthly[0].shares(), [100.0, 0.0, 0.0]);
        assert_eq!(monthly[1].shares(), [50.0, 50.0, 0.0]);
        let periods = bucket_periods(&monthly, NaiveDate::from_ymd_opt(2024, 12, 1).unwrap());
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[1].pro_pct, 50.0);
    }

    #[test]
    fn scan_requires_volume_in_both_months() {
        let mut trans = Vec::new();
        for i in 0..50 {
            let card = format!("c{i}");
            trans.push(tx("606", 2023, 3, Some(20.0), &card));
            trans.push(tx("606", 2024, 11, Some(21.8), &card));
            trans.push(tx("600", 2023, 3, Some(20.0), &card));
            trans.push(tx("600", 2024, 11, Some(20.0), &card));
            if i < 49 {
                trans.push(tx("601", 2023, 3, Some(20.0), &card));
            }
            trans.push(tx("601", 2024, 11, Some(25.0), &card));
        }
        let changes = tax_change_scan(&trans, &DescribeConfig::default());
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].zip3, Zip3::CHICAGO);
        assert!((changes[0].pct_change - 9.0).abs() < 1e-9);
        assert!(changes[0].flagged);
        assert_eq!(changes[0].area, Some("Chicago, IL"));
        assert!(!changes[1].flagged);
    }
}
