//! Leave-k-out donor sensitivity for the synthetic control.

use serde::Serialize;
use tracing::{info, warn};

use crate::aggregate::{OutcomePanel, mean, std_dev};
use crate::calendar::YearMonth;
use crate::synth::{DonorWeight, SynthPoint, SynthResult, synthetic_control};
use crate::types::Zip3;

/// Every `k`-subset of `items`, in lexicographic index order.
pub fn combinations<T: Copy>(items: &[T], k: usize) -> Vec<Vec<T>> {
    let n = items.len();
    if k > n {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut idx: Vec<usize> = (0..k).collect();
    loop {
        out.push(idx.iter().map(|&i| items[i]).collect());
        // Rightmost index that can still advance.
        let Some(i) = (0..k).rev().find(|&i| idx[i] < n - k + i) else {
            return out;
        };
        idx[i] += 1;
        for j in i + 1..k {
            idx[j] = idx[j - 1] + 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaveOutRun {
    /// 0 is the baseline fit.
    pub k: usize,
    pub removed: Vec<Zip3>,
    pub rmse: f64,
    pub pre_gap: f64,
    pub post_gap: f64,
    #[serde(skip)]
    pub series: Vec<SynthPoint>,
}

impl LeaveOutRun {
    fn from_result(k: usize, removed: Vec<Zip3>, result: &SynthResult) -> Self {
        Self {
            k,
            removed,
            rmse: result.fit_rmse,
            pre_gap: result.pre_gap,
            post_gap: result.post_gap,
            series: result.series.clone(),
        }
    }

    pub fn removed_label(&self) -> String {
        self.removed.iter().map(Zip3::as_str).collect::<Vec<_>>().join(",")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KSummary {
    pub k: usize,
    pub runs: usize,
    pub mean_post_gap: f64,
    pub min_post_gap: f64,
    pub max_post_gap: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaveOutSummary {
    pub baseline_post_gap: f64,
    pub runs: usize,
    pub min_post_gap: f64,
    pub max_post_gap: f64,
    pub mean_post_gap: f64,
    pub std_post_gap: Option<f64>,
    pub same_sign: usize,
}

impl LeaveOutSummary {
    pub fn same_sign_share(&self) -> f64 {
        self.same_sign as f64 / self.runs.max(1) as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaveKOut {
    pub top_donors: Vec<DonorWeight>,
    /// Baseline first, then by k and combination.
    pub runs: Vec<LeaveOutRun>,
    pub by_k: Vec<KSummary>,
    pub overall: Option<LeaveOutSummary>,
    pub failed: Vec<Vec<Zip3>>,
}

fn summarize(baseline: f64, runs: &[LeaveOutRun], max_k: usize) -> (Vec<KSummary>, Option<LeaveOutSummary>) {
    let extremes = |gaps: &[f64]| {
        gaps.iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), g| (lo.min(*g), hi.max(*g)))
    };

    let by_k = (1..=max_k)
        .filter_map(|k| {
            let gaps: Vec<f64> = runs.iter().filter(|r| r.k == k).map(|r| r.post_gap).collect();
            let mean_post_gap = mean(&gaps)?;
            let (min_post_gap, max_post_gap) = extremes(&gaps);
            Some(KSummary {
                k,
                runs: gaps.len(),
                mean_post_gap,
                min_post_gap,
                max_post_gap,
            })
        })
        .collect();

    let gaps: Vec<f64> = runs.iter().filter(|r| r.k > 0).map(|r| r.post_gap).collect();
    let overall = mean(&gaps).map(|mean_post_gap| {
        let (min_post_gap, max_post_gap) = extremes(&gaps);
        let same_sign = if baseline < 0.0 {
            gaps.iter().filter(|g| **g < 0.0).count()
        } else {
            gaps.iter().filter(|g| **g > 0.0).count()
        };
        LeaveOutSummary {
            baseline_post_gap: baseline,
            runs: gaps.len(),
            min_post_gap,
            max_post_gap,
            mean_post_gap,
            std_post_gap: std_dev(&gaps),
            same_sign,
        }
    });
    (by_k, overall)
}

/// Drop every combination of up to `max_k` heavy donors and refit.
pub fn leave_k_out(
    panel: &OutcomePanel,
    baseline: &SynthResult,
    donors: &[Zip3],
    report_weight: f64,
    max_k: usize,
    end: YearMonth,
) -> LeaveKOut {
    let top_donors = baseline.top_donors(report_weight);
    let mut top: Vec<Zip3> = top_donors.iter().map(|w| w.zip3).collect();
    top.sort();
    let max_k = max_k.min(top.len());

    let mut runs = vec![LeaveOutRun::from_result(0, Vec::new(), baseline)];
    let mut failed = Vec::new();
    for k in 1..=max_k {
        let combos = combinations(&top, k);
        info!(k, combinations = combos.len(), "leave-k-out");
        for removed in combos {
            let remaining: Vec<Zip3> = donors.iter().copied().filter(|d| !removed.contains(d)).collect();
            match synthetic_control(panel, baseline.treated, &remaining, baseline.cutoff, end) {
                Ok(result) => runs.push(LeaveOutRun::from_result(k, removed, &result)),
                Err(e) => {
                    warn!(k, error = %e, "leave-k-out fit skipped");
                    failed.push(removed);
                }
            }
        }
    }

    for r in &runs {
        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "leave_k_out",
            k = r.k as u64,
            removed = r.removed_label().as_str(),
            rmse = r.rmse,
            pre_gap = r.pre_gap,
            post_gap = r.post_gap,
        );
        #[cfg(not(feature = "instrument"))]
        let _ = r;
    }

    let (by_k, overall) = summarize(baseline.post_gap, &runs, max_k);
    if let Some(o) = &overall {
        info!(
            runs = o.runs,
            min = o.min_post_gap,
            max = o.max_post_gap,
            same_sign = o.same_sign,
            "leave-k-out summary"
        );
    }
    LeaveKOut {
        top_donors,
        runs,
        by_k,
        overall,
        failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combinations_enumerate_in_order() {
        let items = ['a', 'b', 'c', 'd'];
        let c2 = combinations(&items, 2);
        assert_eq!(c2.len(), 6);
        assert_eq!(c2[0], vec!['a', 'b']);
        assert_eq!(c2[5], vec!['c', 'd']);
        assert_eq!(combinations(&items, 4), vec![items.to_vec()]);
        assert_eq!(combinations(&items, 0), vec![Vec::<char>::new()]);
        assert!(combinations(&items, 5).is_empty());
    }

    fn run(k: usize, post_gap: f64) -> LeaveOutRun {
        LeaveOutRun {
            k,
            removed: Vec::new(),
            rmse: 0.0,
            pre_gap: 0.0,
            post_gap,
            series: Vec::new(),
        }
    }

    #[test]
    fn summary_excludes_the_baseline() {
        let runs = vec![run(0, -0.2), run(1, -0.3), run(1, -0.1), run(2, 0.05)];
        let (by_k, overall) = summarize(-0.2, &runs, 2);
        assert_eq!(by_k.len(), 2);
        assert_eq!(by_k[0].runs, 2);
        assert!((by_k[0].mean_post_gap + 0.2).abs() < 1e-12);
        assert_eq!(by_k[0].min_post_gap, -0.3);
        let overall = overall.unwrap();
        assert_eq!(overall.runs, 3);
        assert_eq!(overall.same_sign, 2);
        assert!((overall.same_sign_share() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(overall.max_post_gap, 0.05);
    }
}
