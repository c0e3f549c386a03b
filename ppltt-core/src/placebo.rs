//! In-space placebo inference for the synthetic control.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::aggregate::{OutcomePanel, mean, quantile};
use crate::calendar::YearMonth;
use crate::config::{PlaceboPool, SynthConfig};
use crate::ols::{SimpleRegression, correlation, simple_regression};
use crate::synth::{SynthResult, synthetic_control};
use crate::types::Zip3;

#[derive(Debug, Clone, Serialize)]
pub struct PlaceboUnit {
    pub zip3: Zip3,
    pub is_treated: bool,
    pub pre_rmspe: f64,
    pub post_rmspe: f64,
    /// Post over pre RMSPE; `None` on an exact pre-period fit.
    pub ratio: Option<f64>,
    pub post_gap: f64,
    pub gap_ratio: Option<f64>,
    /// Mean pre-period outcome in levels.
    pub pre_level: Option<f64>,
    pub population: Option<f64>,
    #[serde(skip)]
    pub gaps: Vec<(YearMonth, f64)>,
}

impl PlaceboUnit {
    fn from_fit(
        result: &SynthResult,
        is_treated: bool,
        panel: &OutcomePanel,
        populations: Option<&HashMap<Zip3, f64>>,
    ) -> Self {
        let cutoff = result.cutoff;
        let pre_levels: Vec<f64> = panel
            .filter_months(|m| m < cutoff)
            .series(result.treated)
            .into_iter()
            .flatten()
            .map(f64::exp)
            .collect();
        Self {
            zip3: result.treated,
            is_treated,
            pre_rmspe: result.pre_rmspe,
            post_rmspe: result.post_rmspe,
            ratio: result.rmspe_ratio,
            post_gap: result.post_gap,
            gap_ratio: result.gap_ratio(),
            pre_level: mean(&pre_levels),
            population: populations.and_then(|p| p.get(&result.treated).copied()),
            gaps: result.series.iter().map(|p| (p.month, p.gap)).collect(),
        }
    }
}

/// Rank inference within one pre-fit subset.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdTest {
    pub label: String,
    pub multiplier: Option<f64>,
    pub cutoff_rmspe: Option<f64>,
    pub units: usize,
    /// 1 is the most extreme. `None` when the treated ratio is undefined.
    pub treated_rank: Option<usize>,
    /// Share of units with a ratio, treated included, whose ratio is >= the
    /// treated ratio.
    pub ratio_p: Option<f64>,
    /// Share of units, treated included, with |post gap| >= the treated |post gap|.
    pub gap_p: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SizeRegressions {
    pub good_fit_cutoff: f64,
    pub placebos: usize,
    pub ratio_on_population: Option<SimpleRegression>,
    pub ratio_on_pre_level: Option<SimpleRegression>,
    pub gap_ratio_on_pre_level: Option<SimpleRegression>,
    /// Population against ratio over good-fit units, treated included.
    pub population_ratio_corr: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceboAnalysis {
    pub treated: PlaceboUnit,
    /// Treated first, then placebos in ZIP3 order.
    pub units: Vec<PlaceboUnit>,
    pub failed: Vec<Zip3>,
    pub tests: Vec<ThresholdTest>,
    pub size: SizeRegressions,
}

impl PlaceboAnalysis {
    /// Units in the good-fit subset, ordered by descending ratio.
    pub fn top_by_ratio(&self, multiplier: f64, n: usize) -> Vec<&PlaceboUnit> {
        let cutoff = self.treated.pre_rmspe * multiplier;
        let mut units: Vec<&PlaceboUnit> = self
            .units
            .iter()
            .filter(|u| (u.pre_rmspe < cutoff || u.is_treated) && u.ratio.is_some())
            .collect();
        units.sort_by(|a, b| {
            let key = |u: &PlaceboUnit| u.ratio.unwrap_or(f64::NEG_INFINITY);
            key(b).total_cmp(&key(a))
        });
        units.truncate(n);
        units
    }
}

/// Units eligible as placebos under `pool`.
pub fn placebo_units(
    panel: &OutcomePanel,
    treated: Zip3,
    donors: &[Zip3],
    pool: PlaceboPool,
    cutoff: YearMonth,
) -> Vec<Zip3> {
    let donors: Vec<Zip3> = donors.iter().copied().filter(|d| *d != treated).collect();
    match pool {
        PlaceboPool::All => donors,
        PlaceboPool::TopQuartile => {
            let means: Vec<(Zip3, f64)> = donors
                .iter()
                .filter_map(|d| panel.unit_mean(*d, |m| m < cutoff).map(|v| (*d, v)))
                .collect();
            let values: Vec<f64> = means.iter().map(|(_, v)| *v).collect();
            let Some(q75) = quantile(&values, 0.75) else {
                return Vec::new();
            };
            means.into_iter().filter(|(_, v)| *v >= q75).map(|(d, _)| d).collect()
        }
    }
}

/// Rank tests over all units and over each pre-fit subset.
pub fn rank_tests(treated: &PlaceboUnit, units: &[PlaceboUnit], multipliers: &[f64]) -> Vec<ThresholdTest> {
    let mut multipliers = multipliers.to_vec();
    multipliers.sort_by(|a, b| b.total_cmp(a));
    std::iter::once(None)
        .chain(multipliers.into_iter().map(Some))
        .map(|m| {
            let cutoff = m.map(|m| m * treated.pre_rmspe);
            let subset: Vec<&PlaceboUnit> = units
                .iter()
                .filter(|u| u.is_treated || cutoff.is_none_or(|c| u.pre_rmspe < c))
                .collect();
            let n = subset.len().max(1);
            let ranked = subset.iter().filter(|u| u.ratio.is_some()).count().max(1);
            let extreme_ratio = treated
                .ratio
                .map(|t| subset.iter().filter(|u| u.ratio.is_some_and(|r| r >= t)).count());
            let extreme_gap = subset
                .iter()
                .filter(|u| u.post_gap.abs() >= treated.post_gap.abs())
                .count();
            ThresholdTest {
                label: m.map_or_else(|| "All".to_string(), |m| format!("{m}x")),
                multiplier: m,
                cutoff_rmspe: cutoff,
                units: subset.len(),
                treated_rank: extreme_ratio.map(|e| e.max(1)),
                ratio_p: extreme_ratio.map(|e| e as f64 / ranked as f64),
                gap_p: extreme_gap as f64 / n as f64,
            }
        })
        .collect()
}

fn size_regressions(treated: &PlaceboUnit, units: &[PlaceboUnit], multiplier: f64) -> SizeRegressions {
    let cutoff = treated.pre_rmspe * multiplier;
    let good: Vec<&PlaceboUnit> = units.iter().filter(|u| u.pre_rmspe < cutoff || u.is_treated).collect();
    let placebos: Vec<&PlaceboUnit> = good.iter().copied().filter(|u| !u.is_treated).collect();

    let pairs = |x: fn(&PlaceboUnit) -> Option<f64>, y: fn(&PlaceboUnit) -> Option<f64>| {
        let (xs, ys): (Vec<f64>, Vec<f64>) = placebos
            .iter()
            .filter_map(|u| Some((x(u)?, y(u)?)))
            .filter(|(a, b)| a.is_finite() && b.is_finite())
            .unzip();
        simple_regression(&xs, &ys)
    };

    let (pop, ratio): (Vec<f64>, Vec<f64>) = good
        .iter()
        .filter_map(|u| Some((u.population?, u.ratio?)))
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .unzip();

    SizeRegressions {
        good_fit_cutoff: cutoff,
        placebos: placebos.len(),
        ratio_on_population: pairs(|u| u.population.map(|p| p / 1e6), |u| u.ratio),
        ratio_on_pre_level: pairs(|u| u.pre_level, |u| u.ratio),
        gap_ratio_on_pre_level: pairs(|u| u.pre_level, |u| u.gap_ratio),
        population_ratio_corr: correlation(&pop, &ratio),
    }
}

/// Re-run the estimator with each placebo unit as treated.
///
/// Placebo pools exclude the real treated unit. Units whose fit fails are
/// reported in `failed` and left out of inference.
pub fn run_placebos(
    panel: &OutcomePanel,
    baseline: &SynthResult,
    donors: &[Zip3],
    config: &SynthConfig,
    end: YearMonth,
    populations: Option<&HashMap<Zip3, f64>>,
) -> PlaceboAnalysis {
    let cutoff = baseline.cutoff;
    let treated_zip3 = baseline.treated;
    let candidates = placebo_units(panel, treated_zip3, donors, config.placebo_pool, cutoff);

    let treated = PlaceboUnit::from_fit(baseline, true, panel, populations);
    let mut units = vec![treated.clone()];
    let mut failed = Vec::new();
    for unit in &candidates {
        let pool: Vec<Zip3> = candidates.iter().copied().filter(|d| d != unit).collect();
        match synthetic_control(panel, *unit, &pool, cutoff, end) {
            Ok(result) => units.push(PlaceboUnit::from_fit(&result, false, panel, populations)),
            Err(e) => {
                warn!(zip3 = %unit, error = %e, "placebo fit skipped");
                failed.push(*unit);
            }
        }
    }

    for u in &units {
        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "placebo",
            zip3 = u.zip3.as_str(),
            is_treated = u.is_treated,
            pre_rmspe = u.pre_rmspe,
            post_rmspe = u.post_rmspe,
            ratio = u.ratio,
            post_gap = u.post_gap,
            gap_ratio = u.gap_ratio,
        );
        #[cfg(not(feature = "instrument"))]
        let _ = u;
    }

    let tests = rank_tests(&treated, &units, &config.rmspe_thresholds);
    let size = size_regressions(&treated, &units, config.good_fit_multiplier);
    if let Some(all) = tests.first() {
        info!(
            placebos = units.len() - 1,
            failed = failed.len(),
            treated_ratio = treated.ratio,
            rank = all.treated_rank,
            p = all.ratio_p,
            "placebo inference"
        );
    }
    PlaceboAnalysis {
        treated,
        units,
        failed,
        tests,
        size,
    }
}
