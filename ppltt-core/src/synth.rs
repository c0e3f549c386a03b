//! Synthetic control.
//!
//! Donor weights minimise the pre-period mean squared error between the
//! treated series and the weighted donor series, constrained to the unit
//! simplex. The solver is accelerated projected gradient with an exact
//! Euclidean projection onto the simplex.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::{debug, info};

use crate::aggregate::{OutcomePanel, aggregate_monthly, mean};
use crate::calendar::YearMonth;
use crate::config::AnalysisConfig;
use crate::donors::{DonorPool, select_size_matched};
use crate::error::{AnalysisError, Result};
use crate::types::{Transaction, Zip3};

const MAX_ITERATIONS: usize = 50_000;
const TOLERANCE: f64 = 1e-12;
/// Donors at or below this weight are left out of the synthetic series.
const ACTIVE_WEIGHT: f64 = 1e-8;

// ============================================================================
// Simplex-constrained least squares
// ============================================================================

/// Euclidean projection of `v` onto `{w : w >= 0, sum(w) = 1}`.
pub fn project_to_simplex(v: &DVector<f64>) -> DVector<f64> {
    let mut u: Vec<f64> = v.iter().copied().collect();
    u.sort_by(|a, b| b.total_cmp(a));
    let mut cumsum = 0.0;
    let mut theta = 0.0;
    for (j, uj) in u.iter().enumerate() {
        cumsum += uj;
        let t = (cumsum - 1.0) / (j + 1) as f64;
        if uj - t > 0.0 {
            theta = t;
        }
    }
    v.map(|x| (x - theta).max(0.0))
}

#[derive(Debug, Clone)]
pub struct SimplexFit {
    pub weights: DVector<f64>,
    pub mse: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Minimise `mean((y - X w)^2)` over the simplex, starting from equal weights.
/// `x` is months by donors.
pub fn fit_weights(y: &DVector<f64>, x: &DMatrix<f64>) -> Result<SimplexFit> {
    let (t, j) = x.shape();
    if j == 0 || t == 0 || y.len() != t {
        return Err(AnalysisError::Numerical(format!(
            "weight fit needs a non-empty {t}x{j} donor matrix matching {} targets",
            y.len()
        )));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(AnalysisError::Numerical("non-finite value in weight fit".into()));
    }
    let tf = t as f64;
    let gram = x.transpose() * x / tf;
    let xty = x.transpose() * y / tf;
    let yy = y.norm_squared() / tf;
    let objective = |w: &DVector<f64>| (w.dot(&(&gram * w)) - 2.0 * xty.dot(w) + yy).max(0.0);

    // 2 * trace(G) bounds the gradient's Lipschitz constant.
    let lipschitz = 2.0 * gram.trace();
    if lipschitz <= 0.0 {
        let w = DVector::from_element(j, 1.0 / j as f64);
        let mse = objective(&w);
        return Ok(SimplexFit {
            weights: w,
            mse,
            iterations: 0,
            converged: true,
        });
    }
    let step = 1.0 / lipschitz;

    let mut w = DVector::from_element(j, 1.0 / j as f64);
    let mut v = w.clone();
    let mut momentum = 1.0_f64;
    let mut f_prev = objective(&w);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < MAX_ITERATIONS {
        iterations += 1;
        let grad = (&gram * &v - &xty) * 2.0;
        let next = project_to_simplex(&(&v - grad * step));
        let f_next = objective(&next);

        if f_next > f_prev && momentum > 1.0 {
            // Restart momentum when the objective goes up.
            v = w.clone();
            momentum = 1.0;
            continue;
        }

        let delta = (&next - &w).amax();
        let next_momentum = (1.0 + (1.0 + 4.0 * momentum * momentum).sqrt()) / 2.0;
        v = &next + (&next - &w) * ((momentum - 1.0) / next_momentum);
        momentum = next_momentum;
        w = next;
        f_prev = f_next;

        if delta < TOLERANCE {
            converged = true;
            break;
        }
    }
    debug!(donors = j, months = t, iterations, converged, mse = f_prev, "weights fitted");
    Ok(SimplexFit {
        weights: w,
        mse: f_prev,
        iterations,
        converged,
    })
}

// ============================================================================
// Synthetic control on an outcome panel
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SynthPoint {
    pub month: YearMonth,
    pub treated: f64,
    pub synthetic: f64,
    pub gap: f64,
    pub post: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DonorWeight {
    pub zip3: Zip3,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodComparison {
    pub period: &'static str,
    pub months: usize,
    pub treated_mean: f64,
    pub synthetic_mean: f64,
    pub difference: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthResult {
    pub treated: Zip3,
    pub cutoff: YearMonth,
    /// Donors complete in the pre-period, with their fitted weights.
    pub weights: Vec<DonorWeight>,
    pub fit_months: usize,
    pub fit_rmse: f64,
    pub iterations: usize,
    pub series: Vec<SynthPoint>,
    pub pre_rmspe: f64,
    pub post_rmspe: f64,
    /// `None` when the pre-period fit is exact.
    pub rmspe_ratio: Option<f64>,
    pub pre_gap: f64,
    pub post_gap: f64,
}

impl SynthResult {
    /// Donors above `threshold`, heaviest first.
    pub fn top_donors(&self, threshold: f64) -> Vec<DonorWeight> {
        let mut top: Vec<DonorWeight> = self
            .weights
            .iter()
            .filter(|w| w.weight > threshold)
            .cloned()
            .collect();
        top.sort_by(|a, b| b.weight.total_cmp(&a.weight).then(a.zip3.cmp(&b.zip3)));
        top
    }

    /// Post-period mean gap as a percentage change in levels.
    pub fn effect_pct(&self) -> f64 {
        (self.post_gap.exp() - 1.0) * 100.0
    }

    /// `post_gap / pre_rmspe`; `None` on an exact pre-period fit.
    pub fn gap_ratio(&self) -> Option<f64> {
        over_pre_rmspe(self.post_gap, self.pre_rmspe)
    }

    pub fn period_comparison(&self) -> Vec<PeriodComparison> {
        [("pre", false), ("post", true)]
            .into_iter()
            .filter_map(|(period, post)| {
                let pts: Vec<&SynthPoint> = self.series.iter().filter(|p| p.post == post).collect();
                let treated_mean = mean(&pts.iter().map(|p| p.treated).collect::<Vec<_>>())?;
                let synthetic_mean = mean(&pts.iter().map(|p| p.synthetic).collect::<Vec<_>>())?;
                Some(PeriodComparison {
                    period,
                    months: pts.len(),
                    treated_mean,
                    synthetic_mean,
                    difference: treated_mean - synthetic_mean,
                })
            })
            .collect()
    }
}

fn over_pre_rmspe(value: f64, pre_rmspe: f64) -> Option<f64> {
    (pre_rmspe > 0.0 && pre_rmspe.is_finite()).then(|| value / pre_rmspe)
}

fn rms(xs: &[f64]) -> f64 {
    mean(&xs.iter().map(|x| x * x).collect::<Vec<_>>()).map_or(f64::NAN, f64::sqrt)
}

/// Fit `treated` against `donors` on months before `cutoff`.
///
/// Months at or after `end`, and months where the treated unit is missing,
/// are dropped. Donors must be
/// observed in every pre-period month; at least two such donors and three
/// pre-period months are required.
pub fn synthetic_control(
    panel: &OutcomePanel,
    treated: Zip3,
    donors: &[Zip3],
    cutoff: YearMonth,
    end: YearMonth,
) -> Result<SynthResult> {
    if !panel.has_unit(treated) {
        return Err(AnalysisError::MissingTreatedUnit {
            zip3: treated.to_string(),
            context: "in the outcome panel".into(),
        });
    }
    let panel = panel.filter_months(|m| m < end).drop_missing(treated);
    let is_pre = |m: YearMonth| m < cutoff;

    let valid: Vec<Zip3> = donors
        .iter()
        .copied()
        .filter(|d| *d != treated && panel.is_complete(*d, is_pre))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if valid.len() < 2 {
        return Err(AnalysisError::InsufficientDonors {
            needed: 2,
            found: valid.len(),
        });
    }

    let pre_rows: Vec<usize> = (0..panel.months.len())
        .filter(|&r| is_pre(panel.months[r]))
        .collect();
    if pre_rows.len() < 3 {
        return Err(AnalysisError::empty(format!(
            "selecting pre-period months for {treated} (found {}, need 3)",
            pre_rows.len()
        )));
    }

    let y = DVector::from_iterator(
        pre_rows.len(),
        pre_rows.iter().map(|&r| panel.get(r, treated).unwrap_or(f64::NAN)),
    );
    let x = DMatrix::from_fn(pre_rows.len(), valid.len(), |i, j| {
        panel.get(pre_rows[i], valid[j]).unwrap_or(f64::NAN)
    });
    let fit = fit_weights(&y, &x)?;

    let active: Vec<(Zip3, f64)> = valid
        .iter()
        .zip(fit.weights.iter())
        .filter(|(_, w)| **w > ACTIVE_WEIGHT)
        .map(|(z, w)| (*z, *w))
        .collect();

    let mut series = Vec::new();
    for (r, &month) in panel.months.iter().enumerate() {
        let Some(treated_value) = panel.get(r, treated) else { continue };
        let synthetic: Option<f64> = active
            .iter()
            .map(|(z, w)| panel.get(r, *z).map(|v| v * w))
            .sum();
        if let Some(synthetic) = synthetic {
            series.push(SynthPoint {
                month,
                treated: treated_value,
                synthetic,
                gap: treated_value - synthetic,
                post: !is_pre(month),
            });
        }
    }

    let pre_gaps: Vec<f64> = series.iter().filter(|p| !p.post).map(|p| p.gap).collect();
    let post_gaps: Vec<f64> = series.iter().filter(|p| p.post).map(|p| p.gap).collect();
    if post_gaps.is_empty() {
        return Err(AnalysisError::empty(format!("selecting post-period months for {treated}")));
    }
    let pre_rmspe = rms(&pre_gaps);
    let post_rmspe = rms(&post_gaps);

    Ok(SynthResult {
        treated,
        cutoff,
        weights: valid
            .iter()
            .zip(fit.weights.iter())
            .map(|(z, w)| DonorWeight { zip3: *z, weight: *w })
            .collect(),
        fit_months: pre_rows.len(),
        fit_rmse: fit.mse.sqrt(),
        iterations: fit.iterations,
        pre_rmspe,
        post_rmspe,
        rmspe_ratio: over_pre_rmspe(post_rmspe, pre_rmspe),
        pre_gap: mean(&pre_gaps).unwrap_or(f64::NAN),
        post_gap: mean(&post_gaps).unwrap_or(f64::NAN),
        series,
    })
}

// ============================================================================
// From transactions
// ============================================================================

#[derive(Debug, Clone)]
pub struct SynthAnalysis {
    pub pool: DonorPool,
    pub panel: OutcomePanel,
    pub result: SynthResult,
}

/// Monthly log-outcome panel for the pool's units inside the study window.
pub fn outcome_panel(
    transactions: &[Transaction],
    pool: &DonorPool,
    config: &AnalysisConfig,
) -> OutcomePanel {
    let units: BTreeSet<Zip3> = pool.units().into_iter().collect();
    let sample: Vec<Transaction> = transactions
        .iter()
        .filter(|t| t.zip3.is_some_and(|z| units.contains(&z)) && config.study.contains(t.date))
        .cloned()
        .collect();
    OutcomePanel::from_monthly(&aggregate_monthly(&sample), config.sample.outcome)
}

/// Size-matched donor pool, outcome panel, and the baseline fit.
pub fn run_synth(transactions: &[Transaction], config: &AnalysisConfig) -> Result<SynthAnalysis> {
    let treated = config.sample.treated;
    let pool = select_size_matched(transactions, treated, &config.study, &config.donors)?;
    let panel = outcome_panel(transactions, &pool, config);
    let result = synthetic_control(
        &panel,
        treated,
        &pool.donors,
        config.study.treatment_month(),
        YearMonth::from_date(config.study.end),
    )?;

    let top = result.top_donors(config.synth.report_weight);
    info!(
        outcome = config.sample.outcome.label(),
        donors = result.weights.len(),
        top_donors = top.len(),
        fit_rmse = result.fit_rmse,
        pre_rmspe = result.pre_rmspe,
        post_rmspe = result.post_rmspe,
        ratio = result.rmspe_ratio,
        post_gap = result.post_gap,
        "synthetic control"
    );
    for (rank, w) in top.iter().enumerate() {
        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "donor_weight",
            rank = (rank + 1) as u64,
            zip3 = w.zip3.as_str(),
            weight = w.weight,
        );
        #[cfg(not(feature = "instrument"))]
        let _ = (rank, w);
    }
    Ok(SynthAnalysis {
        pool,
        panel,
        result,
    })
}
