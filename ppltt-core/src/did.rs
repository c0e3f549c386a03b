//! Two-way fixed-effects difference-in-differences and event study.
//!
//! The panel is ZIP3 by period (week or month) of log transaction counts,
//! restricted to the treated unit and its size-matched controls. Every
//! regression absorbs ZIP3 and calendar-month fixed effects and clusters
//! standard errors by ZIP3.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::aggregate::{aggregate_monthly, aggregate_weekly};
use crate::calendar::YearMonth;
use crate::config::{AnalysisConfig, DidFrequency, StudyDates};
use crate::donors::{DonorPool, select_size_matched};
use crate::error::{AnalysisError, Result};
use crate::ols::{Coefficient, CovType, DesignBuilder, OlsFit, WaldTest};
use crate::types::{Transaction, Zip3};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DidObservation {
    pub zip3: Zip3,
    pub period_start: NaiveDate,
    pub month: YearMonth,
    pub n_trans: usize,
    pub log_trans: f64,
    pub treated: bool,
    pub post: bool,
}

impl DidObservation {
    pub fn treated_post(&self) -> bool {
        self.treated && self.post
    }
}

/// ZIP3-period panel for the pool's units inside `[start, end)`.
pub fn build_panel(
    transactions: &[Transaction],
    pool: &DonorPool,
    dates: &StudyDates,
    frequency: DidFrequency,
) -> Vec<DidObservation> {
    let units: BTreeSet<Zip3> = pool.units().into_iter().collect();
    let sample: Vec<Transaction> = transactions
        .iter()
        .filter(|t| t.zip3.is_some_and(|z| units.contains(&z)) && dates.contains(t.date))
        .cloned()
        .collect();

    let cells: Vec<(Zip3, NaiveDate, YearMonth, usize)> = match frequency {
        DidFrequency::Weekly => aggregate_weekly(&sample)
            .into_iter()
            .map(|w| (w.zip3, w.week_start, w.month, w.n_trans))
            .collect(),
        DidFrequency::Monthly => aggregate_monthly(&sample)
            .into_iter()
            .map(|m| (m.zip3, m.month.first_day(), m.month, m.n_trans))
            .collect(),
    };

    cells
        .into_iter()
        .map(|(zip3, period_start, month, n_trans)| DidObservation {
            zip3,
            period_start,
            month,
            n_trans,
            log_trans: (n_trans as f64).ln(),
            treated: zip3 == pool.treated,
            post: period_start >= dates.treatment,
        })
        .collect()
}

fn base_design(panel: &[DidObservation]) -> DesignBuilder {
    let zips: Vec<Zip3> = panel.iter().map(|o| o.zip3).collect();
    let months: Vec<YearMonth> = panel.iter().map(|o| o.month).collect();
    DesignBuilder::new(panel.len())
        .intercept()
        .fixed_effects("zip3", &zips)
        .fixed_effects("month", &months)
}

fn cluster_ids(panel: &[DidObservation]) -> Vec<usize> {
    let ids: BTreeMap<Zip3, usize> = panel
        .iter()
        .map(|o| o.zip3)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .enumerate()
        .map(|(i, z)| (z, i))
        .collect();
    panel.iter().map(|o| ids[&o.zip3]).collect()
}

fn log_outcome(panel: &[DidObservation]) -> Vec<f64> {
    panel.iter().map(|o| o.log_trans).collect()
}

// ============================================================================
// Pooled estimate
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TwfeResult {
    pub treated_post: Coefficient,
    pub nobs: usize,
    pub clusters: usize,
    pub periods: usize,
    pub r_squared: f64,
}

/// `log_trans ~ treated_post + FE(zip3) + FE(month)`, clustered by ZIP3.
pub fn twfe(panel: &[DidObservation]) -> Result<TwfeResult> {
    if !panel.iter().any(|o| o.treated_post()) {
        return Err(AnalysisError::empty("restricting to treated post-period observations"));
    }
    let tp: Vec<f64> = panel.iter().map(|o| f64::from(u8::from(o.treated_post()))).collect();
    let design = base_design(panel)
        .column("treated_post", tp)
        .build(log_outcome(panel))?;

    let fit = OlsFit::fit(&design, CovType::Cluster(cluster_ids(panel)))?;
    let treated_post = fit
        .coef("treated_post")
        .ok_or_else(|| AnalysisError::Numerical("treated_post missing from fit".into()))?;
    let periods = panel.iter().map(|o| o.period_start).collect::<BTreeSet<_>>().len();
    info!(
        coef = treated_post.estimate,
        se = treated_post.std_err,
        p = treated_post.p,
        nobs = fit.nobs,
        "twfe treated x post"
    );
    Ok(TwfeResult {
        treated_post,
        nobs: fit.nobs,
        clusters: fit.clusters.unwrap_or(0),
        periods,
        r_squared: fit.r_squared,
    })
}

// ============================================================================
// Event study
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EventCoefficient {
    pub month: YearMonth,
    pub coef: f64,
    pub se: f64,
    /// `|coef| > 1.96 se` with a positive standard error.
    pub significant: bool,
}

#[derive(Debug, Clone)]
pub struct EventStudy {
    pub reference: YearMonth,
    pub coefficients: Vec<EventCoefficient>,
    fit: OlsFit,
    dummies: BTreeMap<YearMonth, String>,
}

fn dummy_name(m: YearMonth) -> String {
    format!("treat_{}_{:02}", m.year, m.month)
}

/// Treated-by-month interactions for every month the treated unit is
/// observed, except `reference`, which is reported as zero.
pub fn event_study(panel: &[DidObservation], reference: YearMonth) -> Result<EventStudy> {
    let treated_months: BTreeSet<YearMonth> =
        panel.iter().filter(|o| o.treated).map(|o| o.month).collect();
    if !treated_months.contains(&reference) {
        return Err(AnalysisError::MissingTreatedUnit {
            zip3: panel
                .iter()
                .find(|o| o.treated)
                .map_or_else(|| "treated unit".to_string(), |o| o.zip3.to_string()),
            context: format!("in reference month {reference}"),
        });
    }

    let mut design = base_design(panel);
    let mut dummies = BTreeMap::new();
    for &m in treated_months.iter().filter(|m| **m != reference) {
        let name = dummy_name(m);
        let values = panel
            .iter()
            .map(|o| f64::from(u8::from(o.treated && o.month == m)))
            .collect();
        design = design.column(name.clone(), values);
        dummies.insert(m, name);
    }
    let design = design.build(log_outcome(panel))?;
    let fit = OlsFit::fit(&design, CovType::Cluster(cluster_ids(panel)))?;

    let mut coefficients = Vec::with_capacity(treated_months.len());
    for &m in &treated_months {
        let (coef, se) = match dummies.get(&m).and_then(|name| fit.coef(name)) {
            Some(c) => (c.estimate, c.std_err),
            None => (0.0, 0.0),
        };
        coefficients.push(EventCoefficient {
            month: m,
            coef,
            se,
            significant: se > 0.0 && coef.abs() > 1.96 * se,
        });

        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "event_study",
            month = %m,
            coef = coef,
            se = se,
            reference = m == reference,
        );
    }

    Ok(EventStudy {
        reference,
        coefficients,
        fit,
        dummies,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PretrendTest {
    pub months: Vec<YearMonth>,
    pub wald: WaldTest,
    pub min_coef: f64,
    pub max_coef: f64,
    pub mean_abs_coef: f64,
}

impl EventStudy {
    /// Joint F test that every pre-period interaction in `[start, treatment)`
    /// other than the reference month is zero.
    pub fn pretrend_test(&self, start: YearMonth, treatment: YearMonth) -> Result<PretrendTest> {
        let months: Vec<YearMonth> = self
            .dummies
            .keys()
            .copied()
            .filter(|m| *m >= start && *m < treatment)
            .collect();
        if months.is_empty() {
            return Err(AnalysisError::empty("selecting pre-trend months"));
        }
        let mut indices = Vec::with_capacity(months.len());
        let mut coefs = Vec::with_capacity(months.len());
        for m in &months {
            let idx = self
                .dummies
                .get(m)
                .and_then(|name| self.fit.index(name))
                .ok_or_else(|| AnalysisError::Numerical(format!("no interaction for {m}")))?;
            indices.push(idx);
            coefs.push(self.fit.params[idx]);
        }
        let wald = self.fit.wald_test(&indices)?;
        let min_coef = coefs.iter().copied().fold(f64::INFINITY, f64::min);
        let max_coef = coefs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean_abs_coef = coefs.iter().map(|c| c.abs()).sum::<f64>() / coefs.len() as f64;
        info!(f = wald.f, p = wald.p, q = wald.df_num, "pre-trend joint test");
        Ok(PretrendTest {
            months,
            wald,
            min_coef,
            max_coef,
            mean_abs_coef,
        })
    }
}

// ============================================================================
// Full analysis
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DidAnalysis {
    pub pool: DonorPool,
    pub panel: Vec<DidObservation>,
    pub twfe: TwfeResult,
    pub event_study: Vec<EventCoefficient>,
    pub pretrend: Option<PretrendTest>,
}

/// Select controls, build the panel, and run all three estimates.
pub fn run_did(transactions: &[Transaction], config: &AnalysisConfig) -> Result<DidAnalysis> {
    let treated = config.sample.treated;
    let pool = select_size_matched(transactions, treated, &config.study, &config.donors)?;
    let panel = build_panel(transactions, &pool, &config.study, config.did.frequency);
    if panel.is_empty() {
        return Err(AnalysisError::empty("building the DiD panel"));
    }
    let units = panel.iter().map(|o| o.zip3).collect::<BTreeSet<_>>().len();
    info!(obs = panel.len(), units, controls = units - 1, "did panel");

    let twfe = twfe(&panel)?;
    let es = event_study(&panel, config.did.reference_month)?;
    let pretrend = match es.pretrend_test(config.did.pretrend_start, config.study.treatment_month()) {
        Ok(t) => Some(t),
        Err(AnalysisError::EmptySample { .. }) => None,
        Err(e) => return Err(e),
    };
    Ok(DidAnalysis {
        pool,
        panel,
        twfe,
        event_study: es.coefficients,
        pretrend,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// Deterministic monthly panel: unit effect + month effect + effect
    /// on the treated unit after treatment + small alternating noise.
    fn synthetic_panel(effect: f64) -> Vec<DidObservation> {
        let treated = Zip3::CHICAGO;
        let units: Vec<Zip3> = ["600", "601", "602", "603", "604", "606"]
            .iter()
            .map(|z| Zip3::parse(z).unwrap())
            .collect();
        let months = YearMonth::range_inclusive(YearMonth::new(2023, 3).unwrap(), YearMonth::new(2024, 2).unwrap());
        let mut out = Vec::new();
        for (u, &zip3) in units.iter().enumerate() {
            for (t, &m) in months.iter().enumerate() {
                let post = m.first_day() >= d(2023, 10, 1);
                let is_treated = zip3 == treated;
                let noise = if (u + t) % 2 == 0 { 0.01 } else { -0.01 };
                let y = 3.0 + 0.1 * u as f64 + 0.05 * t as f64
                    + if is_treated && post { effect } else { 0.0 }
                    + noise;
                out.push(DidObservation {
                    zip3,
                    period_start: m.first_day(),
                    month: m,
                    n_trans: y.exp().round() as usize,
                    log_trans: y,
                    treated: is_treated,
                    post,
                });
            }
        }
        out
    }

    #[test]
    fn twfe_recovers_injected_effect() {
        let result = twfe(&synthetic_panel(-0.2)).unwrap();
        assert!(
            (result.treated_post.estimate + 0.2).abs() < 0.02,
            "estimate {}",
            result.treated_post.estimate
        );
        assert_eq!(result.clusters, 6);
        assert_eq!(result.nobs, 72);
        assert_eq!(result.periods, 12);
    }

    #[test]
    fn event_study_normalises_reference_month() {
        let panel = synthetic_panel(-0.2);
        let es = event_study(&panel, YearMonth::new(2023, 9).unwrap()).unwrap();
        assert_eq!(es.coefficients.len(), 12);
        let sep = es.coefficients.iter().find(|c| c.month.month == 9).unwrap();
        assert_eq!((sep.coef, sep.se), (0.0, 0.0));
        assert!(!sep.significant);
        for c in &es.coefficients {
            let expected = if c.month.first_day() >= d(2023, 10, 1) { -0.2 } else { 0.0 };
            assert!((c.coef - expected).abs() < 0.05, "{}: {}", c.month, c.coef);
        }

        let pre = es
            .pretrend_test(YearMonth::new(2023, 1).unwrap(), YearMonth::new(2023, 10).unwrap())
            .unwrap();
        assert_eq!(pre.months.len(), 6, "Mar-Aug 2023");
        assert_eq!(pre.wald.df_num, 6);
        assert!(pre.mean_abs_coef < 0.05);
        assert!(pre.min_coef <= pre.max_coef);
    }

    #[test]
    fn missing_reference_month_is_an_error() {
        let panel = synthetic_panel(0.0);
        let err = event_study(&panel, YearMonth::new(2022, 1).unwrap()).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingTreatedUnit { .. }));
    }

    #[test]
    fn weekly_panel_marks_post_by_week_start() {
        let pool = DonorPool {
            treated: Zip3::CHICAGO,
            treated_size: 1.0,
            lower: 0.5,
            upper: 1.5,
            donors: vec![Zip3::parse("600").unwrap()],
        };
        let tx = |zip: &str, day: NaiveDate| Transaction {
            cardid: "c".into(),
            date: day,
            amount: Some(20.0),
            merchid: "m".into(),
            service: "chatgpt".into(),
            zip3: Zip3::parse(zip),
        };
        let trans = vec![
            // Sunday 2023-10-01 falls in the week starting Monday 2023-09-25.
            tx("606", d(2023, 10, 1)),
            tx("606", d(2023, 10, 2)),
            tx("600", d(2023, 10, 2)),
            tx("601", d(2023, 10, 2)),
            tx("606", d(2025, 1, 5)),
        ];
        let panel = build_panel(&trans, &pool, &StudyDates::default(), DidFrequency::Weekly);
        assert_eq!(panel.len(), 3, "non-pool unit and out-of-window rows dropped");
        let first = &panel[1];
        assert_eq!(first.zip3, Zip3::CHICAGO);
        assert_eq!(first.period_start, d(2023, 9, 25));
        assert!(!first.post);
        assert!(panel[2].post && panel[2].treated_post());
    }
}
