//! Do the matching covariates predict market size?
//!
//! ZIP3 pre-period transaction totals are regressed on demographics, with and
//! without the pre-period price level.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::info;

use crate::aggregate::{MonthlyStat, aggregate_monthly};
use crate::config::{AnalysisConfig, StudyDates};
use crate::error::{AnalysisError, Result};
use crate::io::{Table, read_table};
use crate::ols::{CovType, DesignBuilder, OlsFit, correlation};
use crate::types::{Transaction, Zip3};

pub const DEMOGRAPHIC_VARS: [&str; 7] = [
    "pct_college",
    "pct_hh_100k",
    "pct_young",
    "median_age",
    "median_income",
    "pct_stem",
    "pct_broadband",
];

pub const PRICE_VAR: &str = "pre_mean_price";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Demographics {
    pub zip3: Zip3,
    /// In `DEMOGRAPHIC_VARS` order.
    pub values: [Option<f64>; 7],
    pub population: Option<f64>,
}

impl Demographics {
    /// All seven demographic values, when none are missing.
    pub fn complete(&self) -> Option<[f64; 7]> {
        let mut out = [0.0; 7];
        for (slot, v) in out.iter_mut().zip(self.values) {
            *slot = v?;
        }
        Some(out)
    }
}

pub fn load_demographics(config: &AnalysisConfig) -> Result<BTreeMap<Zip3, Demographics>> {
    let path = config.data.path(&config.data.demographics);
    let df = read_table(&path, "ZIP3 demographics from the ACS extract")?;
    let table = Table::new("demographics", &df);

    let zips = table.strings("zip3")?;
    let population = table.floats("population")?;
    let columns = DEMOGRAPHIC_VARS
        .iter()
        .map(|v| table.floats(v))
        .collect::<Result<Vec<_>>>()?;

    let mut out = BTreeMap::new();
    for (i, raw) in zips.iter().enumerate() {
        let Some(zip3) = raw.as_deref().and_then(Zip3::parse) else { continue };
        let values = std::array::from_fn(|k| columns[k][i]);
        out.insert(
            zip3,
            Demographics {
                zip3,
                values,
                population: population[i],
            },
        );
    }
    info!(zip3s = out.len(), path = %path.display(), "loaded demographics");
    Ok(out)
}

pub fn populations(demographics: &BTreeMap<Zip3, Demographics>) -> HashMap<Zip3, f64> {
    demographics
        .iter()
        .filter_map(|(z, d)| d.population.map(|p| (*z, p)))
        .collect()
}

// ============================================================================
// Cross-section
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct UnitCovariates {
    pub zip3: Zip3,
    pub pre_n_trans: usize,
    pub pre_n_users: usize,
    pub log_pre_n_trans: f64,
    /// Pre-period spend over pre-period priced transactions.
    pub pre_mean_price: Option<f64>,
    pub demographics: [f64; 7],
}

/// ZIP3 pre-period totals joined to complete demographics.
pub fn pre_period_units(
    monthly: &[MonthlyStat],
    demographics: &BTreeMap<Zip3, Demographics>,
    dates: &StudyDates,
) -> Result<Vec<UnitCovariates>> {
    let first = crate::calendar::YearMonth::from_date(dates.start);
    let cutoff = dates.treatment_month();
    let mut totals: BTreeMap<Zip3, (usize, usize, usize, f64)> = BTreeMap::new();
    for s in monthly.iter().filter(|s| s.month >= first && s.month < cutoff) {
        let e = totals.entry(s.zip3).or_default();
        e.0 += s.n_trans;
        e.1 += s.n_users;
        e.2 += s.n_priced;
        e.3 += s.total_spend;
    }

    let non_positive = totals.values().filter(|t| t.0 == 0).count();
    if non_positive > 0 {
        return Err(AnalysisError::Numerical(format!(
            "{non_positive} ZIP3s have non-positive pre-period transactions; cannot take logs"
        )));
    }

    Ok(totals
        .into_iter()
        .filter_map(|(zip3, (n_trans, n_users, n_priced, spend))| {
            let demo = demographics.get(&zip3)?.complete()?;
            Some(UnitCovariates {
                zip3,
                pre_n_trans: n_trans,
                pre_n_users: n_users,
                log_pre_n_trans: (n_trans as f64).ln(),
                pre_mean_price: (n_priced > 0).then(|| spend / n_priced as f64),
                demographics: demo,
            })
        })
        .collect())
}

// ============================================================================
// Models
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ModelRow {
    pub model: &'static str,
    pub variable: String,
    pub coef: f64,
    pub se: f64,
    pub t: f64,
    pub p: f64,
    pub n: usize,
    pub r2: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CovariateCorrelation {
    pub variable: String,
    pub corr: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartialR2 {
    pub variable: String,
    pub r2_full: f64,
    pub r2_reduced: f64,
    pub delta_r2: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CovariateValidation {
    pub units: usize,
    pub models: Vec<ModelRow>,
    /// Sorted by absolute correlation, strongest first.
    pub correlations: Vec<CovariateCorrelation>,
    /// Sorted by `delta_r2`, largest first.
    pub partial_r2: Vec<PartialR2>,
}

/// Named regressor columns over `rows`.
fn regressors(rows: &[&UnitCovariates], with_price: bool) -> Vec<(String, Vec<f64>)> {
    let mut cols: Vec<(String, Vec<f64>)> = DEMOGRAPHIC_VARS
        .iter()
        .enumerate()
        .map(|(k, name)| (name.to_string(), rows.iter().map(|r| r.demographics[k]).collect()))
        .collect();
    if with_price {
        cols.push((
            PRICE_VAR.to_string(),
            rows.iter().map(|r| r.pre_mean_price.unwrap_or(f64::NAN)).collect(),
        ));
    }
    cols
}

fn fit(cols: &[(String, Vec<f64>)], y: &[f64], cov: CovType) -> Result<OlsFit> {
    let design = cols
        .iter()
        .fold(DesignBuilder::new(y.len()).intercept(), |b, (name, values)| {
            b.column(name.clone(), values.clone())
        })
        .build(y.to_vec())?;
    OlsFit::fit(&design, cov)
}

pub fn covariate_validation(units: &[UnitCovariates]) -> Result<CovariateValidation> {
    let with_price: Vec<&UnitCovariates> = units.iter().filter(|u| u.pre_mean_price.is_some()).collect();
    if with_price.len() <= DEMOGRAPHIC_VARS.len() + 2 {
        return Err(AnalysisError::empty(format!(
            "joining demographics ({} ZIP3s with complete covariates)",
            with_price.len()
        )));
    }

    let mut models = Vec::new();
    for (model, include_price) in [("demo_only", false), ("demo_plus_price", true)] {
        let rows: Vec<&UnitCovariates> = if include_price {
            with_price.clone()
        } else {
            units.iter().collect()
        };
        let y: Vec<f64> = rows.iter().map(|r| r.log_pre_n_trans).collect();
        let ols = fit(&regressors(&rows, include_price), &y, CovType::Hc1)?;
        for name in &ols.names {
            if let Some(c) = ols.coef(name) {
                models.push(ModelRow {
                    model,
                    variable: c.name,
                    coef: c.estimate,
                    se: c.std_err,
                    t: c.t,
                    p: c.p,
                    n: ols.nobs,
                    r2: ols.r_squared,
                });
            }
        }
        info!(model, n = ols.nobs, r2 = ols.r_squared, "covariate model");
    }

    let y: Vec<f64> = with_price.iter().map(|r| r.log_pre_n_trans).collect();
    let cols = regressors(&with_price, true);

    let mut correlations: Vec<CovariateCorrelation> = cols
        .iter()
        .map(|(name, x)| CovariateCorrelation {
            variable: name.clone(),
            corr: correlation(x, &y),
        })
        .collect();
    correlations.sort_by(|a, b| {
        let key = |c: &CovariateCorrelation| c.corr.map_or(-1.0, f64::abs);
        key(b).total_cmp(&key(a))
    });

    let r2_full = fit(&cols, &y, CovType::Classical)?.r_squared;
    let mut partial_r2 = Vec::with_capacity(cols.len());
    for (i, (name, _)) in cols.iter().enumerate() {
        let reduced: Vec<(String, Vec<f64>)> = cols
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, c)| c.clone())
            .collect();
        let r2_reduced = fit(&reduced, &y, CovType::Classical)?.r_squared;
        partial_r2.push(PartialR2 {
            variable: name.clone(),
            r2_full,
            r2_reduced,
            delta_r2: r2_full - r2_reduced,
        });
    }
    partial_r2.sort_by(|a, b| b.delta_r2.total_cmp(&a.delta_r2));

    Ok(CovariateValidation {
        units: units.len(),
        models,
        correlations,
        partial_r2,
    })
}

/// Load demographics, build the pre-period cross-section, and fit.
pub fn run_covariates(transactions: &[Transaction], config: &AnalysisConfig) -> Result<CovariateValidation> {
    let demographics = load_demographics(config)?;
    let sample: Vec<Transaction> = transactions
        .iter()
        .filter(|t| config.study.contains(t.date))
        .cloned()
        .collect();
    let units = pre_period_units(&aggregate_monthly(&sample), &demographics, &config.study)?;
    covariate_validation(&units)
}
