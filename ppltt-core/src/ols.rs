//! Dense least squares with dummy-coded fixed effects.
//!
//! Estimates match the usual statistical-package conventions: the normal
//! equations are solved with a pseudo-inverse, robust covariances use the
//! HC1 and clustered small-sample corrections, and robust inference is
//! normal-based while classical inference uses Student's t.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, FisherSnedecor, Normal, StudentsT};

use crate::error::{AnalysisError, Result};

fn numerical(msg: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::Numerical(msg.to_string())
}

// ============================================================================
// Design matrix
// ============================================================================

/// Column-wise builder for a regression design.
#[derive(Debug, Clone)]
pub struct DesignBuilder {
    n: usize,
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl DesignBuilder {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            names: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn intercept(self) -> Self {
        let n = self.n;
        self.column("Intercept", vec![1.0; n])
    }

    pub fn column(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.names.push(name.into());
        self.columns.push(values);
        self
    }

    /// One dummy per level except the first in sort order.
    pub fn fixed_effects<K: Ord + Clone + std::fmt::Display>(mut self, prefix: &str, keys: &[K]) -> Self {
        let mut levels: Vec<K> = keys.to_vec();
        levels.sort();
        levels.dedup();
        for level in levels.into_iter().skip(1) {
            let values = keys.iter().map(|k| f64::from(u8::from(*k == level))).collect();
            self.names.push(format!("{prefix}[{level}]"));
            self.columns.push(values);
        }
        self
    }

    pub fn build(self, y: Vec<f64>) -> Result<Design> {
        if y.len() != self.n {
            return Err(numerical(format!("response has {} rows, design has {}", y.len(), self.n)));
        }
        if let Some((name, col)) = self.names.iter().zip(&self.columns).find(|(_, c)| c.len() != self.n) {
            return Err(numerical(format!("column {name} has {} rows, expected {}", col.len(), self.n)));
        }
        let k = self.columns.len();
        let x = DMatrix::from_fn(self.n, k, |i, j| self.columns[j][i]);
        Ok(Design {
            names: self.names,
            x,
            y: DVector::from_vec(y),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Design {
    pub names: Vec<String>,
    pub x: DMatrix<f64>,
    pub y: DVector<f64>,
}

// ============================================================================
// Fit
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CovType {
    Classical,
    Hc1,
    /// One group label per observation.
    Cluster(Vec<usize>),
}

#[derive(Debug, Clone, Serialize)]
pub struct Coefficient {
    pub name: String,
    pub estimate: f64,
    pub std_err: f64,
    pub t: f64,
    pub p: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaldTest {
    pub f: f64,
    pub df_num: usize,
    pub df_denom: f64,
    pub p: f64,
}

#[derive(Debug, Clone)]
pub struct OlsFit {
    pub names: Vec<String>,
    pub params: DVector<f64>,
    pub cov: DMatrix<f64>,
    pub nobs: usize,
    pub rank: usize,
    pub df_resid: f64,
    pub r_squared: f64,
    pub clusters: Option<usize>,
    robust: bool,
}

fn pinv(m: &DMatrix<f64>) -> Result<(DMatrix<f64>, usize)> {
    let svd = m.clone().svd(true, true);
    let max_sv = svd.singular_values.max();
    let tol = max_sv * 1e-12;
    let rank = svd.singular_values.iter().filter(|s| **s > tol).count();
    let inv = svd.pseudo_inverse(tol).map_err(numerical)?;
    Ok((inv, rank))
}

impl OlsFit {
    pub fn fit(design: &Design, cov_type: CovType) -> Result<Self> {
        let x = &design.x;
        let y = &design.y;
        let n = x.nrows();
        if n == 0 || x.ncols() == 0 {
            return Err(numerical("empty design"));
        }
        let xtx = x.transpose() * x;
        let (xtx_inv, rank) = pinv(&xtx)?;
        if n <= rank {
            return Err(numerical(format!("{n} observations for {rank} parameters")));
        }
        let params = &xtx_inv * (x.transpose() * y);
        let resid = y - x * &params;
        let ssr = resid.norm_squared();
        let y_mean = y.mean();
        let tss: f64 = y.iter().map(|v| (v - y_mean).powi(2)).sum();
        let r_squared = if tss > 0.0 { 1.0 - ssr / tss } else { 0.0 };
        let df_resid = (n - rank) as f64;

        let (cov, robust, clusters) = match &cov_type {
            CovType::Classical => (&xtx_inv * (ssr / df_resid), false, None),
            CovType::Hc1 => {
                let mut meat = DMatrix::zeros(x.ncols(), x.ncols());
                for i in 0..n {
                    let xi = x.row(i).transpose();
                    meat += &xi * xi.transpose() * resid[i].powi(2);
                }
                let scale = n as f64 / df_resid;
                (&xtx_inv * meat * &xtx_inv * scale, true, None)
            }
            CovType::Cluster(groups) => {
                if groups.len() != n {
                    return Err(numerical("cluster labels do not match observations"));
                }
                let mut scores: BTreeMap<usize, DVector<f64>> = BTreeMap::new();
                for (i, g) in groups.iter().enumerate() {
                    let s = x.row(i).transpose() * resid[i];
                    scores
                        .entry(*g)
                        .and_modify(|acc| *acc += &s)
                        .or_insert(s);
                }
                let g = scores.len();
                if g < 2 {
                    return Err(numerical("cluster-robust covariance needs at least two clusters"));
                }
                let mut meat = DMatrix::zeros(x.ncols(), x.ncols());
                for s in scores.values() {
                    meat += s * s.transpose();
                }
                let scale = (g as f64 / (g - 1) as f64) * ((n - 1) as f64 / df_resid);
                (&xtx_inv * meat * &xtx_inv * scale, true, Some(g))
            }
        };

        Ok(Self {
            names: design.names.clone(),
            params,
            cov,
            nobs: n,
            rank,
            df_resid,
            r_squared,
            clusters,
            robust,
        })
    }

    pub fn index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    fn p_value(&self, t: f64) -> f64 {
        if !t.is_finite() {
            return f64::NAN;
        }
        let tail = if self.robust {
            Normal::new(0.0, 1.0).map(|d| d.sf(t.abs())).ok()
        } else {
            StudentsT::new(0.0, 1.0, self.df_resid).map(|d| d.sf(t.abs())).ok()
        };
        tail.map_or(f64::NAN, |s| 2.0 * s)
    }

    pub fn coef(&self, name: &str) -> Option<Coefficient> {
        let i = self.index(name)?;
        let estimate = self.params[i];
        let std_err = self.cov[(i, i)].max(0.0).sqrt();
        let t = estimate / std_err;
        Some(Coefficient {
            name: name.to_string(),
            estimate,
            std_err,
            t,
            p: self.p_value(t),
        })
    }

    /// Joint test that the coefficients at `indices` are all zero.
    pub fn wald_test(&self, indices: &[usize]) -> Result<WaldTest> {
        let q = indices.len();
        if q == 0 {
            return Err(numerical("wald test needs at least one restriction"));
        }
        if let Some(bad) = indices.iter().find(|i| **i >= self.params.len()) {
            return Err(numerical(format!("restriction index {bad} out of range")));
        }
        let rb = DVector::from_iterator(q, indices.iter().map(|&i| self.params[i]));
        let rvr = DMatrix::from_fn(q, q, |a, b| self.cov[(indices[a], indices[b])]);
        let (rvr_inv, _) = pinv(&rvr)?;
        let f = (rb.transpose() * rvr_inv * &rb)[(0, 0)] / q as f64;
        let p = FisherSnedecor::new(q as f64, self.df_resid)
            .map(|d| d.sf(f))
            .map_err(numerical)?;
        Ok(WaldTest {
            f,
            df_num: q,
            df_denom: self.df_resid,
            p,
        })
    }
}

// ============================================================================
// Bivariate regression
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SimpleRegression {
    pub slope: f64,
    pub intercept: f64,
    pub r: f64,
    /// Two-sided test of zero slope, n - 2 degrees of freedom.
    pub p: f64,
    pub std_err: f64,
    pub n: usize,
}

/// Least-squares line through `(x, y)`; `None` with fewer than three points
/// or no variation in `x`.
pub fn simple_regression(x: &[f64], y: &[f64]) -> Option<SimpleRegression> {
    let n = x.len();
    if n != y.len() || n < 3 {
        return None;
    }
    let mx = x.iter().sum::<f64>() / n as f64;
    let my = y.iter().sum::<f64>() / n as f64;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
        sxy += (a - mx) * (b - my);
    }
    if sxx <= 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    let intercept = my - slope * mx;
    let r = if syy > 0.0 { (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0) } else { 0.0 };
    let df = (n - 2) as f64;
    let std_err = ((1.0 - r * r) * syy / sxx / df).sqrt();
    let p = if std_err > 0.0 {
        let t = slope / std_err;
        StudentsT::new(0.0, 1.0, df).map_or(f64::NAN, |d| 2.0 * d.sf(t.abs()))
    } else {
        0.0
    };
    Some(SimpleRegression {
        slope,
        intercept,
        r,
        p,
        std_err,
        n,
    })
}

/// Pearson correlation; `None` when either side is constant.
pub fn correlation(x: &[f64], y: &[f64]) -> Option<f64> {
    let reg = simple_regression(x, y)?;
    let my = y.iter().sum::<f64>() / y.len() as f64;
    y.iter().any(|v| (v - my).abs() > 0.0).then_some(reg.r)
}
