//! Result tables, JSON summaries, and the headline LaTeX tabular.
//!
//! Every output lands in one directory as `<name>.csv`, `<name>.json`, or
//! `<name>.tex`. Chart data is written in long, plot-ready form.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use polars::prelude::*;
use serde::Serialize;

use crate::config::AnalysisConfig;
use crate::covariates::CovariateValidation;
use crate::describe::{BucketMonth, BucketPeriod, PassThroughCheck, PriceChange, PriceStats, TreatedMonth};
use crate::did::{DidAnalysis, DidObservation};
use crate::error::Result;
use crate::io::{write_csv, write_text};
use crate::modal_zip3::Bouncer;
use crate::panelize::WindowCount;
use crate::placebo::PlaceboAnalysis;
use crate::robustness::{LeaveKOut, LeaveOutSummary};
use crate::synth::{DonorWeight, SynthAnalysis};
use crate::types::Zip3;

// ============================================================================
// Column helpers
// ============================================================================

fn text(name: &str, values: Vec<String>) -> Column {
    Column::new(name.into(), values)
}

fn num(name: &str, values: Vec<f64>) -> Column {
    Column::new(name.into(), values)
}

fn opt(name: &str, values: Vec<Option<f64>>) -> Column {
    Column::new(name.into(), values)
}

fn count(name: &str, values: Vec<u64>) -> Column {
    Column::new(name.into(), values)
}

fn opt_count(name: &str, values: Vec<Option<u64>>) -> Column {
    Column::new(name.into(), values)
}

fn flag(name: &str, values: Vec<bool>) -> Column {
    Column::new(name.into(), values)
}

fn frame(columns: Vec<Column>) -> Result<DataFrame> {
    Ok(DataFrame::new(columns)?)
}

// ============================================================================
// Frames
// ============================================================================

pub fn panel_window_frame(windows: &[WindowCount]) -> Result<DataFrame> {
    frame(vec![
        count("window", (1..=windows.len() as u64).collect()),
        text("start", windows.iter().map(|w| w.window.start.to_string()).collect()),
        text("end", windows.iter().map(|w| w.window.end.to_string()).collect()),
        count("active", windows.iter().map(|w| w.active as u64).collect()),
        count("panel", windows.iter().map(|w| w.panel as u64).collect()),
        count("dropped", windows.iter().map(|w| w.dropped as u64).collect()),
    ])
}

pub fn bouncer_frame(bouncers: &[Bouncer]) -> Result<DataFrame> {
    let mut cardid = Vec::new();
    let mut rows = Vec::new();
    let mut month = Vec::new();
    let mut zip3 = Vec::new();
    let mut share = Vec::new();
    for b in bouncers {
        for m in &b.months {
            cardid.push(b.cardid.clone());
            rows.push(b.rows as u64);
            month.push(m.month.to_string());
            zip3.push(m.zip3.to_string());
            share.push(m.share());
        }
    }
    frame(vec![
        text("cardid", cardid),
        count("address_rows", rows),
        text("year_month", month),
        text("zip3", zip3),
        num("modal_share", share),
    ])
}

pub fn treated_monthly_frame(monthly: &[TreatedMonth]) -> Result<DataFrame> {
    frame(vec![
        text("month", monthly.iter().map(|m| m.month.to_string()).collect()),
        count("transactions", monthly.iter().map(|m| m.transactions as u64).collect()),
        num("total_spend", monthly.iter().map(|m| m.total_spend).collect()),
        count("unique_users", monthly.iter().map(|m| m.unique_users as u64).collect()),
        opt("median_transaction", monthly.iter().map(|m| m.median).collect()),
        opt("p25", monthly.iter().map(|m| m.p25).collect()),
        opt("p75", monthly.iter().map(|m| m.p75).collect()),
    ])
}

pub fn pass_through_frame(checks: &[PassThroughCheck]) -> Result<DataFrame> {
    frame(vec![
        text("period", checks.iter().map(|c| c.label.clone()).collect()),
        num("rate", checks.iter().map(|c| c.rate).collect()),
        text("from", checks.iter().map(|c| c.from.to_string()).collect()),
        text(
            "until",
            checks.iter().map(|c| c.until.map(|d| d.to_string()).unwrap_or_default()).collect(),
        ),
        num("full_pass_through", checks.iter().map(|c| c.full_pass_through).collect()),
        count("months", checks.iter().map(|c| c.months as u64).collect()),
        opt("observed_median", checks.iter().map(|c| c.observed).collect()),
        opt("difference", checks.iter().map(|c| c.difference).collect()),
    ])
}

pub fn bucket_frame(monthly: &[BucketMonth]) -> Result<DataFrame> {
    let shares: Vec<[f64; 3]> = monthly.iter().map(BucketMonth::shares).collect();
    frame(vec![
        text("month", monthly.iter().map(|m| m.month.to_string()).collect()),
        count("plus", monthly.iter().map(|m| m.plus as u64).collect()),
        count("pro", monthly.iter().map(|m| m.pro as u64).collect()),
        count("other", monthly.iter().map(|m| m.other as u64).collect()),
        count("total", monthly.iter().map(|m| m.total() as u64).collect()),
        num("plus_pct", shares.iter().map(|s| s[0]).collect()),
        num("pro_pct", shares.iter().map(|s| s[1]).collect()),
        num("other_pct", shares.iter().map(|s| s[2]).collect()),
    ])
}

pub fn bucket_period_frame(periods: &[BucketPeriod]) -> Result<DataFrame> {
    frame(vec![
        text("period", periods.iter().map(|p| p.label.clone()).collect()),
        count("months", periods.iter().map(|p| p.months as u64).collect()),
        num("plus_pct", periods.iter().map(|p| p.plus_pct).collect()),
        num("pro_pct", periods.iter().map(|p| p.pro_pct).collect()),
        num("other_pct", periods.iter().map(|p| p.other_pct).collect()),
    ])
}

pub fn price_change_frame(changes: &[PriceChange]) -> Result<DataFrame> {
    frame(vec![
        text("zip3", changes.iter().map(|c| c.zip3.to_string()).collect()),
        text("area", changes.iter().map(|c| c.area.unwrap_or("").to_string()).collect()),
        num("baseline_median", changes.iter().map(|c| c.baseline_median).collect()),
        count("baseline_n", changes.iter().map(|c| c.baseline_n as u64).collect()),
        num("comparison_median", changes.iter().map(|c| c.comparison_median).collect()),
        count("comparison_n", changes.iter().map(|c| c.comparison_n as u64).collect()),
        num("pct_change", changes.iter().map(|c| c.pct_change).collect()),
        flag("flagged", changes.iter().map(|c| c.flagged).collect()),
    ])
}

/// Mean log outcome per period for the treated unit and the controls.
pub fn did_series_frame(panel: &[DidObservation]) -> Result<DataFrame> {
    let mut groups: BTreeMap<(NaiveDate, bool), (f64, usize)> = BTreeMap::new();
    for o in panel {
        let e = groups.entry((o.period_start, o.treated)).or_default();
        e.0 += o.log_trans;
        e.1 += 1;
    }
    frame(vec![
        text("period_start", groups.keys().map(|(d, _)| d.to_string()).collect()),
        text(
            "group",
            groups
                .keys()
                .map(|(_, t)| if *t { "treated" } else { "control" }.to_string())
                .collect(),
        ),
        num("mean_log_trans", groups.values().map(|(s, n)| s / *n as f64).collect()),
        count("units", groups.values().map(|(_, n)| *n as u64).collect()),
    ])
}

pub fn event_study_frame(did: &DidAnalysis) -> Result<DataFrame> {
    let es = &did.event_study;
    frame(vec![
        text("month", es.iter().map(|c| c.month.to_string()).collect()),
        num("coef", es.iter().map(|c| c.coef).collect()),
        num("se", es.iter().map(|c| c.se).collect()),
        num("ci_low", es.iter().map(|c| c.coef - 1.96 * c.se).collect()),
        num("ci_high", es.iter().map(|c| c.coef + 1.96 * c.se).collect()),
        flag("significant", es.iter().map(|c| c.significant).collect()),
    ])
}

pub fn synth_series_frame(synth: &SynthAnalysis) -> Result<DataFrame> {
    let s = &synth.result.series;
    frame(vec![
        text("month", s.iter().map(|p| p.month.to_string()).collect()),
        num("treated", s.iter().map(|p| p.treated).collect()),
        num("synthetic", s.iter().map(|p| p.synthetic).collect()),
        num("gap", s.iter().map(|p| p.gap).collect()),
        flag("post", s.iter().map(|p| p.post).collect()),
    ])
}

pub fn donor_weight_frame(weights: &[DonorWeight]) -> Result<DataFrame> {
    frame(vec![
        text("zip3", weights.iter().map(|w| w.zip3.to_string()).collect()),
        text(
            "area",
            weights.iter().map(|w| w.zip3.area_name().unwrap_or("").to_string()).collect(),
        ),
        num("weight", weights.iter().map(|w| w.weight).collect()),
    ])
}

pub fn period_comparison_frame(synth: &SynthAnalysis) -> Result<DataFrame> {
    let p = synth.result.period_comparison();
    frame(vec![
        text("period", p.iter().map(|c| c.period.to_string()).collect()),
        count("months", p.iter().map(|c| c.months as u64).collect()),
        num("treated_mean", p.iter().map(|c| c.treated_mean).collect()),
        num("synthetic_mean", p.iter().map(|c| c.synthetic_mean).collect()),
        num("difference", p.iter().map(|c| c.difference).collect()),
    ])
}

pub fn placebo_frame(placebo: &PlaceboAnalysis) -> Result<DataFrame> {
    let u = &placebo.units;
    frame(vec![
        text("zip3", u.iter().map(|p| p.zip3.to_string()).collect()),
        flag("is_treated", u.iter().map(|p| p.is_treated).collect()),
        num("pre_rmspe", u.iter().map(|p| p.pre_rmspe).collect()),
        num("post_rmspe", u.iter().map(|p| p.post_rmspe).collect()),
        opt("ratio", u.iter().map(|p| p.ratio).collect()),
        num("post_gap", u.iter().map(|p| p.post_gap).collect()),
        opt("gap_ratio", u.iter().map(|p| p.gap_ratio).collect()),
        opt("pre_level", u.iter().map(|p| p.pre_level).collect()),
        opt("population", u.iter().map(|p| p.population).collect()),
    ])
}

pub fn placebo_test_frame(placebo: &PlaceboAnalysis) -> Result<DataFrame> {
    let t = &placebo.tests;
    frame(vec![
        text("subset", t.iter().map(|x| x.label.clone()).collect()),
        opt("cutoff_rmspe", t.iter().map(|x| x.cutoff_rmspe).collect()),
        count("units", t.iter().map(|x| x.units as u64).collect()),
        opt_count("treated_rank", t.iter().map(|x| x.treated_rank.map(|r| r as u64)).collect()),
        opt("ratio_p", t.iter().map(|x| x.ratio_p).collect()),
        num("gap_p", t.iter().map(|x| x.gap_p).collect()),
    ])
}

/// Long gap series for every unit, for spaghetti plots.
pub fn placebo_gap_frame(placebo: &PlaceboAnalysis) -> Result<DataFrame> {
    let mut zip3 = Vec::new();
    let mut treated = Vec::new();
    let mut pre_rmspe = Vec::new();
    let mut month = Vec::new();
    let mut gap = Vec::new();
    for u in &placebo.units {
        for (m, g) in &u.gaps {
            zip3.push(u.zip3.to_string());
            treated.push(u.is_treated);
            pre_rmspe.push(u.pre_rmspe);
            month.push(m.to_string());
            gap.push(*g);
        }
    }
    frame(vec![
        text("zip3", zip3),
        flag("is_treated", treated),
        num("pre_rmspe", pre_rmspe),
        text("month", month),
        num("gap", gap),
    ])
}

pub fn leave_k_out_frame(lko: &LeaveKOut) -> Result<DataFrame> {
    let r = &lko.runs;
    frame(vec![
        count("k", r.iter().map(|x| x.k as u64).collect()),
        text("removed", r.iter().map(|x| x.removed_label()).collect()),
        num("rmse", r.iter().map(|x| x.rmse).collect()),
        num("pre_gap", r.iter().map(|x| x.pre_gap).collect()),
        num("post_gap", r.iter().map(|x| x.post_gap).collect()),
    ])
}

pub fn leave_k_out_summary_frame(lko: &LeaveKOut) -> Result<DataFrame> {
    let s = &lko.by_k;
    frame(vec![
        count("k", s.iter().map(|x| x.k as u64).collect()),
        count("runs", s.iter().map(|x| x.runs as u64).collect()),
        num("mean_post_gap", s.iter().map(|x| x.mean_post_gap).collect()),
        num("min_post_gap", s.iter().map(|x| x.min_post_gap).collect()),
        num("max_post_gap", s.iter().map(|x| x.max_post_gap).collect()),
    ])
}

/// Synthetic series of every leave-k-out fit, long form.
pub fn leave_k_out_series_frame(lko: &LeaveKOut) -> Result<DataFrame> {
    let mut k = Vec::new();
    let mut removed = Vec::new();
    let mut month = Vec::new();
    let mut treated = Vec::new();
    let mut synthetic = Vec::new();
    for run in &lko.runs {
        let label = run.removed_label();
        for p in &run.series {
            k.push(run.k as u64);
            removed.push(label.clone());
            month.push(p.month.to_string());
            treated.push(p.treated);
            synthetic.push(p.synthetic);
        }
    }
    frame(vec![
        count("k", k),
        text("removed", removed),
        text("month", month),
        num("treated", treated),
        num("synthetic", synthetic),
    ])
}

pub fn covariate_frames(cv: &CovariateValidation) -> Result<[(&'static str, DataFrame); 3]> {
    let m = &cv.models;
    let models = frame(vec![
        text("model", m.iter().map(|r| r.model.to_string()).collect()),
        text("variable", m.iter().map(|r| r.variable.clone()).collect()),
        num("coef", m.iter().map(|r| r.coef).collect()),
        num("se", m.iter().map(|r| r.se).collect()),
        num("t", m.iter().map(|r| r.t).collect()),
        num("p", m.iter().map(|r| r.p).collect()),
        count("n", m.iter().map(|r| r.n as u64).collect()),
        num("r2", m.iter().map(|r| r.r2).collect()),
    ])?;
    let correlations = frame(vec![
        text("variable", cv.correlations.iter().map(|c| c.variable.clone()).collect()),
        opt("corr", cv.correlations.iter().map(|c| c.corr).collect()),
    ])?;
    let p = &cv.partial_r2;
    let partial = frame(vec![
        text("variable", p.iter().map(|r| r.variable.clone()).collect()),
        num("r2_full", p.iter().map(|r| r.r2_full).collect()),
        num("r2_reduced", p.iter().map(|r| r.r2_reduced).collect()),
        num("delta_r2", p.iter().map(|r| r.delta_r2).collect()),
    ])?;
    Ok([
        ("covariate_validation_ols", models),
        ("covariate_validation_correlations", correlations),
        ("covariate_validation_partial_r2", partial),
    ])
}

// ============================================================================
// Headline summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DidHeadline {
    pub estimate: f64,
    pub std_err: f64,
    pub p: f64,
    pub nobs: usize,
    pub clusters: usize,
    pub pretrend_f: Option<f64>,
    pub pretrend_p: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthHeadline {
    pub post_gap: f64,
    pub effect_pct: f64,
    pub pre_rmspe: f64,
    pub post_rmspe: f64,
    pub rmspe_ratio: Option<f64>,
    pub donors: usize,
    pub top_donors: Vec<DonorWeight>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceboHeadline {
    pub placebos: usize,
    pub treated_rank: Option<usize>,
    pub ratio_p: Option<f64>,
    pub gap_p: f64,
}

/// What a reader wants from one run, serialised to `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct Headline {
    pub treated: Zip3,
    pub area: Option<&'static str>,
    pub outcome: &'static str,
    pub sample: String,
    pub did: Option<DidHeadline>,
    pub synth: Option<SynthHeadline>,
    pub placebo: Option<PlaceboHeadline>,
    pub leave_k_out: Option<LeaveOutSummary>,
    pub prices: Option<PriceStats>,
}

impl Headline {
    pub fn new(config: &AnalysisConfig) -> Self {
        let treated = config.sample.treated;
        Self {
            treated,
            area: treated.area_name(),
            outcome: config.sample.outcome.label(),
            sample: config.sample.filter_title(),
            did: None,
            synth: None,
            placebo: None,
            leave_k_out: None,
            prices: None,
        }
    }

    pub fn with_did(mut self, did: &DidAnalysis) -> Self {
        let c = &did.twfe.treated_post;
        self.did = Some(DidHeadline {
            estimate: c.estimate,
            std_err: c.std_err,
            p: c.p,
            nobs: did.twfe.nobs,
            clusters: did.twfe.clusters,
            pretrend_f: did.pretrend.as_ref().map(|t| t.wald.f),
            pretrend_p: did.pretrend.as_ref().map(|t| t.wald.p),
        });
        self
    }

    pub fn with_synth(mut self, synth: &SynthAnalysis, report_weight: f64) -> Self {
        let r = &synth.result;
        self.synth = Some(SynthHeadline {
            post_gap: r.post_gap,
            effect_pct: r.effect_pct(),
            pre_rmspe: r.pre_rmspe,
            post_rmspe: r.post_rmspe,
            rmspe_ratio: r.rmspe_ratio,
            donors: r.weights.len(),
            top_donors: r.top_donors(report_weight),
        });
        self
    }

    pub fn with_placebo(mut self, placebo: &PlaceboAnalysis) -> Self {
        self.placebo = placebo.tests.first().map(|t| PlaceboHeadline {
            placebos: placebo.units.len().saturating_sub(1),
            treated_rank: t.treated_rank,
            ratio_p: t.ratio_p,
            gap_p: t.gap_p,
        });
        self
    }

    pub fn with_leave_k_out(mut self, lko: &LeaveKOut) -> Self {
        self.leave_k_out = lko.overall.clone();
        self
    }

    pub fn with_prices(mut self, prices: PriceStats) -> Self {
        self.prices = Some(prices);
        self
    }
}

fn tex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' | '$' | '&' | '_' | '#' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn fixed_or_na(value: Option<f64>, places: usize) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.places$}"))
}

/// Two-column `tabular` of the headline estimates.
pub fn latex_tabular(h: &Headline) -> String {
    let mut rows: Vec<(String, String)> = Vec::new();
    if let Some(d) = &h.did {
        rows.push(("TWFE DiD: treated $\\times$ post".into(), format!("{:.4} ({:.4})", d.estimate, d.std_err)));
        rows.push(("DiD p-value".into(), format!("{:.3}", d.p)));
        rows.push(("Observations / clusters".into(), format!("{} / {}", d.nobs, d.clusters)));
        if let Some(p) = d.pretrend_p {
            rows.push(("Pre-trend joint test p-value".into(), format!("{p:.3}")));
        }
    }
    if let Some(s) = &h.synth {
        rows.push(("Synthetic control: post gap".into(), format!("{:.4}", s.post_gap)));
        rows.push(("Implied effect (\\%)".into(), format!("{:.1}", s.effect_pct)));
        rows.push(("Pre-period RMSPE".into(), format!("{:.4}", s.pre_rmspe)));
        rows.push(("Post/pre RMSPE ratio".into(), fixed_or_na(s.rmspe_ratio, 2)));
        rows.push(("Donors (weight > 1\\%)".into(), format!("{} ({})", s.donors, s.top_donors.len())));
    }
    if let Some(p) = &h.placebo {
        rows.push((
            "Placebo rank p-value".into(),
            format!("{} ({} placebos)", fixed_or_na(p.ratio_p, 3), p.placebos),
        ));
    }
    if let Some(l) = &h.leave_k_out {
        rows.push((
            "Leave-k-out post gap range".into(),
            format!("[{:.4}, {:.4}]", l.min_post_gap, l.max_post_gap),
        ));
    }
    if let Some(p) = &h.prices {
        if let (Some(pre), Some(post)) = (p.pre_mean, p.post_mean) {
            rows.push(("Median price pre / post (\\$)".into(), format!("{pre:.2} / {post:.2}")));
        }
    }

    let mut out = String::new();
    let title = match h.area {
        Some(area) => format!("{} ({})", area, h.treated),
        None => h.treated.to_string(),
    };
    let _ = writeln!(out, "\\begin{{tabular}}{{lr}}");
    let _ = writeln!(out, "\\hline");
    let _ = writeln!(out, "{} & {} \\\\", tex_escape(&title), tex_escape(h.outcome));
    let _ = writeln!(out, "\\hline");
    for (label, value) in rows {
        let _ = writeln!(out, "{label} & {value} \\\\");
    }
    let _ = writeln!(out, "\\hline");
    let _ = writeln!(out, "\\end{{tabular}}");
    out
}

// ============================================================================
// Writer
// ============================================================================

/// Writes named outputs into one directory and remembers what it wrote.
#[derive(Debug)]
pub struct ReportWriter {
    dir: PathBuf,
    written: Vec<PathBuf>,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    pub fn csv(&mut self, name: &str, mut df: DataFrame) -> Result<PathBuf> {
        let path = self.dir.join(format!("{name}.csv"));
        write_csv(&mut df, &path)?;
        self.written.push(path.clone());
        Ok(path)
    }

    pub fn json<T: Serialize>(&mut self, name: &str, value: &T) -> Result<PathBuf> {
        let text = serde_json::to_string_pretty(value)?;
        self.text(&format!("{name}.json"), &text)
    }

    /// `file` includes its extension.
    pub fn text(&mut self, file: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.join(file);
        write_text(contents, &path)?;
        self.written.push(path.clone());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::YearMonth;
    use crate::describe::TreatedMonth;

    #[test]
    fn latex_escapes_and_lists_estimates() {
        let mut h = Headline::new(&AnalysisConfig::default());
        h.did = Some(DidHeadline {
            estimate: -0.1234,
            std_err: 0.05,
            p: 0.0136,
            nobs: 900,
            clusters: 40,
            pretrend_f: Some(0.8),
            pretrend_p: Some(0.6),
        });
        let tex = latex_tabular(&h);
        assert!(tex.starts_with("\\begin{tabular}{lr}"));
        assert!(tex.contains("Chicago, IL (606) & Log Transactions \\\\"));
        assert!(tex.contains("-0.1234 (0.0500)"));
        assert!(tex.contains("Pre-trend joint test p-value & 0.600"));
        assert!(tex.trim_end().ends_with("\\end{tabular}"));
        assert_eq!(tex_escape("5% & $x_1"), "5\\% \\& \\$x\\_1");
    }

    #[test]
    fn undefined_ratios_print_as_na() {
        let mut h = Headline::new(&AnalysisConfig::default());
        h.synth = Some(SynthHeadline {
            post_gap: 0.0,
            effect_pct: 0.0,
            pre_rmspe: 0.0,
            post_rmspe: 0.0,
            rmspe_ratio: None,
            donors: 2,
            top_donors: Vec::new(),
        });
        h.placebo = Some(PlaceboHeadline {
            placebos: 4,
            treated_rank: None,
            ratio_p: None,
            gap_p: 0.2,
        });
        let tex = latex_tabular(&h);
        assert!(tex.contains("Post/pre RMSPE ratio & n/a"));
        assert!(tex.contains("Placebo rank p-value & n/a (4 placebos)"));
        assert!(!tex.contains("NaN") && !tex.contains("inf"));
    }

    #[test]
    fn writer_tracks_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ReportWriter::new(dir.path().join("out"));
        let monthly = vec![TreatedMonth {
            month: YearMonth::new(2023, 10).unwrap(),
            transactions: 3,
            total_spend: 65.4,
            unique_users: 2,
            median: Some(21.8),
            p25: Some(21.8),
            p75: None,
        }];
        let path = w.csv("chicago_monthly", treated_monthly_frame(&monthly).unwrap()).unwrap();
        w.json("summary", &Headline::new(&AnalysisConfig::default())).unwrap();
        assert_eq!(w.written().len(), 2);
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("month,transactions,total_spend"));
        assert!(text.contains("2023-10"));
        let json = std::fs::read_to_string(dir.path().join("out/summary.json")).unwrap();
        assert!(json.contains("\"treated\": \"606\""));
    }
}
