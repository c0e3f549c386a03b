//! Stage runners shared by the CLI subcommands and `run_all`.
//!
//! Each `write_*` function takes a finished result and writes its tables
//! through a [`ReportWriter`]; `run_all` chains the stages over one load.

use std::path::{Path, PathBuf};

use tracing::{info, info_span, warn};

use crate::calendar::YearMonth;
use crate::config::{AmountFilter, AnalysisConfig};
use crate::covariates::{CovariateValidation, load_demographics, populations, run_covariates};
use crate::describe::{
    PriceStats, bucket_periods, pass_through_check, price_buckets, price_stats, tax_change_scan,
    treated_monthly_summary,
};
use crate::did::{DidAnalysis, run_did};
use crate::error::Result;
use crate::load::load_with_zip3;
use crate::modal_zip3::ModalZip3Run;
use crate::panelize::{PanelResult, run_panelize};
use crate::placebo::{PlaceboAnalysis, run_placebos};
use crate::report::{self, Headline, ReportWriter};
use crate::robustness::{LeaveKOut, leave_k_out};
use crate::synth::{SynthAnalysis, run_synth};
use crate::types::Transaction;

pub fn write_panelize(result: &PanelResult, w: &mut ReportWriter) -> Result<()> {
    w.csv("panel_windows", report::panel_window_frame(&result.windows)?)?;
    Ok(())
}

pub fn write_monthly_zip3(run: &ModalZip3Run, w: &mut ReportWriter) -> Result<()> {
    w.csv("bouncers", report::bouncer_frame(&run.bouncers)?)?;
    Ok(())
}

/// Treated-market price series and the pass-through check.
pub fn write_describe(trans: &[Transaction], config: &AnalysisConfig, w: &mut ReportWriter) -> Result<PriceStats> {
    let monthly = treated_monthly_summary(trans, config.sample.treated, config.describe.end);
    let checks = pass_through_check(&monthly, &config.describe);
    let stats = price_stats(&monthly, &config.study);
    w.csv("treated_monthly", report::treated_monthly_frame(&monthly)?)?;
    w.csv("pass_through", report::pass_through_frame(&checks)?)?;
    w.json("price_stats", &stats)?;
    Ok(stats)
}

/// Expects transactions loaded without an amount filter.
pub fn write_price_buckets(all_amounts: &[Transaction], config: &AnalysisConfig, w: &mut ReportWriter) -> Result<()> {
    let monthly = price_buckets(all_amounts);
    let periods = bucket_periods(&monthly, config.describe.bucket_split);
    w.csv("price_buckets_monthly", report::bucket_frame(&monthly)?)?;
    w.csv("price_buckets_periods", report::bucket_period_frame(&periods)?)?;
    Ok(())
}

pub fn write_tax_changes(trans: &[Transaction], config: &AnalysisConfig, w: &mut ReportWriter) -> Result<()> {
    let changes = tax_change_scan(trans, &config.describe);
    w.csv("tax_change_scan", report::price_change_frame(&changes)?)?;
    Ok(())
}

pub fn write_did(did: &DidAnalysis, w: &mut ReportWriter) -> Result<()> {
    w.csv("did_series", report::did_series_frame(&did.panel)?)?;
    w.csv("event_study", report::event_study_frame(did)?)?;
    w.json("did_twfe", &did.twfe)?;
    w.json("donor_pool", &did.pool)?;
    if let Some(p) = &did.pretrend {
        w.json("pretrend_test", p)?;
    }
    Ok(())
}

pub fn write_synth(synth: &SynthAnalysis, w: &mut ReportWriter) -> Result<()> {
    w.csv("synth_series", report::synth_series_frame(synth)?)?;
    w.csv("synth_weights", report::donor_weight_frame(&synth.result.weights)?)?;
    w.csv("synth_periods", report::period_comparison_frame(synth)?)?;
    Ok(())
}

pub fn write_placebo(placebo: &PlaceboAnalysis, w: &mut ReportWriter) -> Result<()> {
    w.csv("placebo_units", report::placebo_frame(placebo)?)?;
    w.csv("placebo_tests", report::placebo_test_frame(placebo)?)?;
    w.csv("placebo_gaps", report::placebo_gap_frame(placebo)?)?;
    w.json("placebo_size", &placebo.size)?;
    Ok(())
}

pub fn write_leave_k_out(lko: &LeaveKOut, w: &mut ReportWriter) -> Result<()> {
    w.csv("leave_k_out_runs", report::leave_k_out_frame(lko)?)?;
    w.csv("leave_k_out_by_k", report::leave_k_out_summary_frame(lko)?)?;
    w.csv("leave_k_out_series", report::leave_k_out_series_frame(lko)?)?;
    if let Some(o) = &lko.overall {
        w.json("leave_k_out_summary", o)?;
    }
    Ok(())
}

pub fn write_covariates(cv: &CovariateValidation, w: &mut ReportWriter) -> Result<()> {
    for (name, df) in report::covariate_frames(cv)? {
        w.csv(name, df)?;
    }
    Ok(())
}

/// Placebo inference for a finished synthetic control, with population
/// regressions when a readable demographics extract is present.
pub fn placebos_for(synth: &SynthAnalysis, config: &AnalysisConfig) -> PlaceboAnalysis {
    let pops = if config.data.path(&config.data.demographics).exists() {
        match load_demographics(config) {
            Ok(demo) => Some(populations(&demo)),
            Err(e) => {
                warn!(error = %e, "demographics unreadable, placebo size regressions skip population");
                None
            }
        }
    } else {
        None
    };
    run_placebos(
        &synth.panel,
        &synth.result,
        &synth.pool.donors,
        &config.synth,
        YearMonth::from_date(config.study.end),
        pops.as_ref(),
    )
}

pub fn leave_k_out_for(synth: &SynthAnalysis, config: &AnalysisConfig) -> LeaveKOut {
    leave_k_out(
        &synth.panel,
        &synth.result,
        &synth.pool.donors,
        config.synth.report_weight,
        config.synth.max_leave_k,
        YearMonth::from_date(config.study.end),
    )
}

/// Transactions loaded once without the amount filter, then filtered.
pub fn load_both(config: &AnalysisConfig) -> Result<(Vec<Transaction>, Vec<Transaction>)> {
    let mut unfiltered = config.clone();
    unfiltered.sample.amount_filter = AmountFilter::All;
    let all = load_with_zip3(&unfiltered)?;
    let filter = config.sample.amount_filter;
    let filtered: Vec<Transaction> = all.iter().filter(|t| filter.admits(t.amount)).cloned().collect();
    info!(rows = filtered.len(), all = all.len(), filter = filter.label(), "amount filter");
    Ok((all, filtered))
}

#[derive(Debug)]
pub struct RunSummary {
    pub headline: Headline,
    pub written: Vec<PathBuf>,
}

/// Every stage over one load; outputs land flat in `out_dir`.
///
/// Covariate validation is auxiliary: when it cannot run, the headline
/// summary is still written.
pub fn run_all(config: &AnalysisConfig, out_dir: &Path) -> Result<RunSummary> {
    config.validate()?;
    let mut w = ReportWriter::new(out_dir);
    w.json("config", config)?;

    if config.sample.use_panel && !config.data.path(&config.data.panel).exists() {
        let _span = info_span!("panelize").entered();
        warn!("panel file missing, building it");
        let result = run_panelize(config)?;
        write_panelize(&result, &mut w)?;
    }

    let (all, trans) = load_both(config)?;
    let mut headline = Headline::new(config);

    {
        let _span = info_span!("describe").entered();
        let stats = write_describe(&trans, config, &mut w)?;
        write_price_buckets(&all, config, &mut w)?;
        write_tax_changes(&trans, config, &mut w)?;
        headline = headline.with_prices(stats);
    }

    {
        let _span = info_span!("did").entered();
        let did = run_did(&trans, config)?;
        write_did(&did, &mut w)?;
        headline = headline.with_did(&did);
    }

    {
        let _span = info_span!("synth").entered();
        let synth = run_synth(&trans, config)?;
        write_synth(&synth, &mut w)?;
        headline = headline.with_synth(&synth, config.synth.report_weight);

        let placebo = placebos_for(&synth, config);
        write_placebo(&placebo, &mut w)?;
        headline = headline.with_placebo(&placebo);

        let lko = leave_k_out_for(&synth, config);
        write_leave_k_out(&lko, &mut w)?;
        headline = headline.with_leave_k_out(&lko);
    }

    if config.data.path(&config.data.demographics).exists() {
        let _span = info_span!("covariates").entered();
        match run_covariates(&trans, config) {
            Ok(cv) => write_covariates(&cv, &mut w)?,
            Err(e) => warn!(error = %e, "covariate validation skipped"),
        }
    } else {
        info!("no demographics extract, skipping covariate validation");
    }

    w.json("summary", &headline)?;
    w.text("summary.tex", &report::latex_tabular(&headline))?;
    info!(files = w.written().len(), dir = %out_dir.display(), "run complete");
    Ok(RunSummary {
        headline,
        written: w.written().to_vec(),
    })
}
