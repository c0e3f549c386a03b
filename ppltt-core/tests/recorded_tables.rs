//! Recorded tables from an in-memory panel, queried with polars.

use polars::prelude::*;
use ppltt_core::aggregate::OutcomePanel;
use ppltt_core::config::SynthConfig;
use ppltt_core::instrument::{RecordLayer, drain_to_dataframes};
use ppltt_core::placebo::run_placebos;
use ppltt_core::robustness::leave_k_out;
use ppltt_core::synth::synthetic_control;
use ppltt_core::{RECORDED_TABLES, YearMonth, Zip3};
use tracing_subscriber::prelude::*;

fn zip(s: &str) -> Zip3 {
    Zip3::parse(s).unwrap()
}

fn months() -> Vec<YearMonth> {
    YearMonth::range_inclusive(YearMonth::new(2023, 1).unwrap(), YearMonth::new(2024, 6).unwrap())
}

/// Six donors on distinct paths; the treated unit is the average of the
/// first two until October 2023, then drops by 0.3.
fn panel() -> (OutcomePanel, Vec<Zip3>) {
    let donors: Vec<Zip3> = ["100", "113", "126", "139", "152", "165"].iter().map(|s| zip(s)).collect();
    let cutoff = YearMonth::new(2023, 10).unwrap();
    let path = |i: usize, t: usize| {
        let (i, t) = (i as f64, t as f64);
        4.0 + 0.3 * i + 0.02 * (i + 1.0) * t + 0.1 * (t * (i + 1.0) * 0.7).sin()
    };
    let mut series: Vec<(Zip3, Vec<(YearMonth, f64)>)> = donors
        .iter()
        .enumerate()
        .map(|(i, z)| (*z, months().into_iter().enumerate().map(|(t, m)| (m, path(i, t))).collect()))
        .collect();
    let treated = months()
        .into_iter()
        .enumerate()
        .map(|(t, m)| {
            let base = 0.5 * path(0, t) + 0.5 * path(1, t);
            (m, if m >= cutoff { base - 0.3 } else { base })
        })
        .collect();
    series.push((Zip3::CHICAGO, treated));
    (OutcomePanel::from_series(&series), donors)
}

#[test]
fn placebo_and_leave_k_out_rows_are_recorded() {
    let (panel, donors) = panel();
    let cutoff = YearMonth::new(2023, 10).unwrap();
    let end = YearMonth::new(2024, 7).unwrap();
    let config = SynthConfig::default();

    let subscriber = tracing_subscriber::registry().with(RecordLayer::new(RECORDED_TABLES));
    let (placebo, lko) = tracing::subscriber::with_default(subscriber, || {
        let baseline = synthetic_control(&panel, Zip3::CHICAGO, &donors, cutoff, end).unwrap();
        let placebo = run_placebos(&panel, &baseline, &donors, &config, end, None);
        let lko = leave_k_out(&panel, &baseline, &donors, config.report_weight, 2, end);
        (placebo, lko)
    });
    let dfs = drain_to_dataframes();

    assert!((placebo.treated.post_gap + 0.3).abs() < 0.02, "gap {}", placebo.treated.post_gap);
    assert_eq!(placebo.tests[0].treated_rank, Some(1));

    let rows = dfs.get("placebo").expect("placebo table");
    assert_eq!(rows.height(), placebo.units.len());
    let treated = rows
        .clone()
        .lazy()
        .filter(col("is_treated"))
        .select([col("zip3"), col("post_gap")])
        .collect()
        .unwrap();
    assert_eq!(treated.height(), 1);
    assert_eq!(treated.column("zip3").unwrap().str().unwrap().get(0), Some("606"));

    let runs = dfs.get("leave_k_out").expect("leave_k_out table");
    let by_k = runs
        .clone()
        .lazy()
        .group_by([col("k")])
        .agg([col("post_gap").count().alias("runs"), col("post_gap").max().alias("max_gap")])
        .sort(["k"], Default::default())
        .collect()
        .unwrap();
    let ks: Vec<Option<u64>> = by_k.column("k").unwrap().u64().unwrap().into_iter().collect();
    assert_eq!(ks[0], Some(0));
    assert_eq!(by_k.height(), lko.by_k.len() + 1);
    let max_gap = by_k.column("max_gap").unwrap().f64().unwrap().max().unwrap();
    assert!(max_gap < 0.0, "removing donors never flips the sign here");

    assert!(!dfs.contains_key("donor_weight"), "only run_synth records donor weights");
}
