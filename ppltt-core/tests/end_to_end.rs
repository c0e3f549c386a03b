use ppltt_core::AnalysisConfig;
use ppltt_core::load::load_with_zip3;
use ppltt_core::pipeline::run_all;
use ppltt_core::simulate::{SimConfig, simulate};
use ppltt_core::synth::run_synth;

fn simulated_with(dir: &std::path::Path, donors: usize) -> (AnalysisConfig, SimConfig) {
    let mut config = AnalysisConfig::default();
    config.data.data_dir = dir.join("data");
    config.synth.max_leave_k = 2;
    let sim = SimConfig {
        donors,
        cards_per_unit: 250,
        ..SimConfig::default()
    };
    simulate(&config, &sim).unwrap();
    (config, sim)
}

fn simulated(dir: &std::path::Path) -> (AnalysisConfig, SimConfig) {
    simulated_with(dir, 12)
}

#[test]
fn donor_pool_excludes_units_outside_the_size_window() {
    let dir = tempfile::tempdir().unwrap();
    let (mut config, sim) = simulated(dir.path());
    config.sample.use_panel = false;

    let trans = load_with_zip3(&config).unwrap();
    let synth = run_synth(&trans, &config).unwrap();
    let pool = &synth.pool;
    assert!(!pool.donors.contains(&sim.treated));
    // The two out-of-range units are the last codes generated.
    assert!(pool.donors.len() <= sim.donors);
    assert!(pool.donors.len() >= sim.donors / 2, "most comparable donors should match");

    let total: f64 = synth.result.weights.iter().map(|w| w.weight).sum();
    assert!((total - 1.0).abs() < 1e-6);
    assert!(synth.result.pre_rmspe < 0.2, "pre fit rmspe {}", synth.result.pre_rmspe);
}

#[test]
fn full_run_recovers_the_injected_effect() {
    let dir = tempfile::tempdir().unwrap();
    let (config, sim) = simulated(dir.path());
    let out = dir.path().join("out");

    let summary = run_all(&config, &out).unwrap();
    let expected = sim.expected_log_effect();
    let h = &summary.headline;

    assert!(config.data.path(&config.data.panel).exists(), "panel is built on demand");
    assert!(out.join("panel_windows.csv").exists());

    let did = h.did.as_ref().unwrap();
    assert!(
        (did.estimate - expected).abs() < 0.1,
        "DiD {} vs injected {}",
        did.estimate,
        expected
    );
    assert!(did.p < 0.05);

    let synth = h.synth.as_ref().unwrap();
    assert!(
        (synth.post_gap - expected).abs() < 0.08,
        "synthetic control gap {} vs injected {}",
        synth.post_gap,
        expected
    );
    assert!(synth.rmspe_ratio.unwrap() > 1.0);

    let placebo = h.placebo.as_ref().unwrap();
    let rank = placebo.treated_rank.unwrap();
    assert!(rank <= 2, "treated rank {rank}");

    let lko = h.leave_k_out.as_ref().unwrap();
    assert!(lko.same_sign_share() > 0.9);

    let prices = h.prices.as_ref().unwrap();
    let (pre, post) = (prices.pre_mean.unwrap(), prices.post_mean.unwrap());
    assert!((pre - 20.0).abs() < 0.01, "treated pre price {pre}");
    assert!((post - 21.8).abs() < 0.01, "treated post price {post}");

    for name in [
        "summary.json",
        "summary.tex",
        "treated_monthly.csv",
        "tax_change_scan.csv",
        "event_study.csv",
        "synth_series.csv",
        "placebo_tests.csv",
        "leave_k_out_runs.csv",
        "covariate_validation_ols.csv",
    ] {
        assert!(out.join(name).exists(), "missing {name}");
    }
    let tex = std::fs::read_to_string(out.join("summary.tex")).unwrap();
    assert!(tex.contains("Chicago, IL (606)"));
}

#[test]
fn small_pool_still_writes_the_summary() {
    let dir = tempfile::tempdir().unwrap();
    let (mut config, _) = simulated_with(dir.path(), 6);
    config.sample.use_panel = false;
    let out = dir.path().join("out");

    // Too few markets for the covariate regressions; that stage is skipped.
    let summary = run_all(&config, &out).unwrap();
    assert!(summary.headline.did.is_some());
    assert!(summary.headline.synth.is_some());
    assert!(out.join("summary.json").exists());
    assert!(out.join("summary.tex").exists());
    assert!(!out.join("covariate_validation_ols.csv").exists());
    assert!(summary.written.iter().any(|p| p.ends_with("placebo_tests.csv")));
}
