//! `ppltt`: run the transaction-tax analyses from the command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use instrument::{RecordLayer, RunRecorder};
use ppltt_core::pipeline::{self, load_both};
use ppltt_core::report::{Headline, ReportWriter};
use ppltt_core::simulate::{SimConfig, simulate};
use ppltt_core::{AnalysisConfig, RECORDED_TABLES, Zip3};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "ppltt")]
#[command(about = "Effect of a per-unit transaction tax on subscription spending")]
#[command(version = ppltt_core::VERSION)]
struct Cli {
    /// JSON config; unspecified fields take their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the raw extracts
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Output directory for tables and summaries
    #[arg(long, global = true, default_value = "output")]
    out: PathBuf,

    /// Treated ZIP3
    #[arg(long, global = true)]
    treated: Option<String>,

    /// Outcome aggregated per ZIP3-period
    #[arg(long, global = true, value_parser = ["trans", "unique_users", "spend"])]
    outcome: Option<String>,

    /// Transaction-amount restriction
    #[arg(long, global = true, value_parser = ["plus_range", "wide_range", "outside", "all"])]
    amount_filter: Option<String>,

    /// Use every card instead of the constant panel
    #[arg(long, global = true)]
    no_panel: bool,

    /// Keep only the N merchants with the most transactions
    #[arg(long, global = true)]
    top_merchants: Option<usize>,

    /// Assign ZIP3 from the monthly modal address instead of the card table
    #[arg(long, global = true)]
    monthly_zip3: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the constant panel of cardlinkids active in every window
    Panelize,

    /// Assign each card a modal ZIP3 per month from the address history
    MonthlyZip3,

    /// Treated-market price series and tax pass-through check
    Describe,

    /// National shares of Plus, Pro, and other price points
    PriceBuckets,

    /// Per-ZIP3 median price change between two months
    TaxChanges,

    /// TWFE difference-in-differences, event study, and pre-trend test
    Did,

    /// Synthetic control against size-matched donors
    Synth,

    /// Synthetic control plus in-space placebo inference
    Placebo,

    /// Synthetic control refit without each combination of heavy donors
    LeaveKOut,

    /// Do demographics and price predict pre-period market size?
    Covariates,

    /// Write synthetic extracts with a known effect into the data directory
    Simulate {
        #[arg(long, default_value = "7")]
        seed: u64,

        /// Comparable donor ZIP3s to generate
        #[arg(long, default_value = "20")]
        donors: usize,

        /// Cards in the treated ZIP3; donors scatter around this
        #[arg(long, default_value = "300")]
        cards: usize,

        /// Relative change in the treated transaction rate after treatment
        #[arg(long, default_value = "-0.2", allow_hyphen_values = true)]
        effect: f64,

        /// Skip the demographics extract
        #[arg(long)]
        no_demographics: bool,
    },

    /// Every stage in sequence, with summary.json and summary.tex
    RunAll,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Panelize => "panelize",
            Commands::MonthlyZip3 => "monthly_zip3",
            Commands::Describe => "describe",
            Commands::PriceBuckets => "price_buckets",
            Commands::TaxChanges => "tax_changes",
            Commands::Did => "did",
            Commands::Synth => "synth",
            Commands::Placebo => "placebo",
            Commands::LeaveKOut => "leave_k_out",
            Commands::Covariates => "covariates",
            Commands::Simulate { .. } => "simulate",
            Commands::RunAll => "run_all",
        }
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("unrecognised value `{value}`"))
}

fn build_config(cli: &Cli) -> Result<AnalysisConfig> {
    let mut config = match &cli.config {
        Some(path) => AnalysisConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AnalysisConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data.data_dir = dir.clone();
    }
    if let Some(z) = &cli.treated {
        config.sample.treated = z.parse::<Zip3>()?;
    }
    if let Some(o) = &cli.outcome {
        config.sample.outcome = parse_enum(o)?;
    }
    if let Some(f) = &cli.amount_filter {
        config.sample.amount_filter = parse_enum(f)?;
    }
    if cli.no_panel {
        config.sample.use_panel = false;
    }
    if let Some(n) = cli.top_merchants {
        config.sample.use_top_merchants = true;
        config.sample.top_merchants = n;
    }
    if cli.monthly_zip3 {
        config.sample.zip3_source = ppltt_core::Zip3Source::Monthly;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing() -> Result<()> {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    for target in RECORDED_TABLES {
        filter = filter.add_directive(format!("{target}=off").parse()?);
    }
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(filter))
        .with(RecordLayer::new(RECORDED_TABLES))
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: &Cli, config: &AnalysisConfig) -> Result<()> {
    let mut w = ReportWriter::new(&cli.out);
    let headline = Headline::new(config);

    match &cli.command {
        Commands::Panelize => {
            let result = ppltt_core::panelize::run_panelize(config).context("panelize")?;
            pipeline::write_panelize(&result, &mut w)?;
            println!("{} cardlinkids in the constant panel", result.members.len());
        }
        Commands::MonthlyZip3 => {
            let run = ppltt_core::modal_zip3::run_monthly_zip3(config).context("monthly zip3")?;
            pipeline::write_monthly_zip3(&run, &mut w)?;
            println!(
                "{} card-months assigned, {} bouncers reported",
                run.assignments.len(),
                run.bouncers.len()
            );
        }
        Commands::Describe => {
            let trans = ppltt_core::load::load_with_zip3(config)?;
            let stats = pipeline::write_describe(&trans, config, &mut w)?;
            print_json(&stats)?;
        }
        Commands::PriceBuckets => {
            let (all, _) = load_both(config)?;
            pipeline::write_price_buckets(&all, config, &mut w)?;
        }
        Commands::TaxChanges => {
            let trans = ppltt_core::load::load_with_zip3(config)?;
            pipeline::write_tax_changes(&trans, config, &mut w)?;
        }
        Commands::Did => {
            let trans = ppltt_core::load::load_with_zip3(config)?;
            let did = ppltt_core::did::run_did(&trans, config).context("difference-in-differences")?;
            pipeline::write_did(&did, &mut w)?;
            print_json(&headline.with_did(&did).did)?;
        }
        Commands::Synth => {
            let trans = ppltt_core::load::load_with_zip3(config)?;
            let synth = ppltt_core::synth::run_synth(&trans, config).context("synthetic control")?;
            pipeline::write_synth(&synth, &mut w)?;
            print_json(&headline.with_synth(&synth, config.synth.report_weight).synth)?;
        }
        Commands::Placebo => {
            let trans = ppltt_core::load::load_with_zip3(config)?;
            let synth = ppltt_core::synth::run_synth(&trans, config).context("synthetic control")?;
            let placebo = pipeline::placebos_for(&synth, config);
            pipeline::write_synth(&synth, &mut w)?;
            pipeline::write_placebo(&placebo, &mut w)?;
            print_json(&placebo.tests)?;
        }
        Commands::LeaveKOut => {
            let trans = ppltt_core::load::load_with_zip3(config)?;
            let synth = ppltt_core::synth::run_synth(&trans, config).context("synthetic control")?;
            let lko = pipeline::leave_k_out_for(&synth, config);
            pipeline::write_leave_k_out(&lko, &mut w)?;
            print_json(&lko.overall)?;
        }
        Commands::Covariates => {
            let trans = ppltt_core::load::load_with_zip3(config)?;
            let cv = ppltt_core::covariates::run_covariates(&trans, config).context("covariate validation")?;
            pipeline::write_covariates(&cv, &mut w)?;
            print_json(&cv.partial_r2)?;
        }
        Commands::Simulate {
            seed,
            donors,
            cards,
            effect,
            no_demographics,
        } => {
            let sim = SimConfig {
                seed: *seed,
                treated: config.sample.treated,
                donors: *donors,
                cards_per_unit: *cards,
                effect: *effect,
                demographics: !no_demographics,
                ..SimConfig::default()
            };
            let summary = simulate(config, &sim).context("writing simulated extracts")?;
            println!(
                "{} units, {} cards, {} transactions written to {}",
                summary.units.len(),
                summary.cards,
                summary.transactions,
                config.data.data_dir.display()
            );
            return Ok(());
        }
        Commands::RunAll => {
            let summary = pipeline::run_all(config, &cli.out)?;
            print_json(&summary.headline)?;
            return Ok(());
        }
    }

    info!(files = w.written().len(), dir = %w.dir().display(), "outputs written");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;
    let config = build_config(&cli)?;

    // Recorded tables are flushed to parquet when this drops.
    let _recorder = RunRecorder::new(cli.out.join("recorded"), cli.command.name());
    run(&cli, &config)
}
