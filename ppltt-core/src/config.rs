//! Analysis configuration.
//!
//! Every knob the pipeline exposes lives here. A JSON file may override any
//! subset of fields; unspecified fields keep the defaults below.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::calendar::YearMonth;
use crate::error::{AnalysisError, Result};
use crate::types::Zip3;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or(NaiveDate::MIN)
}

fn month(y: i32, m: u32) -> YearMonth {
    YearMonth { year: y, month: m }
}

// ============================================================================
// Sample selection
// ============================================================================

/// Transaction-amount restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountFilter {
    /// $20-22: the Plus price with and without the tax.
    PlusRange,
    /// $15-25.
    WideRange,
    /// Everything outside $20-22.
    Outside,
    All,
}

impl AmountFilter {
    /// Unparseable amounts only pass the `All` filter.
    pub fn admits(self, amount: Option<f64>) -> bool {
        match (self, amount) {
            (AmountFilter::All, _) => true,
            (_, None) => false,
            (AmountFilter::PlusRange, Some(a)) => (20.0..=22.0).contains(&a),
            (AmountFilter::WideRange, Some(a)) => (15.0..=25.0).contains(&a),
            (AmountFilter::Outside, Some(a)) => !(20.0..=22.0).contains(&a),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AmountFilter::PlusRange => "$20-$22 transactions",
            AmountFilter::WideRange => "$15-$25 transactions",
            AmountFilter::Outside => "outside $20-$22 transactions",
            AmountFilter::All => "all amounts",
        }
    }
}

/// Outcome aggregated per ZIP3-month and modelled in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "trans")]
    Transactions,
    #[serde(rename = "unique_users")]
    UniqueUsers,
    #[serde(rename = "spend")]
    Spend,
}

impl Outcome {
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Transactions => "Log Transactions",
            Outcome::UniqueUsers => "Log Unique Users",
            Outcome::Spend => "Log Total Spend",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            Outcome::Transactions => "log_trans",
            Outcome::UniqueUsers => "log_users",
            Outcome::Spend => "log_spend",
        }
    }
}

/// Where a transaction's ZIP3 comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zip3Source {
    /// The card table's single ZIP per card.
    Static,
    /// The modal ZIP3 of the card in the transaction's month.
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    pub treated: Zip3,
    /// Matched case-insensitively against the `service` column.
    pub services: Vec<String>,
    pub years: Vec<i32>,
    pub amount_filter: AmountFilter,
    pub use_top_merchants: bool,
    pub top_merchants: usize,
    /// Restrict to cards whose cardlinkid is in the constant-individual panel.
    pub use_panel: bool,
    pub outcome: Outcome,
    pub zip3_source: Zip3Source,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            treated: Zip3::CHICAGO,
            services: vec!["chatgpt".into(), "openai".into()],
            years: vec![2023, 2024, 2025],
            amount_filter: AmountFilter::WideRange,
            use_top_merchants: false,
            top_merchants: 30,
            use_panel: true,
            outcome: Outcome::Transactions,
            zip3_source: Zip3Source::Static,
        }
    }
}

impl SampleConfig {
    /// Parenthesised description of the active restrictions, for titles.
    pub fn filter_title(&self) -> String {
        let mut parts = Vec::new();
        if self.use_panel {
            parts.push("constant panel".to_string());
        }
        if self.use_top_merchants {
            parts.push(format!("top {} merchants", self.top_merchants));
        }
        if self.amount_filter != AmountFilter::All {
            parts.push(self.amount_filter.label().to_string());
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("({})", parts.join(", "))
        }
    }
}

// ============================================================================
// Study design
// ============================================================================

/// Sample window and treatment timing. `end` is exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyDates {
    pub start: NaiveDate,
    pub treatment: NaiveDate,
    pub end: NaiveDate,
    /// Donor size is measured over `[start, size_window_end)`.
    pub size_window_end: NaiveDate,
}

impl Default for StudyDates {
    fn default() -> Self {
        Self {
            start: date(2023, 3, 1),
            treatment: date(2023, 10, 1),
            end: date(2024, 12, 1),
            size_window_end: date(2023, 7, 1),
        }
    }
}

impl StudyDates {
    pub fn contains(&self, d: NaiveDate) -> bool {
        d >= self.start && d < self.end
    }

    pub fn treatment_month(&self) -> YearMonth {
        YearMonth::from_date(self.treatment)
    }
}

/// Statistic used to measure unit size when matching donors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeMetric {
    Transactions,
    Users,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DonorConfig {
    /// Donors must be within this fraction of the treated unit's size.
    pub size_window: f64,
    pub size_metric: SizeMetric,
}

impl Default for DonorConfig {
    fn default() -> Self {
        Self {
            size_window: 0.5,
            size_metric: SizeMetric::Transactions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DidFrequency {
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DidConfig {
    pub frequency: DidFrequency,
    /// Event-study month normalised to zero.
    pub reference_month: YearMonth,
    /// First month included in the joint pre-trend test.
    pub pretrend_start: YearMonth,
}

impl Default for DidConfig {
    fn default() -> Self {
        Self {
            frequency: DidFrequency::Weekly,
            reference_month: month(2023, 9),
            pretrend_start: month(2023, 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceboPool {
    All,
    /// Donors in the top quartile of mean pre-period outcome.
    TopQuartile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Donors above this weight are reported and used for leave-k-out.
    pub report_weight: f64,
    pub placebo_pool: PlaceboPool,
    /// Placebos are kept when `pre_rmspe < m * treated_pre_rmspe`.
    pub rmspe_thresholds: Vec<f64>,
    /// Placebos below this multiple of the treated pre-RMSPE enter the size regressions.
    pub good_fit_multiplier: f64,
    /// Upper bound on k for leave-k-out; the number of combinations grows fast.
    pub max_leave_k: usize,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            report_weight: 0.01,
            placebo_pool: PlaceboPool::All,
            rmspe_thresholds: vec![2.0, 5.0, 20.0],
            good_fit_multiplier: 5.0,
            max_leave_k: 4,
        }
    }
}

// ============================================================================
// Data preparation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelizeConfig {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub window_days: i64,
}

impl Default for PanelizeConfig {
    fn default() -> Self {
        Self {
            start: date(2023, 3, 1),
            end: date(2024, 11, 30),
            window_days: 70,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModalZip3Config {
    pub first_month: YearMonth,
    pub last_month: YearMonth,
    /// Cards with more address rows than this are reported as bouncers.
    pub bouncer_rows: usize,
}

impl Default for ModalZip3Config {
    fn default() -> Self {
        Self {
            first_month: month(2022, 1),
            last_month: month(2025, 7),
            bouncer_rows: 50,
        }
    }
}

// ============================================================================
// Descriptives
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxPeriod {
    pub label: String,
    pub rate: f64,
    pub from: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMarker {
    pub label: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DescribeConfig {
    pub base_price: f64,
    /// Ordered by `from`; each period runs until the next one starts.
    pub tax_periods: Vec<TaxPeriod>,
    /// Descriptive series run through this date (exclusive).
    pub end: NaiveDate,
    /// National bucket shares are compared before and after this date.
    pub bucket_split: NaiveDate,
    pub scan_baseline: YearMonth,
    pub scan_comparison: YearMonth,
    pub scan_min_trans: usize,
    pub scan_flag_pct: f64,
}

impl Default for DescribeConfig {
    fn default() -> Self {
        Self {
            base_price: 20.0,
            tax_periods: vec![
                TaxPeriod {
                    label: "9% PPLTT".into(),
                    rate: 0.09,
                    from: date(2023, 10, 1),
                },
                TaxPeriod {
                    label: "11% PPLTT".into(),
                    rate: 0.11,
                    from: date(2025, 1, 1),
                },
            ],
            end: date(2025, 12, 1),
            bucket_split: date(2024, 12, 1),
            scan_baseline: month(2023, 3),
            scan_comparison: month(2024, 11),
            scan_min_trans: 50,
            scan_flag_pct: 5.0,
        }
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// Locations of the raw extracts, relative to `data_dir` unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSources {
    pub data_dir: PathBuf,
    /// `{year}` is replaced by each configured year.
    pub transactions: String,
    pub card_info: String,
    pub panel: String,
    pub activity: Vec<String>,
    pub address_map: String,
    pub monthly_zip3: String,
    pub demographics: String,
}

impl Default for DataSources {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            transactions: "chatgpt_transactions_{year}.parquet".into(),
            card_info: "chatgpt_card_info.parquet".into(),
            panel: "panel_cardlinkids.parquet".into(),
            activity: vec![
                "activity_dates_2023.parquet".into(),
                "activity_dates_2024.parquet".into(),
            ],
            address_map: "chatgpt_demographics_tv.parquet".into(),
            monthly_zip3: "cardid_monthly_zip3.parquet".into(),
            demographics: "zip3_demographics_acs2022.parquet".into(),
        }
    }
}

impl DataSources {
    pub fn path(&self, name: &str) -> PathBuf {
        let p = Path::new(name);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.data_dir.join(p)
        }
    }

    pub fn transactions_path(&self, year: i32) -> PathBuf {
        self.path(&self.transactions.replace("{year}", &year.to_string()))
    }
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub data: DataSources,
    pub sample: SampleConfig,
    pub study: StudyDates,
    pub donors: DonorConfig,
    pub did: DidConfig,
    pub synth: SynthConfig,
    pub panelize: PanelizeConfig,
    pub modal_zip3: ModalZip3Config,
    pub describe: DescribeConfig,
    pub events: Vec<EventMarker>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            data: DataSources::default(),
            sample: SampleConfig::default(),
            study: StudyDates::default(),
            donors: DonorConfig::default(),
            did: DidConfig::default(),
            synth: SynthConfig::default(),
            panelize: PanelizeConfig::default(),
            modal_zip3: ModalZip3Config::default(),
            describe: DescribeConfig::default(),
            events: vec![
                EventMarker {
                    label: "ChatGPT Plus".into(),
                    date: date(2023, 2, 1),
                },
                EventMarker {
                    label: "9% PPLTT".into(),
                    date: date(2023, 10, 1),
                },
            ],
        }
    }
}

impl AnalysisConfig {
    /// Read a JSON config; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| AnalysisError::io(path, e))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.study;
        if !(s.start < s.treatment && s.treatment < s.end) {
            return Err(AnalysisError::InvalidConfig(format!(
                "need start < treatment < end, got {} / {} / {}",
                s.start, s.treatment, s.end
            )));
        }
        if s.size_window_end <= s.start {
            return Err(AnalysisError::InvalidConfig(
                "size_window_end must fall after start".into(),
            ));
        }
        if !(self.donors.size_window > 0.0 && self.donors.size_window <= 1.0) {
            return Err(AnalysisError::InvalidConfig(format!(
                "size_window must be in (0, 1], got {}",
                self.donors.size_window
            )));
        }
        if self.sample.services.is_empty() {
            return Err(AnalysisError::InvalidConfig("no services selected".into()));
        }
        if self.sample.years.is_empty() {
            return Err(AnalysisError::InvalidConfig("no years selected".into()));
        }
        if self.panelize.window_days <= 0 || self.panelize.end <= self.panelize.start {
            return Err(AnalysisError::InvalidConfig(
                "panelize needs a positive window inside a non-empty study period".into(),
            ));
        }
        if self.synth.rmspe_thresholds.iter().any(|m| *m <= 0.0) || self.synth.good_fit_multiplier <= 0.0 {
            return Err(AnalysisError::InvalidConfig(
                "RMSPE multipliers must be positive".into(),
            ));
        }
        if self.modal_zip3.last_month < self.modal_zip3.first_month {
            return Err(AnalysisError::InvalidConfig(
                "modal_zip3 month range is inverted".into(),
            ));
        }
        Ok(())
    }
}
