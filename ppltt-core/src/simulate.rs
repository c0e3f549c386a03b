//! Deterministic synthetic extracts with a known treatment effect.
//!
//! Every unit shares one adoption curve; unit size only shifts the level, so
//! a convex combination of donors reproduces the treated unit's pre-period
//! path and the post-period gap recovers `ln(1 + effect)`.

use std::path::PathBuf;

use chrono::{Datelike, Duration, NaiveDate};
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::calendar::YearMonth;
use crate::config::AnalysisConfig;
use crate::covariates::DEMOGRAPHIC_VARS;
use crate::error::Result;
use crate::io::write_parquet;
use crate::types::Zip3;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub seed: u64,
    pub treated: Zip3,
    /// Donors of comparable size; two out-of-range units are added on top.
    pub donors: usize,
    pub cards_per_unit: usize,
    pub start: NaiveDate,
    /// Exclusive.
    pub end: NaiveDate,
    pub treatment: NaiveDate,
    /// Relative change in the treated unit's transaction rate after treatment.
    pub effect: f64,
    pub tax_rate: f64,
    pub base_price: f64,
    /// Share of cards that stop transacting partway through.
    pub churn: f64,
    pub demographics: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 7,
            treated: Zip3::CHICAGO,
            donors: 20,
            cards_per_unit: 300,
            start: ymd(2023, 1, 1),
            end: ymd(2025, 3, 1),
            treatment: ymd(2023, 10, 1),
            effect: -0.2,
            tax_rate: 0.09,
            base_price: 20.0,
            churn: 0.08,
            demographics: true,
        }
    }
}

impl SimConfig {
    /// Post-period log gap the estimators should find.
    pub fn expected_log_effect(&self) -> f64 {
        (1.0 + self.effect).ln()
    }
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone)]
struct Unit {
    zip3: Zip3,
    cards: usize,
    /// Local price markup before the study's tax.
    markup: f64,
}

/// Donor codes are spread over the ZIP3 space and never collide with the treated unit.
fn unit_codes(treated: Zip3, n: usize) -> Vec<Zip3> {
    (0..)
        .map(|i| 100 + 13 * i)
        .take_while(|c| *c < 1000)
        .filter_map(|c| Zip3::parse(&c.to_string()))
        .filter(|z| *z != treated)
        .take(n)
        .collect()
}

fn units(sim: &SimConfig, rng: &mut StdRng) -> Vec<Unit> {
    let base = sim.cards_per_unit as f64;
    let mut out = vec![Unit {
        zip3: sim.treated,
        cards: sim.cards_per_unit,
        markup: 0.0,
    }];
    let codes = unit_codes(sim.treated, sim.donors + 2);
    for (i, zip3) in codes.into_iter().enumerate() {
        let scale = match i.checked_sub(sim.donors) {
            // Outside any sensible size window.
            Some(0) => 0.15,
            Some(_) => 3.0,
            None => rng.random_range(0.6..1.4),
        };
        out.push(Unit {
            zip3,
            cards: ((base * scale).round() as usize).max(1),
            markup: (rng.random_range(0.0..0.08_f64) * 100.0).round() / 100.0,
        });
    }
    out
}

/// Adoption curve shared by every unit: rises through the sample.
fn monthly_rate(month_index: usize) -> f64 {
    (0.35 + 0.01 * month_index as f64).min(0.75)
}

#[derive(Default)]
struct Columns {
    card_cardid: Vec<String>,
    card_linkid: Vec<String>,
    card_zip: Vec<String>,
    card_group: Vec<i64>,
    card_type: Vec<String>,
    tx_cardid: Vec<String>,
    tx_date: Vec<NaiveDate>,
    tx_amount: Vec<Option<f64>>,
    tx_merchid: Vec<String>,
    tx_service: Vec<String>,
    addr_cardid: Vec<String>,
    addr_zip: Vec<String>,
    addr_begin: Vec<String>,
    addr_end: Vec<String>,
    act_cardid: Vec<String>,
    act_date: Vec<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct SimSummary {
    pub units: Vec<Zip3>,
    pub cards: usize,
    pub transactions: usize,
    pub files: Vec<PathBuf>,
}

/// Write card, transaction, address, activity, and demographics extracts to
/// the locations `config.data` names.
pub fn simulate(config: &AnalysisConfig, sim: &SimConfig) -> Result<SimSummary> {
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let units = units(sim, &mut rng);
    let months = YearMonth::range_inclusive(
        YearMonth::from_date(sim.start),
        YearMonth::from_date(sim.end - Duration::days(1)),
    );
    let treatment = YearMonth::from_date(sim.treatment);
    let mut cols = Columns::default();

    for (u, unit) in units.iter().enumerate() {
        let shocks: Vec<f64> = months.iter().map(|_| rng.random_range(-0.02..0.02)).collect();
        for c in 0..unit.cards {
            let cardid = format!("c{u:03}{c:05}");
            let linkid = format!("l{u:03}{c:05}");
            let debit = rng.random_bool(0.1);
            cols.card_cardid.push(cardid.clone());
            cols.card_linkid.push(linkid);
            cols.card_zip.push(unit.zip3.to_string());
            cols.card_group.push(rng.random_range(1..=3));
            cols.card_type.push(if debit { "DEBIT" } else { "CREDIT" }.into());

            cols.addr_cardid.push(cardid.clone());
            cols.addr_zip.push(unit.zip3.to_string());
            cols.addr_begin.push("2022-01-01".into());
            cols.addr_end.push("2025-12-31".into());

            let last_active = if rng.random_bool(sim.churn) {
                let span = (sim.end - sim.start).num_days().max(2);
                sim.start + Duration::days(rng.random_range(span / 4..span))
            } else {
                sim.end
            };
            let mut day = sim.start + Duration::days(rng.random_range(0..10));
            while day < last_active {
                cols.act_cardid.push(cardid.clone());
                cols.act_date.push(day);
                day += Duration::days(10);
            }

            // Card-level merchant, skewed toward low indices.
            let merchid = format!("m{:02}", (rng.random::<f64>().powi(2) * 40.0) as usize);
            for (t, m) in months.iter().enumerate() {
                let first = m.first_day();
                if first >= last_active {
                    break;
                }
                let treated_post = unit.zip3 == sim.treated && *m >= treatment;
                let mut rate = monthly_rate(t) * (1.0 + shocks[t]);
                if treated_post {
                    rate *= 1.0 + sim.effect;
                }
                if !rng.random_bool(rate.clamp(0.0, 1.0)) {
                    continue;
                }
                let days = (m.last_day() - first).num_days() + 1;
                let date = first + Duration::days(rng.random_range(0..days));
                let tax = if treated_post { sim.tax_rate } else { 0.0 };
                let list = if rng.random_bool(0.03) { 200.0 } else { sim.base_price };
                let price = (list * (1.0 + unit.markup) * (1.0 + tax) * 100.0).round() / 100.0;
                cols.tx_cardid.push(cardid.clone());
                cols.tx_date.push(date);
                cols.tx_amount.push((!rng.random_bool(0.005)).then_some(price));
                cols.tx_merchid.push(merchid.clone());
                cols.tx_service.push(if rng.random_bool(0.9) { "ChatGPT" } else { "OpenAI" }.into());
            }
        }
    }

    let mut files = Vec::new();
    let cards = cols.card_cardid.len();
    let transactions = cols.tx_cardid.len();

    let mut card_df = DataFrame::new(vec![
        Column::new("cardid".into(), &cols.card_cardid),
        Column::new("cardlinkid".into(), &cols.card_linkid),
        Column::new("zip".into(), &cols.card_zip),
        Column::new("source_group".into(), &cols.card_group),
        Column::new("cardtype".into(), &cols.card_type),
    ])?;
    let path = config.data.path(&config.data.card_info);
    write_parquet(&mut card_df, &path)?;
    files.push(path);

    let years: Vec<i32> = (sim.start.year()..=(sim.end - Duration::days(1)).year()).collect();
    for &year in &years {
        let rows: Vec<usize> = (0..transactions).filter(|&i| cols.tx_date[i].year() == year).collect();
        let mut df = DataFrame::new(vec![
            Column::new(
                "cardid".into(),
                rows.iter().map(|&i| cols.tx_cardid[i].as_str()).collect::<Vec<_>>(),
            ),
            Column::new(
                "trans_date".into(),
                rows.iter().map(|&i| cols.tx_date[i].to_string()).collect::<Vec<_>>(),
            ),
            Column::new(
                "trans_amount".into(),
                rows.iter().map(|&i| cols.tx_amount[i]).collect::<Vec<_>>(),
            ),
            Column::new(
                "merchid".into(),
                rows.iter().map(|&i| cols.tx_merchid[i].as_str()).collect::<Vec<_>>(),
            ),
            Column::new(
                "service".into(),
                rows.iter().map(|&i| cols.tx_service[i].as_str()).collect::<Vec<_>>(),
            ),
        ])?;
        let path = config.data.transactions_path(year);
        write_parquet(&mut df, &path)?;
        files.push(path);
    }

    let mut addr_df = DataFrame::new(vec![
        Column::new("cardid".into(), &cols.addr_cardid),
        Column::new("zip".into(), &cols.addr_zip),
        Column::new("valid_begin".into(), &cols.addr_begin),
        Column::new("valid_end".into(), &cols.addr_end),
    ])?;
    let path = config.data.path(&config.data.address_map);
    write_parquet(&mut addr_df, &path)?;
    files.push(path);

    // Activity for the i-th configured file covers the i-th calendar year;
    // the last file takes everything after.
    let n_files = config.data.activity.len();
    for (i, name) in config.data.activity.iter().enumerate() {
        let year = sim.start.year() + i as i32;
        let rows: Vec<usize> = (0..cols.act_cardid.len())
            .filter(|&r| {
                let y = cols.act_date[r].year();
                y == year || (i + 1 == n_files && y > year)
            })
            .collect();
        let mut df = DataFrame::new(vec![
            Column::new(
                "cardid".into(),
                rows.iter().map(|&r| cols.act_cardid[r].as_str()).collect::<Vec<_>>(),
            ),
            Column::new(
                "trans_date".into(),
                rows.iter().map(|&r| cols.act_date[r].to_string()).collect::<Vec<_>>(),
            ),
        ])?;
        let path = config.data.path(name);
        write_parquet(&mut df, &path)?;
        files.push(path);
    }

    if sim.demographics {
        let mut df = demographics_frame(&units, sim, &mut rng)?;
        let path = config.data.path(&config.data.demographics);
        write_parquet(&mut df, &path)?;
        files.push(path);
    }

    info!(
        units = units.len(),
        cards,
        transactions,
        files = files.len(),
        "simulated extracts"
    );
    Ok(SimSummary {
        units: units.iter().map(|u| u.zip3).collect(),
        cards,
        transactions,
        files,
    })
}

/// Demographics loosely tied to unit size, so covariate models have signal.
fn demographics_frame(units: &[Unit], sim: &SimConfig, rng: &mut StdRng) -> Result<DataFrame> {
    let base = sim.cards_per_unit as f64;
    let mut values: Vec<Vec<f64>> = vec![Vec::with_capacity(units.len()); DEMOGRAPHIC_VARS.len()];
    let mut population = Vec::with_capacity(units.len());
    for u in units {
        let z = (u.cards as f64 / base).ln();
        let row = [
            0.30 + 0.10 * z + rng.random_range(-0.03..0.03),
            0.35 + 0.08 * z + rng.random_range(-0.03..0.03),
            0.20 + rng.random_range(-0.04..0.04),
            38.0 + rng.random_range(-4.0..4.0),
            70_000.0 + 15_000.0 * z + rng.random_range(-5_000.0..5_000.0),
            0.05 + rng.random_range(-0.02..0.02),
            0.85 + rng.random_range(-0.05..0.05),
        ];
        for (col, v) in values.iter_mut().zip(row) {
            col.push(v);
        }
        population.push(u.cards as f64 * 2_500.0 * rng.random_range(0.8..1.2));
    }

    let mut columns = vec![Column::new(
        "zip3".into(),
        units.iter().map(|u| u.zip3.to_string()).collect::<Vec<_>>(),
    )];
    for (name, col) in DEMOGRAPHIC_VARS.iter().zip(values) {
        columns.push(Column::new((*name).into(), col));
    }
    columns.push(Column::new("population".into(), population));
    Ok(DataFrame::new(columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn donor_codes_skip_the_treated_unit() {
        let treated = Zip3::parse("113").unwrap();
        let codes = unit_codes(treated, 5);
        assert_eq!(codes.len(), 5);
        assert!(!codes.contains(&treated));
        assert_eq!(codes[0].as_str(), "100");
        assert_eq!(codes[1].as_str(), "126");
    }

    #[test]
    fn out_of_range_units_come_last() {
        let sim = SimConfig {
            donors: 4,
            ..SimConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(sim.seed);
        let u = units(&sim, &mut rng);
        assert_eq!(u.len(), 7);
        assert_eq!(u[0].zip3, Zip3::CHICAGO);
        assert_eq!(u[0].markup, 0.0);
        assert!(u[1..5].iter().all(|x| x.cards >= 180 && x.cards <= 420));
        assert_eq!(u[5].cards, 45);
        assert_eq!(u[6].cards, 900);
    }

    #[test]
    fn writes_every_extract() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AnalysisConfig::default();
        config.data.data_dir = dir.path().to_path_buf();
        let sim = SimConfig {
            donors: 3,
            cards_per_unit: 20,
            ..SimConfig::default()
        };
        let summary = simulate(&config, &sim).unwrap();
        assert_eq!(summary.units.len(), 6);
        assert!(summary.transactions > 0);
        // card info, 3 transaction years, address map, 2 activity files, demographics
        assert_eq!(summary.files.len(), 8);
        assert!(summary.files.iter().all(|p| p.exists()));
        assert!(config.data.transactions_path(2025).exists());
    }
}
