//! Monthly ZIP3 per card from the time-varying address map.
//!
//! The address map records daily-noisy ZIPs as validity intervals. Each
//! card-month gets the ZIP3 covering the most days of that month.

use std::collections::BTreeMap;

use polars::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::calendar::{YearMonth, overlap_days};
use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::io::{Table, read_table, write_parquet};
use crate::types::{AddressSpan, Zip3};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardMonthZip3 {
    pub cardid: String,
    pub month: YearMonth,
    pub zip3: Zip3,
}

/// Modal ZIP3 of one card-month and how many of the covered days it holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModalMonth {
    pub month: YearMonth,
    pub zip3: Zip3,
    pub days: i64,
    pub covered_days: i64,
}

impl ModalMonth {
    pub fn share(&self) -> f64 {
        if self.covered_days > 0 {
            self.days as f64 / self.covered_days as f64
        } else {
            0.0
        }
    }
}

fn month_span(m: YearMonth) -> (chrono::NaiveDate, chrono::NaiveDate) {
    (m.first_day(), m.last_day())
}

/// Modal month series for one card's spans. Ties go to the smallest ZIP3.
pub fn card_modes(spans: &[&AddressSpan], months: &[YearMonth]) -> Vec<ModalMonth> {
    let mut out = Vec::new();
    for &m in months {
        let mut days: BTreeMap<Zip3, i64> = BTreeMap::new();
        for s in spans {
            let n = overlap_days((s.valid_begin, s.valid_end), month_span(m));
            if n > 0 {
                *days.entry(s.zip3).or_default() += n;
            }
        }
        let covered: i64 = days.values().sum();
        let mut best: Option<(Zip3, i64)> = None;
        for (&zip3, &n) in &days {
            if best.is_none_or(|(_, b)| n > b) {
                best = Some((zip3, n));
            }
        }
        if let Some((zip3, n)) = best {
            out.push(ModalMonth {
                month: m,
                zip3,
                days: n,
                covered_days: covered,
            });
        }
    }
    out
}

/// Single-row cards: the one ZIP3 holds every month the span touches.
fn single_span_modes(span: &AddressSpan, months: &[YearMonth]) -> Vec<ModalMonth> {
    months
        .iter()
        .filter_map(|&m| {
            let n = overlap_days((span.valid_begin, span.valid_end), month_span(m));
            (n > 0).then_some(ModalMonth {
                month: m,
                zip3: span.zip3,
                days: n,
                covered_days: n,
            })
        })
        .collect()
}

fn group_by_card(spans: &[AddressSpan]) -> BTreeMap<&str, Vec<&AddressSpan>> {
    let mut by_card: BTreeMap<&str, Vec<&AddressSpan>> = BTreeMap::new();
    for s in spans {
        by_card.entry(s.cardid.as_str()).or_default().push(s);
    }
    by_card
}

/// Modal ZIP3 for every card-month with any address coverage.
pub fn modal_zip3(spans: &[AddressSpan], months: &[YearMonth]) -> Vec<CardMonthZip3> {
    let by_card = group_by_card(spans);
    let single = by_card.values().filter(|v| v.len() == 1).count();
    info!(
        cards = by_card.len(),
        single_row = single,
        multi_row = by_card.len() - single,
        "computing modal zip3"
    );

    let mut out = Vec::new();
    for (cardid, rows) in &by_card {
        let modes = match rows.as_slice() {
            [only] => single_span_modes(only, months),
            _ => card_modes(rows, months),
        };
        out.extend(modes.into_iter().map(|m| CardMonthZip3 {
            cardid: cardid.to_string(),
            month: m.month,
            zip3: m.zip3,
        }));
    }
    info!(card_months = out.len(), "modal zip3 done");
    out
}

/// A card whose address map has unusually many rows.
#[derive(Debug, Clone, Serialize)]
pub struct Bouncer {
    pub cardid: String,
    pub rows: usize,
    pub zip3s: Vec<Zip3>,
    pub months: Vec<ModalMonth>,
}

/// Cards with more than `min_rows` address rows, most rows first.
pub fn bouncer_report(
    spans: &[AddressSpan],
    months: &[YearMonth],
    min_rows: usize,
    top: usize,
) -> Vec<Bouncer> {
    let by_card = group_by_card(spans);
    let mut heavy: Vec<(&str, &Vec<&AddressSpan>)> = by_card
        .iter()
        .filter(|(_, rows)| rows.len() > min_rows)
        .map(|(c, rows)| (*c, rows))
        .collect();
    heavy.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(b.0)));

    heavy
        .into_iter()
        .take(top)
        .map(|(cardid, rows)| {
            let mut zip3s: Vec<Zip3> = rows.iter().map(|s| s.zip3).collect();
            zip3s.sort();
            zip3s.dedup();
            let months = card_modes(rows, months);
            debug!(cardid, rows = rows.len(), distinct = zip3s.len(), "bouncer");
            Bouncer {
                cardid: cardid.to_string(),
                rows: rows.len(),
                zip3s,
                months,
            }
        })
        .collect()
}

/// Rows with an unparseable ZIP or date are skipped.
pub fn load_address_spans(config: &AnalysisConfig) -> Result<Vec<AddressSpan>> {
    let path = config.data.path(&config.data.address_map);
    let df = read_table(&path, "time-varying address map extract")?;
    let t = Table::new("address_map", &df);
    let cardids = t.strings("cardid")?;
    let zips = t.strings("zip")?;
    let begins = t.dates("valid_begin")?;
    let ends = t.dates("valid_end")?;

    let mut spans = Vec::with_capacity(t.height());
    for i in 0..t.height() {
        let zip3 = zips[i].as_deref().and_then(Zip3::parse);
        if let (Some(cardid), Some(zip3), Some(valid_begin), Some(valid_end)) =
            (cardids[i].clone(), zip3, begins[i], ends[i])
        {
            spans.push(AddressSpan {
                cardid,
                zip3,
                valid_begin,
                valid_end,
            });
        }
    }
    info!(rows = t.height(), kept = spans.len(), "loaded address map");
    Ok(spans)
}

pub struct ModalZip3Run {
    pub assignments: Vec<CardMonthZip3>,
    pub bouncers: Vec<Bouncer>,
}

/// Compute the card-month table and write it where `load` expects it.
pub fn run_monthly_zip3(config: &AnalysisConfig) -> Result<ModalZip3Run> {
    let spans = load_address_spans(config)?;
    let cfg = &config.modal_zip3;
    let months = YearMonth::range_inclusive(cfg.first_month, cfg.last_month);
    let assignments = modal_zip3(&spans, &months);
    let bouncers = bouncer_report(&spans, &months, cfg.bouncer_rows, 5);

    let mut df = DataFrame::new(vec![
        Column::new(
            "cardid".into(),
            assignments.iter().map(|a| a.cardid.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "year_month".into(),
            assignments.iter().map(|a| a.month.to_string()).collect::<Vec<_>>(),
        ),
        Column::new(
            "zip3".into(),
            assignments.iter().map(|a| a.zip3.as_str()).collect::<Vec<_>>(),
        ),
    ])?;
    write_parquet(&mut df, &config.data.path(&config.data.monthly_zip3))?;
    Ok(ModalZip3Run {
        assignments,
        bouncers,
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn span(card: &str, zip: &str, b: NaiveDate, e: NaiveDate) -> AddressSpan {
        AddressSpan {
            cardid: card.into(),
            zip3: Zip3::parse(zip).unwrap(),
            valid_begin: b,
            valid_end: e,
        }
    }

    fn months() -> Vec<YearMonth> {
        YearMonth::range_inclusive(YearMonth::new(2023, 1).unwrap(), YearMonth::new(2023, 4).unwrap())
    }

    #[test]
    fn majority_of_days_wins() {
        let spans = vec![
            span("c", "606", d(2023, 1, 1), d(2023, 1, 20)),
            span("c", "600", d(2023, 1, 21), d(2023, 2, 28)),
        ];
        let out = modal_zip3(&spans, &months());
        let got: Vec<(String, &str)> = out.iter().map(|r| (r.month.to_string(), r.zip3.as_str())).collect();
        assert_eq!(got, [("2023-01".to_string(), "606"), ("2023-02".to_string(), "600")]);
    }

    #[test]
    fn days_accumulate_across_rows_and_ties_pick_smaller_zip() {
        // 600 holds 10 + 6 days of January, 606 holds 15.
        let spans = vec![
            span("c", "600", d(2023, 1, 1), d(2023, 1, 10)),
            span("c", "606", d(2023, 1, 11), d(2023, 1, 25)),
            span("c", "600", d(2023, 1, 26), d(2023, 1, 31)),
            // March splits 15/16 in favour of 606, April splits 15/15.
            span("c", "601", d(2023, 3, 1), d(2023, 3, 15)),
            span("c", "606", d(2023, 3, 16), d(2023, 4, 15)),
            span("c", "601", d(2023, 4, 16), d(2023, 4, 30)),
        ];
        let out = modal_zip3(&spans, &months());
        let by_month: BTreeMap<String, &str> =
            out.iter().map(|r| (r.month.to_string(), r.zip3.as_str())).collect();
        assert_eq!(by_month["2023-01"], "600");
        assert_eq!(by_month["2023-03"], "606");
        assert_eq!(by_month["2023-04"], "601", "15-15 tie resolves to the smaller zip3");
        assert!(!by_month.contains_key("2023-02"), "uncovered months are omitted");
    }

    #[test]
    fn single_row_fast_path_matches_general_path() {
        let s = span("c", "060", d(2023, 1, 15), d(2023, 3, 2));
        let fast = single_span_modes(&s, &months());
        let general = card_modes(&[&s], &months());
        assert_eq!(fast, general);
        assert_eq!(fast.len(), 3, "January is covered from the 15th");
    }

    #[test]
    fn bouncers_are_ranked_by_row_count() {
        let mut spans = Vec::new();
        for i in 0..6 {
            let zip = if i % 2 == 0 { "606" } else { "604" };
            spans.push(span("busy", zip, d(2023, 1, 1 + i * 5), d(2023, 1, 5 + i * 5)));
        }
        spans.push(span("calm", "606", d(2023, 1, 1), d(2023, 4, 30)));
        let report = bouncer_report(&spans, &months(), 3, 5);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].cardid, "busy");
        assert_eq!(report[0].zip3s.len(), 2);
        let jan = &report[0].months[0];
        assert_eq!(jan.covered_days, 30);
        assert!((jan.share() - 0.5).abs() < 1e-12);
        assert_eq!(jan.zip3.as_str(), "604", "15-15 tie resolves to the smaller zip3");
    }
}
