//! Loading and filtering the raw card-transaction extracts.
//!
//! Filters run in a fixed order: service, panel, top merchants, amount.
//! Top merchants are ranked on the sample that survives the panel filter,
//! before any amount restriction.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::calendar::YearMonth;
use crate::config::{AnalysisConfig, SampleConfig, Zip3Source};
use crate::error::{AnalysisError, Result};
use crate::io::{Table, read_table, scan_columns};
use crate::panelize::panel_cardids;
use crate::types::{CardRecord, Transaction, Zip3};

const TRANSACTION_COLUMNS: [&str; 5] = ["cardid", "trans_date", "trans_amount", "merchid", "service"];

// ============================================================================
// Card table
// ============================================================================

/// Every row of the card table. `source_group` and `cardtype` are optional columns.
pub fn load_card_info(config: &AnalysisConfig) -> Result<Vec<CardRecord>> {
    let path = config.data.path(&config.data.card_info);
    let df = read_table(&path, "card table extract")?;
    let t = Table::new("card_info", &df);

    let cardids = t.strings("cardid")?;
    let linkids = t.strings("cardlinkid")?;
    let zips = t.strings("zip")?;
    let groups = if t.has("source_group") {
        t.ints("source_group")?
    } else {
        vec![None; t.height()]
    };
    let types = if t.has("cardtype") {
        t.strings("cardtype")?
    } else {
        vec![None; t.height()]
    };

    let mut cards = Vec::with_capacity(t.height());
    for i in 0..t.height() {
        let (Some(cardid), Some(cardlinkid)) = (cardids[i].clone(), linkids[i].clone()) else {
            continue;
        };
        cards.push(CardRecord {
            cardid,
            cardlinkid,
            source_group: groups[i],
            cardtype: types[i].clone(),
            zip3: zips[i].as_deref().and_then(Zip3::parse),
        });
    }
    info!(cards = cards.len(), "loaded card info");
    Ok(cards)
}

/// Cardlinkids written by `panelize`.
pub fn load_panel_linkids(config: &AnalysisConfig) -> Result<HashSet<String>> {
    let path = config.data.path(&config.data.panel);
    let df = read_table(&path, "run `ppltt panelize` first")?;
    let linkids: HashSet<String> = Table::new("panel", &df)
        .strings("cardlinkid")?
        .into_iter()
        .flatten()
        .collect();
    info!(linkids = linkids.len(), "loaded panel cardlinkids");
    Ok(linkids)
}

// ============================================================================
// Transactions
// ============================================================================

fn read_transaction_file(path: &std::path::Path) -> Result<Vec<Transaction>> {
    let df = scan_columns(path, &TRANSACTION_COLUMNS, "transaction extract")?;
    let t = Table::new("transactions", &df);
    let cardids = t.strings("cardid")?;
    let dates = t.dates("trans_date")?;
    let amounts = t.floats("trans_amount")?;
    let merchids = t.strings("merchid")?;
    let services = t.strings("service")?;

    let mut out = Vec::with_capacity(t.height());
    let mut undated = 0usize;
    for i in 0..t.height() {
        let (Some(cardid), Some(date)) = (cardids[i].clone(), dates[i]) else {
            undated += 1;
            continue;
        };
        out.push(Transaction {
            cardid,
            date,
            amount: amounts[i],
            merchid: merchids[i].clone().unwrap_or_default(),
            service: services[i].clone().unwrap_or_default(),
            zip3: None,
        });
    }
    if undated > 0 {
        warn!(path = %path.display(), rows = undated, "dropped rows without cardid or date");
    }
    Ok(out)
}

/// Merchants with the most transactions; ties go to the smaller merchid.
pub fn top_merchants(transactions: &[Transaction], n: usize) -> HashSet<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in transactions {
        *counts.entry(t.merchid.as_str()).or_default() += 1;
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    ranked.into_iter().take(n).map(|(m, _)| m.to_string()).collect()
}

/// Apply service, panel, top-merchant, and amount filters in that order.
pub fn filter_transactions(
    mut trans: Vec<Transaction>,
    sample: &SampleConfig,
    panel: Option<&HashSet<String>>,
) -> Vec<Transaction> {
    let services: HashSet<String> = sample.services.iter().map(|s| s.to_lowercase()).collect();
    trans.retain(|t| services.contains(&t.service.to_lowercase()));
    info!(rows = trans.len(), "after service filter");

    if let Some(cardids) = panel {
        let before = trans.len();
        trans.retain(|t| cardids.contains(&t.cardid));
        let pct = if before > 0 {
            100.0 * trans.len() as f64 / before as f64
        } else {
            0.0
        };
        info!(rows = trans.len(), before, pct_kept = %format!("{pct:.1}"), "after panel filter");
    }

    if sample.use_top_merchants {
        let top = top_merchants(&trans, sample.top_merchants);
        trans.retain(|t| top.contains(&t.merchid));
        info!(rows = trans.len(), n = sample.top_merchants, "after top merchants filter");
    }

    let filter = sample.amount_filter;
    trans.retain(|t| filter.admits(t.amount));
    info!(rows = trans.len(), filter = filter.label(), "after amount filter");
    trans
}

/// Concatenate the configured years' extracts (missing years are skipped) and filter.
pub fn load_transactions(
    config: &AnalysisConfig,
    panel: Option<&HashSet<String>>,
) -> Result<Vec<Transaction>> {
    let mut trans = Vec::new();
    let mut found = 0;
    for &year in &config.sample.years {
        let path = config.data.transactions_path(year);
        if !path.exists() {
            warn!(year, path = %path.display(), "transaction file missing, skipping");
            continue;
        }
        found += 1;
        trans.extend(read_transaction_file(&path)?);
    }
    if found == 0 {
        return Err(AnalysisError::MissingInput {
            path: config.data.path(&config.data.transactions),
            hint: "no transaction extract exists for any configured year".into(),
        });
    }
    info!(rows = trans.len(), files = found, "loaded transactions");
    Ok(filter_transactions(trans, &config.sample, panel))
}

// ============================================================================
// ZIP3 assignment
// ============================================================================

/// How a transaction's ZIP3 is resolved.
#[derive(Debug, Clone)]
pub enum Zip3Lookup {
    Static(HashMap<String, Zip3>),
    Monthly(HashMap<(String, YearMonth), Zip3>),
}

impl Zip3Lookup {
    pub fn from_cards(cards: &[CardRecord]) -> Self {
        Zip3Lookup::Static(
            cards
                .iter()
                .filter_map(|c| c.zip3.map(|z| (c.cardid.clone(), z)))
                .collect(),
        )
    }

    pub fn get(&self, cardid: &str, date: NaiveDate) -> Option<Zip3> {
        match self {
            Zip3Lookup::Static(map) => map.get(cardid).copied(),
            Zip3Lookup::Monthly(map) => map
                .get(&(cardid.to_string(), YearMonth::from_date(date)))
                .copied(),
        }
    }
}

/// Read the card-month table written by `monthly-zip3`.
pub fn load_monthly_zip3(config: &AnalysisConfig) -> Result<Zip3Lookup> {
    let path = config.data.path(&config.data.monthly_zip3);
    let df = read_table(&path, "run `ppltt monthly-zip3` first")?;
    let t = Table::new("monthly_zip3", &df);
    let cardids = t.strings("cardid")?;
    let months = t.strings("year_month")?;
    let zips = t.strings("zip3")?;

    let mut map = HashMap::with_capacity(t.height());
    for ((cardid, month), zip) in cardids.into_iter().zip(months).zip(zips) {
        let (Some(cardid), Some(month), Some(zip)) = (cardid, month, zip) else {
            continue;
        };
        let (Ok(month), Some(zip)) = (month.parse::<YearMonth>(), Zip3::parse(&zip)) else {
            continue;
        };
        map.insert((cardid, month), zip);
    }
    info!(card_months = map.len(), "loaded monthly zip3");
    Ok(Zip3Lookup::Monthly(map))
}

/// Fill in `zip3` on every transaction; returns how many matched.
pub fn attach_zip3(transactions: &mut [Transaction], lookup: &Zip3Lookup) -> usize {
    let mut matched = 0;
    for t in transactions.iter_mut() {
        t.zip3 = lookup.get(&t.cardid, t.date);
        matched += usize::from(t.zip3.is_some());
    }
    info!(rows = transactions.len(), matched, "attached zip3");
    matched
}

/// Filtered transactions with ZIP3 attached from the configured source.
pub fn load_with_zip3(config: &AnalysisConfig) -> Result<Vec<Transaction>> {
    let cards = load_card_info(config)?;
    let panel = if config.sample.use_panel {
        let linkids = load_panel_linkids(config)?;
        let cardids = panel_cardids(&linkids, &cards);
        info!(cardids = cardids.len(), "panel cardids");
        Some(cardids)
    } else {
        None
    };

    let mut trans = load_transactions(config, panel.as_ref())?;
    let lookup = match config.sample.zip3_source {
        Zip3Source::Static => Zip3Lookup::from_cards(&cards),
        Zip3Source::Monthly => load_monthly_zip3(config)?,
    };
    attach_zip3(&mut trans, &lookup);
    Ok(trans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmountFilter;

    fn tx(cardid: &str, merch: &str, service: &str, amount: Option<f64>) -> Transaction {
        Transaction {
            cardid: cardid.into(),
            date: NaiveDate::from_ymd_opt(2023, 5, 2).unwrap(),
            amount,
            merchid: merch.into(),
            service: service.into(),
            zip3: None,
        }
    }

    #[test]
    fn service_match_is_case_insensitive() {
        let sample = SampleConfig {
            amount_filter: AmountFilter::All,
            ..SampleConfig::default()
        };
        let out = filter_transactions(
            vec![
                tx("a", "m1", "ChatGPT", Some(20.0)),
                tx("b", "m1", "OPENAI", Some(20.0)),
                tx("c", "m1", "claude", Some(20.0)),
            ],
            &sample,
            None,
        );
        let ids: Vec<&str> = out.iter().map(|t| t.cardid.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn top_merchants_ranked_before_amount_filter() {
        // m2 has the most rows overall but none in the $15-25 range.
        let mut trans = vec![
            tx("a", "m1", "chatgpt", Some(20.0)),
            tx("b", "m1", "chatgpt", Some(21.0)),
        ];
        for id in ["c", "d", "e"] {
            trans.push(tx(id, "m2", "chatgpt", Some(200.0)));
        }
        trans.push(tx("f", "m3", "chatgpt", Some(20.0)));

        let sample = SampleConfig {
            use_top_merchants: true,
            top_merchants: 2,
            amount_filter: AmountFilter::WideRange,
            ..SampleConfig::default()
        };
        let out = filter_transactions(trans, &sample, None);
        let ids: Vec<&str> = out.iter().map(|t| t.cardid.as_str()).collect();
        assert_eq!(ids, ["a", "b"], "m3 is outside the top two once m2 counts");
    }

    #[test]
    fn panel_filter_drops_other_cards() {
        let panel: HashSet<String> = ["a".to_string()].into();
        let out = filter_transactions(
            vec![tx("a", "m", "chatgpt", Some(20.0)), tx("b", "m", "chatgpt", Some(20.0))],
            &SampleConfig::default(),
            Some(&panel),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cardid, "a");
    }

    #[test]
    fn top_merchant_ties_prefer_smaller_id() {
        let trans = vec![tx("a", "mB", "chatgpt", None), tx("b", "mA", "chatgpt", None)];
        let top = top_merchants(&trans, 1);
        assert!(top.contains("mA"));
    }

    #[test]
    fn monthly_lookup_uses_transaction_month() {
        let mut map = HashMap::new();
        map.insert(("a".to_string(), YearMonth::new(2023, 5).unwrap()), Zip3::CHICAGO);
        let lookup = Zip3Lookup::Monthly(map);

        let mut trans = vec![tx("a", "m", "chatgpt", None), tx("b", "m", "chatgpt", None)];
        trans.push(Transaction {
            date: NaiveDate::from_ymd_opt(2023, 6, 1).unwrap(),
            ..tx("a", "m", "chatgpt", None)
        });
        let matched = attach_zip3(&mut trans, &lookup);
        assert_eq!(matched, 1);
        assert_eq!(trans[0].zip3, Some(Zip3::CHICAGO));
        assert_eq!(trans[2].zip3, None, "June has no modal zip for card a");
    }
}
