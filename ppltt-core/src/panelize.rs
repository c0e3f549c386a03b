//! Constant-individual panel.
//!
//! A cardlinkid stays in the panel only if at least one of its cards has
//! activity in every window of the study period.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use chrono::{Days, NaiveDate};
use polars::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crate::calendar::parse_date;
use crate::io::{Table, scan_batches, write_parquet};
use crate::load::load_card_info;
use crate::types::CardRecord;

/// Both ends inclusive. Consecutive windows share their boundary day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Window {
    pub fn contains(&self, d: NaiveDate) -> bool {
        d >= self.start && d <= self.end
    }
}

/// Consecutive `days`-long windows from `start` to `end`. The last window
/// stretches to `end`, absorbing any remainder shorter than `days`.
pub fn generate_windows(start: NaiveDate, end: NaiveDate, days: i64) -> Vec<Window> {
    let mut windows = Vec::new();
    let Ok(step) = u64::try_from(days) else {
        return windows;
    };
    if step == 0 {
        return windows;
    }
    let mut current = start;
    while current < end {
        let Some(window_end) = current.checked_add_days(Days::new(step)) else {
            windows.push(Window { start: current, end });
            break;
        };
        if window_end >= end || (end - window_end).num_days() < days {
            windows.push(Window { start: current, end });
            break;
        }
        windows.push(Window {
            start: current,
            end: window_end,
        });
        current = window_end;
    }
    windows
}

/// Rows read per slice of an activity file.
pub const ACTIVITY_BATCH_ROWS: usize = 1_000_000;

/// Active linkids for every window, filled in a single pass over activity
/// rows. Rows are not kept; each one only marks its linkid in the windows
/// containing its date.
#[derive(Debug)]
pub struct WindowActivity<'a> {
    windows: Vec<Window>,
    card_to_link: &'a HashMap<String, String>,
    active: Vec<HashSet<&'a str>>,
    rows: usize,
}

impl<'a> WindowActivity<'a> {
    /// `windows` must be ordered, as `generate_windows` returns them.
    pub fn new(windows: &[Window], card_to_link: &'a HashMap<String, String>) -> Self {
        Self {
            windows: windows.to_vec(),
            card_to_link,
            active: vec![HashSet::new(); windows.len()],
            rows: 0,
        }
    }

    /// Unknown cards are ignored. A boundary day marks both neighbouring windows.
    pub fn observe(&mut self, cardid: &str, date: NaiveDate) {
        let links: &'a HashMap<String, String> = self.card_to_link;
        let Some(link) = links.get(cardid) else {
            return;
        };
        self.rows += 1;
        let first = self.windows.partition_point(|w| w.end < date);
        for (w, set) in self.windows[first..].iter().zip(&mut self.active[first..]) {
            if w.start > date {
                break;
            }
            set.insert(link.as_str());
        }
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn active(&self, window: usize) -> Option<&HashSet<&'a str>> {
        self.active.get(window)
    }

    /// Rows from known cards seen so far.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// Stream `cardid` and `trans_date` from one activity file into `activity`.
pub fn stream_activity(path: &Path, activity: &mut WindowActivity<'_>, batch_rows: usize) -> Result<usize> {
    let before = activity.rows();
    let total = scan_batches(path, &["cardid", "trans_date"], batch_rows, "activity extract", |batch| {
        let t = Table::new("activity", batch);
        let cardids = t.str_column("cardid")?;
        let dates = t.str_column("trans_date")?;
        for (cardid, date) in (&cardids).into_iter().zip(&dates) {
            if let (Some(cardid), Some(date)) = (cardid, date.and_then(parse_date)) {
                activity.observe(cardid, date);
            }
        }
        Ok(())
    })?;
    info!(path = %path.display(), rows = total, known = activity.rows() - before, "streamed activity");
    Ok(total)
}

/// Cardlinkids with at least one activity inside `window`.
pub fn active_linkids<'a, 'r>(
    activity: impl IntoIterator<Item = (&'r str, NaiveDate)>,
    card_to_link: &'a HashMap<String, String>,
    window: Window,
) -> HashSet<&'a str> {
    let mut acc = WindowActivity::new(&[window], card_to_link);
    for (cardid, date) in activity {
        acc.observe(cardid, date);
    }
    acc.active.pop().unwrap_or_default()
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowCount {
    pub window: Window,
    pub active: usize,
    pub panel: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct PanelResult {
    pub members: BTreeSet<String>,
    pub windows: Vec<WindowCount>,
}

/// Intersect every linkid in `card_to_link` with each window's active set.
pub fn panelize(card_to_link: &HashMap<String, String>, activity: &WindowActivity<'_>) -> PanelResult {
    let mut members: BTreeSet<String> = card_to_link.values().cloned().collect();
    let windows = activity.windows();
    info!(linkids = members.len(), windows = windows.len(), "panelizing");
    let mut counts = Vec::with_capacity(windows.len());

    for (i, (&window, active)) in windows.iter().zip(&activity.active).enumerate() {
        let before = members.len();
        members.retain(|m| active.contains(m.as_str()));
        let count = WindowCount {
            window,
            active: active.len(),
            panel: members.len(),
            dropped: before - members.len(),
        };
        info!(
            window = i + 1,
            start = %window.start,
            end = %window.end,
            active = count.active,
            panel = count.panel,
            "window processed"
        );

        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "panel_window",
            window = (i + 1) as u64,
            start = %window.start,
            end = %window.end,
            active = count.active as u64,
            panel = count.panel as u64,
            dropped = count.dropped as u64,
        );

        counts.push(count);
    }

    PanelResult {
        members,
        windows: counts,
    }
}

/// Cards eligible for panel construction, keyed by cardid.
pub fn card_to_link(cards: &[CardRecord]) -> HashMap<String, String> {
    cards
        .iter()
        .filter(|c| !c.is_usa1_debit())
        .map(|c| (c.cardid.clone(), c.cardlinkid.clone()))
        .collect()
}

/// Cardids whose linkid is a panel member. USA1 debit cards never qualify.
pub fn panel_cardids(members: &HashSet<String>, cards: &[CardRecord]) -> HashSet<String> {
    cards
        .iter()
        .filter(|c| !c.is_usa1_debit() && members.contains(&c.cardlinkid))
        .map(|c| c.cardid.clone())
        .collect()
}

/// Build the panel from the configured extracts and write it to the panel file.
pub fn run_panelize(config: &AnalysisConfig) -> Result<PanelResult> {
    let cards = load_card_info(config)?;
    let links = card_to_link(&cards);
    info!(total = cards.len(), eligible = links.len(), "excluded USA1 debit cards");

    let p = &config.panelize;
    let windows = generate_windows(p.start, p.end, p.window_days);
    if windows.is_empty() {
        return Err(AnalysisError::InvalidConfig("panelize produced no windows".into()));
    }

    let mut activity = WindowActivity::new(&windows, &links);
    for name in &config.data.activity {
        stream_activity(&config.data.path(name), &mut activity, ACTIVITY_BATCH_ROWS)?;
    }

    let result = panelize(&links, &activity);
    let linkids: Vec<String> = result.members.iter().cloned().collect();
    let mut df = DataFrame::new(vec![Column::new("cardlinkid".into(), linkids)])?;
    write_parquet(&mut df, &config.data.path(&config.data.panel))?;
    info!(members = result.members.len(), "panel saved");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn default_study_period_has_nine_windows() {
        let w = generate_windows(d(2023, 3, 1), d(2024, 11, 30), 70);
        assert_eq!(w.len(), 9);
        assert_eq!(w[0], Window { start: d(2023, 3, 1), end: d(2023, 5, 10) });
        assert_eq!(w[1].start, w[0].end, "windows share boundary days");
        assert_eq!(w.last().unwrap().end, d(2024, 11, 30));
        let last_len = (w[8].end - w[8].start).num_days();
        assert!(last_len >= 70, "short tail must be absorbed, got {last_len}");
    }

    #[test]
    fn short_period_is_one_window() {
        let w = generate_windows(d(2023, 1, 1), d(2023, 1, 20), 70);
        assert_eq!(w, vec![Window { start: d(2023, 1, 1), end: d(2023, 1, 20) }]);
        assert!(generate_windows(d(2023, 1, 1), d(2023, 1, 1), 70).is_empty());
    }

    fn card(id: &str, link: &str, group: i64, kind: &str) -> CardRecord {
        CardRecord {
            cardid: id.into(),
            cardlinkid: link.into(),
            source_group: Some(group),
            cardtype: Some(kind.into()),
            zip3: None,
        }
    }

    #[test]
    fn members_need_activity_in_every_window() {
        let cards = vec![
            card("a1", "A", 2, "CREDIT"),
            card("a2", "A", 2, "CREDIT"),
            card("b1", "B", 2, "CREDIT"),
            card("c1", "C", 1, "DEBIT"),
        ];
        let links = card_to_link(&cards);
        assert_eq!(links.len(), 3, "USA1 debit card excluded");

        let windows = generate_windows(d(2023, 1, 1), d(2023, 1, 21), 10);
        assert_eq!(windows.len(), 2);
        let mut activity = WindowActivity::new(&windows, &links);
        // A is active in both windows through different cards; B only in the first.
        for (id, day) in [("a1", 3), ("a2", 15), ("b1", 5), ("c1", 15)] {
            activity.observe(id, d(2023, 1, day));
        }
        assert_eq!(activity.rows(), 3);

        let result = panelize(&links, &activity);
        assert_eq!(result.members.iter().collect::<Vec<_>>(), ["A"]);
        assert_eq!(result.windows[0].panel, 2);
        assert_eq!(result.windows[1].dropped, 1);

        let members: HashSet<String> = result.members.into_iter().collect();
        let ids = panel_cardids(&members, &cards);
        assert_eq!(ids, ["a1".to_string(), "a2".to_string()].into());
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let links: HashMap<String, String> = [("x".to_string(), "X".to_string())].into();
        let w = Window { start: d(2023, 1, 1), end: d(2023, 1, 10) };
        assert_eq!(active_linkids([("x", d(2023, 1, 10))], &links, w).len(), 1);
        assert!(active_linkids([("x", d(2023, 1, 11))], &links, w).is_empty());
    }

    #[test]
    fn one_pass_over_a_file_fills_every_window() {
        let dir = tempfile::tempdir().unwrap();
        let windows = generate_windows(d(2023, 1, 1), d(2023, 1, 31), 10);
        assert_eq!(windows.len(), 3);
        let links: HashMap<String, String> =
            [("p", "P"), ("q", "Q"), ("r", "R")].map(|(c, l)| (c.to_string(), l.to_string())).into();

        // Day 11 is the boundary of the first two windows; "z" is unknown.
        let rows = [
            ("p", "2023-01-02"),
            ("q", "2023-01-11"),
            ("p", "2023-01-25"),
            ("r", "2023-01-30"),
            ("z", "2023-01-05"),
        ];
        let mut df = DataFrame::new(vec![
            Column::new("cardid".into(), rows.iter().map(|r| r.0).collect::<Vec<_>>()),
            Column::new("trans_date".into(), rows.iter().map(|r| r.1).collect::<Vec<_>>()),
            Column::new("amount".into(), vec![20.0; rows.len()]),
        ])
        .unwrap();
        let path = dir.path().join("activity.parquet");
        write_parquet(&mut df, &path).unwrap();

        let mut activity = WindowActivity::new(&windows, &links);
        let read = stream_activity(&path, &mut activity, 2).unwrap();
        assert_eq!(read, rows.len());
        assert_eq!(activity.rows(), 4);

        let set = |i: usize| {
            let mut v: Vec<&str> = activity.active(i).unwrap().iter().copied().collect();
            v.sort();
            v
        };
        assert_eq!(set(0), ["P", "Q"]);
        assert_eq!(set(1), ["Q"]);
        assert_eq!(set(2), ["P", "R"]);
        assert!(activity.active(3).is_none());
    }
}
