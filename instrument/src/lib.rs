//! Recording of analysis result events into column-oriented tables.
//!
//! [`RecordLayer`] is a `tracing_subscriber` layer. Events whose target is in
//! its allow-list become rows of a [`DynamicTable`] named after the target;
//! columns are created from event fields as they first appear, so the schema
//! emerges from what the estimators emit. Everything else passes through to
//! the other layers (console logging) untouched.
//!
//! # Usage
//!
//! ```ignore
//! // In estimator code:
//! tracing::info!(target: "placebo", unit = %zip3, pre_rmspe, post_rmspe, ratio);
//!
//! // In the binary:
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(instrument::RecordLayer::new(["placebo", "leave_k_out"]))
//!     .init();
//! let mut run = instrument::RunRecorder::new("runs", "baseline");
//! // ... run analysis ...
//! let placebo = &run.get()["placebo"];
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// A column of typed, nullable values.
#[derive(Debug, Clone)]
pub enum TypedColumn {
    U64(Vec<Option<u64>>),
    I64(Vec<Option<i64>>),
    F64(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    Str(Vec<Option<String>>),
}

impl TypedColumn {
    pub fn len(&self) -> usize {
        match self {
            TypedColumn::U64(v) => v.len(),
            TypedColumn::I64(v) => v.len(),
            TypedColumn::F64(v) => v.len(),
            TypedColumn::Bool(v) => v.len(),
            TypedColumn::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Null-fill up to `len` rows.
    fn pad_to(&mut self, len: usize) {
        match self {
            TypedColumn::U64(v) => v.resize(len, None),
            TypedColumn::I64(v) => v.resize(len, None),
            TypedColumn::F64(v) => v.resize(len, None),
            TypedColumn::Bool(v) => v.resize(len, None),
            TypedColumn::Str(v) => v.resize(len, None),
        }
    }
}

/// A table whose columns keep the order in which fields first appeared.
#[derive(Debug, Clone, Default)]
pub struct DynamicTable {
    columns: Vec<(String, TypedColumn)>,
    index: HashMap<String, usize>,
    pub row_count: usize,
}

impl DynamicTable {
    pub fn column(&self, name: &str) -> Option<&TypedColumn> {
        self.index.get(name).map(|&i| &self.columns[i].1)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    /// Column for `name`, created null-filled for all earlier rows if new.
    fn column_or_insert(
        &mut self,
        name: &str,
        make: impl FnOnce(usize) -> TypedColumn,
    ) -> &mut TypedColumn {
        let i = match self.index.get(name) {
            Some(&i) => i,
            None => {
                self.columns.push((name.to_string(), make(self.row_count)));
                self.index.insert(name.to_string(), self.columns.len() - 1);
                self.columns.len() - 1
            }
        };
        &mut self.columns[i].1
    }

    /// Close the current row: every column is padded to `row_count`.
    fn seal_row(&mut self) {
        self.row_count += 1;
        for (_, col) in &mut self.columns {
            col.pad_to(self.row_count);
        }
    }
}

/// Collection of tables, keyed by tracing target.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    pub tables: BTreeMap<String, DynamicTable>,
}

thread_local! {
    static RECORDER: RefCell<Recorder> = RefCell::default();
}

/// Writes one event's fields into the row being built at `row`.
struct RowVisitor<'a> {
    table: &'a mut DynamicTable,
    row: usize,
}

impl RowVisitor<'_> {
    fn put_f64(&mut self, field: &Field, value: f64) {
        let row = self.row;
        // An integer column receiving a float leaves the cell null.
        if let TypedColumn::F64(v) = self
            .table
            .column_or_insert(field.name(), |n| TypedColumn::F64(vec![None; n]))
        {
            v.resize(row, None);
            v.push(Some(value));
        }
    }
}

impl Visit for RowVisitor<'_> {
    fn record_u64(&mut self, field: &Field, value: u64) {
        let row = self.row;
        match self
            .table
            .column_or_insert(field.name(), |n| TypedColumn::U64(vec![None; n]))
        {
            TypedColumn::U64(v) => {
                v.resize(row, None);
                v.push(Some(value));
            }
            TypedColumn::F64(v) => {
                v.resize(row, None);
                v.push(Some(value as f64));
            }
            _ => {}
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        let row = self.row;
        match self
            .table
            .column_or_insert(field.name(), |n| TypedColumn::I64(vec![None; n]))
        {
            TypedColumn::I64(v) => {
                v.resize(row, None);
                v.push(Some(value));
            }
            TypedColumn::F64(v) => {
                v.resize(row, None);
                v.push(Some(value as f64));
            }
            _ => {}
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put_f64(field, value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        let row = self.row;
        if let TypedColumn::Bool(v) = self
            .table
            .column_or_insert(field.name(), |n| TypedColumn::Bool(vec![None; n]))
        {
            v.resize(row, None);
            v.push(Some(value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        let row = self.row;
        if let TypedColumn::Str(v) = self
            .table
            .column_or_insert(field.name(), |n| TypedColumn::Str(vec![None; n]))
        {
            v.resize(row, None);
            v.push(Some(value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // `%value` and `?value` fields both land here.
        let rendered = format!("{value:?}");
        self.record_str(field, rendered.trim_matches('"'));
    }
}

/// Layer that turns allow-listed event targets into table rows.
#[derive(Debug, Clone)]
pub struct RecordLayer {
    targets: Vec<String>,
}

impl RecordLayer {
    pub fn new<I, T>(targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }

    pub fn records(&self, target: &str) -> bool {
        self.targets.iter().any(|t| t == target)
    }
}

impl<S: Subscriber> Layer<S> for RecordLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let target = event.metadata().target();
        if !self.records(target) {
            return;
        }

        RECORDER.with(|r| {
            let mut recorder = r.borrow_mut();
            let table = recorder.tables.entry(target.to_string()).or_default();
            let row = table.row_count;
            event.record(&mut RowVisitor { table: &mut *table, row });
            table.seal_row();
        });
    }
}

/// Drain all recorded data from the thread-local recorder.
pub fn drain() -> Recorder {
    RECORDER.with(|r| std::mem::take(&mut *r.borrow_mut()))
}

/// Clear all recorded data without returning it.
pub fn clear() {
    RECORDER.with(|r| *r.borrow_mut() = Recorder::default());
}

// === Polars Integration ===

use polars::prelude::*;

impl DynamicTable {
    /// Convert this table to a polars DataFrame, columns in first-seen order.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let columns: Vec<Column> = self
            .columns
            .iter()
            .map(|(name, col)| match col {
                TypedColumn::U64(v) => Column::new(name.as_str().into(), v),
                TypedColumn::I64(v) => Column::new(name.as_str().into(), v),
                TypedColumn::F64(v) => Column::new(name.as_str().into(), v),
                TypedColumn::Bool(v) => Column::new(name.as_str().into(), v),
                TypedColumn::Str(v) => Column::new(name.as_str().into(), v),
            })
            .collect();
        DataFrame::new(columns)
    }
}

impl Recorder {
    /// Convert all tables to polars DataFrames, skipping any that fail.
    pub fn to_dataframes(&self) -> HashMap<String, DataFrame> {
        self.tables
            .iter()
            .filter_map(|(name, table)| match table.to_dataframe() {
                Ok(df) => Some((name.clone(), df)),
                Err(e) => {
                    tracing::warn!(table = %name, error = %e, "dropping unconvertible table");
                    None
                }
            })
            .collect()
    }
}

/// Drain all recorded data and convert to polars DataFrames.
pub fn drain_to_dataframes() -> HashMap<String, DataFrame> {
    drain().to_dataframes()
}

fn io_err(e: std::io::Error) -> PolarsError {
    PolarsError::IO {
        error: e.into(),
        msg: None,
    }
}

/// Save each DataFrame as `{dir}/{name}.parquet`.
pub fn save_parquet(dfs: &mut HashMap<String, DataFrame>, dir: &Path) -> PolarsResult<()> {
    std::fs::create_dir_all(dir).map_err(io_err)?;
    for (name, df) in dfs.iter_mut() {
        let file = std::fs::File::create(dir.join(format!("{name}.parquet"))).map_err(io_err)?;
        ParquetWriter::new(file).finish(df)?;
    }
    Ok(())
}

/// Replace non-alphanumeric chars with `_` and truncate for use in directory names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(60)
        .collect()
}

/// Drop guard owning one analysis run's record directory.
///
/// Creating it clears anything recorded earlier on this thread. On drop, the
/// recorded tables are written to `{parent}/{Mon DD_HH_MM}_{name}/` as parquet
/// followed by an empty `_ready` sentinel.
pub struct RunRecorder {
    run_dir: PathBuf,
    run_name: String,
    dfs: Option<HashMap<String, DataFrame>>,
}

impl RunRecorder {
    pub fn new(parent: impl Into<PathBuf>, name: &str) -> Self {
        let stamp = chrono::Local::now().format("%b%d_%H_%M");
        let run_name = format!("{stamp}_{}", sanitize(name));
        let run_dir = parent.into().join(&run_name);
        clear();
        Self {
            run_dir,
            run_name,
            dfs: None,
        }
    }

    /// Drain once and return the tables; later calls return the cached data.
    pub fn get(&mut self) -> &HashMap<String, DataFrame> {
        self.dfs.get_or_insert_with(drain_to_dataframes)
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

impl Drop for RunRecorder {
    fn drop(&mut self) {
        let mut dfs = self.dfs.take().unwrap_or_else(drain_to_dataframes);
        if dfs.is_empty() {
            return;
        }
        if let Err(e) = save_parquet(&mut dfs, &self.run_dir) {
            tracing::warn!(run = %self.run_name, error = %e, "failed to write recorded tables");
            return;
        }
        match std::fs::File::create(self.run_dir.join("_ready")) {
            Ok(_) => tracing::info!(
                tables = dfs.len(),
                dir = %self.run_dir.display(),
                "recorded tables written"
            ),
            Err(e) => tracing::warn!(run = %self.run_name, error = %e, "failed to write _ready sentinel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn recording<F: FnOnce()>(targets: &[&str], f: F) -> Recorder {
        clear();
        let subscriber =
            tracing_subscriber::registry().with(RecordLayer::new(targets.iter().copied()));
        tracing::subscriber::with_default(subscriber, f);
        drain()
    }

    #[test]
    fn test_late_column_is_null_filled() {
        let mut table = DynamicTable::default();

        if let TypedColumn::F64(v) =
            table.column_or_insert("pre_rmspe", |n| TypedColumn::F64(vec![None; n]))
        {
            v.push(Some(0.05));
        }
        table.seal_row();

        // Second row introduces a new column and skips the first one.
        if let TypedColumn::Str(v) =
            table.column_or_insert("unit", |n| TypedColumn::Str(vec![None; n]))
        {
            v.push(Some("600".to_string()));
        }
        table.seal_row();

        assert_eq!(table.row_count, 2);
        match table.column("pre_rmspe") {
            Some(TypedColumn::F64(v)) => assert_eq!(v, &vec![Some(0.05), None]),
            other => panic!("expected F64 column, got {other:?}"),
        }
        match table.column("unit") {
            Some(TypedColumn::Str(v)) => assert_eq!(v, &vec![None, Some("600".to_string())]),
            other => panic!("expected Str column, got {other:?}"),
        }
    }

    #[test]
    fn test_layer_records_only_listed_targets() {
        let recorder = recording(&["placebo"], || {
            tracing::info!(target: "placebo", unit = "601", ratio = 1.5f64, rank = 2u64);
            tracing::info!(target: "placebo", unit = "602", ratio = 0.8f64);
            tracing::info!(target: "progress", step = 1u64, "not a table row");
        });

        assert!(!recorder.tables.contains_key("progress"));
        let table = &recorder.tables["placebo"];
        assert_eq!(table.row_count, 2);
        assert_eq!(
            table.column_names().collect::<Vec<_>>(),
            vec!["unit", "ratio", "rank"]
        );
        match table.column("rank") {
            Some(TypedColumn::U64(v)) => assert_eq!(v, &vec![Some(2), None]),
            other => panic!("expected U64 column, got {other:?}"),
        }
    }

    #[test]
    fn test_display_fields_are_strings() {
        let zip = String::from("606");
        let recorder = recording(&["weights"], || {
            tracing::info!(target: "weights", donor = %zip, weight = 0.25f64);
        });

        match recorder.tables["weights"].column("donor") {
            Some(TypedColumn::Str(v)) => assert_eq!(v, &vec![Some("606".to_string())]),
            other => panic!("expected Str column, got {other:?}"),
        }
    }

    #[test]
    fn test_integer_into_float_column() {
        let recorder = recording(&["gaps"], || {
            tracing::info!(target: "gaps", gap = 0.5f64);
            tracing::info!(target: "gaps", gap = 2i64);
        });
        match recorder.tables["gaps"].column("gap") {
            Some(TypedColumn::F64(v)) => assert_eq!(v, &vec![Some(0.5), Some(2.0)]),
            other => panic!("expected F64 column, got {other:?}"),
        }
    }

    #[test]
    fn test_dataframe_and_parquet_output() {
        let recorder = recording(&["leave_k_out"], || {
            tracing::info!(target: "leave_k_out", k = 1u64, removed = "601", post_gap = -0.1f64);
            tracing::info!(target: "leave_k_out", k = 2u64, removed = "601,602", post_gap = -0.2f64);
        });

        let mut dfs = recorder.to_dataframes();
        let df = &dfs["leave_k_out"];
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 3);

        let dir = tempfile::tempdir().unwrap();
        save_parquet(&mut dfs, dir.path()).unwrap();
        assert!(dir.path().join("leave_k_out.parquet").exists());
    }

    #[test]
    fn test_sanitize_run_names() {
        assert_eq!(sanitize("trans/15to25 all"), "trans_15to25_all");
        assert_eq!(sanitize(&"x".repeat(80)).len(), 60);
    }
}
