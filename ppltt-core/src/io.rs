//! Polars-backed file access and typed column extraction.
//!
//! Raw extracts arrive with loosely typed columns (ZIPs as integers or
//! strings, amounts as strings, dates as `Date`, `Datetime`, or text), so
//! extraction casts non-strictly and treats unparseable cells as missing.

use std::fs::File;
use std::path::Path;

use chrono::NaiveDate;
use polars::prelude::*;

use crate::calendar::parse_date;
use crate::error::{AnalysisError, Result};

fn require_file(path: &Path, hint: &str) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(AnalysisError::MissingInput {
            path: path.to_path_buf(),
            hint: hint.to_string(),
        })
    }
}

// === READING ===

/// Read a whole parquet or CSV table, chosen by extension.
pub fn read_table(path: &Path, hint: &str) -> Result<DataFrame> {
    require_file(path, hint)?;
    let is_csv = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    if is_csv {
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.to_path_buf()))?
            .finish()?;
        Ok(df)
    } else {
        let file = File::open(path).map_err(|e| AnalysisError::io(path, e))?;
        Ok(ParquetReader::new(file).finish()?)
    }
}

/// Lazily scan a parquet file, materialising only `columns`.
pub fn scan_columns(path: &Path, columns: &[&str], hint: &str) -> Result<DataFrame> {
    require_file(path, hint)?;
    let exprs: Vec<Expr> = columns.iter().map(|c| col(*c)).collect();
    let df = LazyFrame::scan_parquet(path, ScanArgsParquet::default())?
        .select(exprs)
        .collect()?;
    Ok(df)
}

/// Scan `columns` in slices of `batch_rows`, handing each slice to `f`.
/// Only one slice is materialised at a time. Returns the rows seen.
pub fn scan_batches<F>(path: &Path, columns: &[&str], batch_rows: usize, hint: &str, mut f: F) -> Result<usize>
where
    F: FnMut(&DataFrame) -> Result<()>,
{
    require_file(path, hint)?;
    let exprs: Vec<Expr> = columns.iter().map(|c| col(*c)).collect();
    let batch = batch_rows.clamp(1, IdxSize::MAX as usize);
    let mut offset = 0usize;
    loop {
        let df = LazyFrame::scan_parquet(path, ScanArgsParquet::default())?
            .select(exprs.clone())
            .slice(offset as i64, batch as IdxSize)
            .collect()?;
        let n = df.height();
        if n > 0 {
            f(&df)?;
        }
        offset += n;
        if n < batch {
            return Ok(offset);
        }
    }
}

// === COLUMN EXTRACTION ===

/// Names a table in `MissingColumn` errors.
#[derive(Debug, Clone, Copy)]
pub struct Table<'a> {
    pub name: &'a str,
    pub df: &'a DataFrame,
}

impl<'a> Table<'a> {
    pub fn new(name: &'a str, df: &'a DataFrame) -> Self {
        Self { name, df }
    }

    pub fn height(&self) -> usize {
        self.df.height()
    }

    pub fn has(&self, column: &str) -> bool {
        self.df.get_column_names().iter().any(|c| c.as_str() == column)
    }

    fn column(&self, column: &str) -> Result<&'a Column> {
        self.df
            .column(column)
            .map_err(|_| AnalysisError::MissingColumn {
                table: self.name.to_string(),
                column: column.to_string(),
            })
    }

    /// The column as text without copying each cell out.
    pub fn str_column(&self, column: &str) -> Result<StringChunked> {
        let c = self.column(column)?.cast(&DataType::String)?;
        Ok(c.str()?.clone())
    }

    pub fn strings(&self, column: &str) -> Result<Vec<Option<String>>> {
        let c = self.column(column)?.cast(&DataType::String)?;
        Ok(c.str()?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect())
    }

    /// Non-numeric cells and NaN become `None`.
    pub fn floats(&self, column: &str) -> Result<Vec<Option<f64>>> {
        let c = self.column(column)?.cast(&DataType::Float64)?;
        Ok(c.f64()?
            .into_iter()
            .map(|v| v.filter(|x| x.is_finite()))
            .collect())
    }

    pub fn ints(&self, column: &str) -> Result<Vec<Option<i64>>> {
        let c = self.column(column)?.cast(&DataType::Int64)?;
        Ok(c.i64()?.into_iter().collect())
    }

    /// Accepts `Date`, `Datetime`, and `YYYY-MM-DD...` text columns.
    pub fn dates(&self, column: &str) -> Result<Vec<Option<NaiveDate>>> {
        Ok(self
            .strings(column)?
            .into_iter()
            .map(|v| v.as_deref().and_then(parse_date))
            .collect())
    }
}

// === WRITING ===

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| AnalysisError::io(parent, e))?;
        }
    }
    Ok(())
}

pub fn write_csv(df: &mut DataFrame, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let mut file = File::create(path).map_err(|e| AnalysisError::io(path, e))?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    tracing::info!(path = %path.display(), rows = df.height(), "saved csv");
    Ok(())
}

pub fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let file = File::create(path).map_err(|e| AnalysisError::io(path, e))?;
    ParquetWriter::new(file).finish(df)?;
    tracing::info!(path = %path.display(), rows = df.height(), "saved parquet");
    Ok(())
}

pub fn write_text(text: &str, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    std::fs::write(path, text).map_err(|e| AnalysisError::io(path, e))?;
    tracing::info!(path = %path.display(), "saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_coerces_loose_types() {
        let df = DataFrame::new(vec![
            Column::new("zip".into(), &[606i64, 60]),
            Column::new("amount".into(), &["21.80", "n/a"]),
            Column::new("day".into(), &["2023-10-01", "2023-10-02 13:45:00"]),
        ])
        .unwrap();
        let t = Table::new("test", &df);

        assert_eq!(
            t.strings("zip").unwrap(),
            vec![Some("606".to_string()), Some("60".to_string())]
        );
        assert_eq!(t.floats("amount").unwrap(), vec![Some(21.8), None]);
        assert_eq!(
            t.dates("day").unwrap(),
            vec![
                NaiveDate::from_ymd_opt(2023, 10, 1),
                NaiveDate::from_ymd_opt(2023, 10, 2)
            ]
        );
        assert!(matches!(
            t.floats("missing"),
            Err(AnalysisError::MissingColumn { .. })
        ));
    }

    #[test]
    fn csv_and_parquet_round_trip_through_read_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut df = DataFrame::new(vec![
            Column::new("zip3".into(), &["606", "600"]),
            Column::new("population".into(), &[2_700_000.0, 1_100_000.0]),
        ])
        .unwrap();

        let csv = dir.path().join("nested/demo.csv");
        write_csv(&mut df, &csv).unwrap();
        let back = read_table(&csv, "demographics").unwrap();
        assert_eq!(back.height(), 2);

        let pq = dir.path().join("demo.parquet");
        write_parquet(&mut df, &pq).unwrap();
        let scanned = scan_columns(&pq, &["population"], "demographics").unwrap();
        assert_eq!(scanned.width(), 1);
        assert_eq!(
            Table::new("demo", &scanned).floats("population").unwrap(),
            vec![Some(2_700_000.0), Some(1_100_000.0)]
        );
    }

    #[test]
    fn batches_cover_every_row_once() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<String> = (0..7).map(|i| format!("c{i}")).collect();
        let mut df = DataFrame::new(vec![
            Column::new("cardid".into(), ids.clone()),
            Column::new("amount".into(), vec![1.0; 7]),
        ])
        .unwrap();
        let pq = dir.path().join("activity.parquet");
        write_parquet(&mut df, &pq).unwrap();

        let mut sizes = Vec::new();
        let mut seen = Vec::new();
        let rows = scan_batches(&pq, &["cardid"], 3, "activity", |batch| {
            assert_eq!(batch.width(), 1);
            sizes.push(batch.height());
            let s = Table::new("activity", batch).str_column("cardid")?;
            seen.extend((&s).into_iter().flatten().map(str::to_string));
            Ok(())
        })
        .unwrap();

        assert_eq!(rows, 7);
        assert_eq!(sizes, [3, 3, 1]);
        assert_eq!(seen, ids);
    }

    #[test]
    fn missing_file_is_reported_with_hint() {
        let err = read_table(Path::new("/nonexistent/panel.parquet"), "run panelize first")
            .unwrap_err();
        assert!(err.to_string().contains("run panelize first"));
    }
}
