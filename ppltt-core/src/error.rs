use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Polars(#[from] polars::error::PolarsError),
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("input file not found: {path} ({hint})")]
    MissingInput { path: PathBuf, hint: String },
    #[error("column `{column}` missing from {table}")]
    MissingColumn { table: String, column: String },
    #[error("no rows left after {stage}")]
    EmptySample { stage: String },
    #[error("treated unit {zip3} has no observations {context}")]
    MissingTreatedUnit { zip3: String, context: String },
    #[error("need at least {needed} donors with complete pre-period data, found {found}")]
    InsufficientDonors { needed: usize, found: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("numerical failure: {0}")]
    Numerical(String),
}

impl AnalysisError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        AnalysisError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn empty(stage: impl Into<String>) -> Self {
        AnalysisError::EmptySample {
            stage: stage.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
