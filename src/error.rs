//! Error taxonomy for the pipeline.
//!
//! Every error is fatal to the stage that raised it; nothing is skipped at the
//! row level.

use std::path::PathBuf;

use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use parquet::errors::ParquetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("failed to read source '{pattern}': {reason}")]
    SourceRead { pattern: String, reason: String },

    #[error("source pattern '{pattern}' matched no files")]
    NoSourceFiles { pattern: String },

    #[error("source for {table} contained no rows")]
    EmptySource { table: String },

    #[error("column '{column}' is missing from {table}")]
    SchemaMismatch { table: String, column: String },

    #[error("cannot partition {table} by '{column}': column not in dataset")]
    MissingPartitionColumn { table: String, column: String },

    #[error("cannot partition {table} by '{column}': null partition value")]
    NullPartitionKey { table: String, column: String },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("execution engine error: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EtlError>;
