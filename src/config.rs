//! Pipeline configuration, loaded from an optional TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) describes
//! a run over `data/` writing into `output/`.

use std::fs;
use std::path::{Path, PathBuf};

use parquet::basic::{Compression, ZstdLevel};
use serde::{Deserialize, Serialize};

use crate::error::{EtlError, Result};
use crate::sink::SinkOptions;
use crate::source::SourcePattern;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub input: InputConfig,
    pub output: OutputConfig,
    pub engine: EngineConfig,
    pub pipeline: StageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    /// Directory both source patterns are resolved against.
    pub root: PathBuf,
    /// Pattern for song metadata documents, relative to `root`.
    pub song_data: String,
    /// Pattern for activity log files, relative to `root`.
    pub log_data: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            song_data: "song_data/*/*/*/*.json".to_string(),
            log_data: "log_data/*/*/*.json".to_string(),
        }
    }
}

impl InputConfig {
    pub fn song_source(&self) -> SourcePattern {
        SourcePattern::new(&self.root, &self.song_data)
    }

    pub fn log_source(&self) -> SourcePattern {
        SourcePattern::new(&self.root, &self.log_data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Directory the five output datasets are written under.
    pub root: PathBuf,
    pub compression: OutputCompression,
    /// Rows a table write may hold in memory before buffered partitions are
    /// flushed to new part files.
    pub max_buffered_rows: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("output"),
            compression: OutputCompression::Snappy,
            max_buffered_rows: 1_000_000,
        }
    }
}

impl OutputConfig {
    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            compression: self.compression.to_parquet(),
            max_buffered_rows: self.max_buffered_rows,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCompression {
    #[default]
    Snappy,
    Zstd,
    None,
}

impl OutputCompression {
    pub fn to_parquet(self) -> Compression {
        match self {
            OutputCompression::Snappy => Compression::SNAPPY,
            OutputCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            OutputCompression::None => Compression::UNCOMPRESSED,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of partitions the engine plans each operator with.
    pub target_partitions: usize,
    /// Rows per record batch flowing between operators.
    pub batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_partitions: 8,
            batch_size: 8192,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageConfig {
    pub empty_source: EmptySourcePolicy,
}

/// What to do when a source pattern matches files that hold no rows.
///
/// A pattern that matches no files at all is always an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptySourcePolicy {
    /// Log a warning and write empty outputs.
    #[default]
    Warn,
    /// Abort the stage with [`EtlError::EmptySource`].
    Error,
}

impl PipelineConfig {
    /// Load from `path`, or return the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path)?;
                toml::from_str::<PipelineConfig>(&text)?
            }
            None => PipelineConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.target_partitions == 0 {
            return Err(EtlError::Config(
                "engine.target_partitions must be at least 1".to_string(),
            ));
        }
        if self.output.max_buffered_rows == 0 {
            return Err(EtlError::Config(
                "output.max_buffered_rows must be at least 1".to_string(),
            ));
        }
        if self.engine.batch_size == 0 {
            return Err(EtlError::Config(
                "engine.batch_size must be at least 1".to_string(),
            ));
        }
        for (key, pattern) in [
            ("input.song_data", &self.input.song_data),
            ("input.log_data", &self.input.log_data),
        ] {
            if pattern.trim().is_empty() {
                return Err(EtlError::Config(format!("{key} must not be empty")));
            }
            if Path::new(pattern).is_absolute() {
                return Err(EtlError::Config(format!(
                    "{key} must be relative to input.root, got '{pattern}'"
                )));
            }
        }
        Ok(())
    }
}
