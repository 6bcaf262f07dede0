//! Runs the song catalog and activity stages in sequence.

use std::fs;
use std::time::Instant;

use clap::ValueEnum;
use datafusion::dataframe::DataFrame;
use indicatif::{HumanCount, HumanDuration};
use serde::Serialize;
use tracing::{info, warn};

use crate::activity::process_log_data;
use crate::config::{EmptySourcePolicy, PipelineConfig};
use crate::engine::Engine;
use crate::error::{EtlError, Result};
use crate::sink::WriteSummary;
use crate::songs::process_song_data;
use crate::source::SourcePattern;

pub const RUN_SUMMARY_FILE: &str = "_run_summary.json";

/// Which stages to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Song catalog, then activity.
    #[default]
    All,
    /// Song catalog only: `songs`, `artists_table`.
    Songs,
    /// Activity only: `users_table`, `time_table`, `songplays`.
    Logs,
}

impl Stage {
    fn runs_songs(self) -> bool {
        matches!(self, Stage::All | Stage::Songs)
    }

    fn runs_logs(self) -> bool {
        matches!(self, Stage::All | Stage::Logs)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stage: Stage,
    pub tables: Vec<WriteSummary>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.rows).sum()
    }
}

/// Scan a freshly read source and apply `policy` when it holds no rows.
///
/// The scan decodes every record, so malformed or incomplete records fail
/// here, attributed to `source`, before any output is replaced.
pub(crate) async fn ensure_rows(
    engine: &Engine,
    df: &DataFrame,
    source: &SourcePattern,
    table: &str,
    policy: EmptySourcePolicy,
) -> Result<usize> {
    let rows = engine.scan_source(df, source, table).await?;
    if rows == 0 {
        match policy {
            EmptySourcePolicy::Warn => warn!("  {table}: source matched files but holds no rows"),
            EmptySourcePolicy::Error => {
                return Err(EtlError::EmptySource {
                    table: table.to_string(),
                });
            }
        }
    } else {
        info!("  {}: {} rows", table, HumanCount(rows as u64));
    }
    Ok(rows)
}

/// Run `stage` and record the outcome in `<output.root>/_run_summary.json`.
///
/// The first failure aborts the run; tables written before it stay on disk.
pub async fn run(engine: &Engine, config: &PipelineConfig, stage: Stage) -> Result<RunSummary> {
    let run_start = Instant::now();
    let mut tables = Vec::new();

    if stage.runs_songs() {
        tables.extend(process_song_data(engine, config).await?);
    }
    if stage.runs_logs() {
        tables.extend(process_log_data(engine, config).await?);
    }

    let summary = RunSummary {
        stage,
        tables,
        elapsed_secs: run_start.elapsed().as_secs_f64(),
    };

    fs::create_dir_all(&config.output.root)?;
    let path = config.output.root.join(RUN_SUMMARY_FILE);
    fs::write(&path, serde_json::to_string_pretty(&summary)?)
        .map_err(|source| EtlError::Write { path, source })?;

    info!("============================================================");
    for table in &summary.tables {
        info!(
            "  {:<14} {:>12} rows  {:>5} files",
            table.table,
            HumanCount(table.rows as u64).to_string(),
            table.files
        );
    }
    info!(
        "Wrote {} rows in {}",
        HumanCount(summary.total_rows() as u64),
        HumanDuration(run_start.elapsed())
    );
    Ok(summary)
}
