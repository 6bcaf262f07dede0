//! ETL binary: reads song metadata and activity logs, writes the five output
//! datasets.
//!
//! ## Input
//!
//! Under `input.root` (default `data/`):
//! - `song_data/*/*/*/*.json`: one song document per file
//! - `log_data/*/*/*.json`: newline-delimited page-view events
//!
//! ## Output
//!
//! Under `output.root` (default `output/`), each replaced on every run:
//! - `songs/year=<y>/artist_id=<a>/part-NNNNN.parquet`
//! - `artists_table/part-NNNNN.parquet`
//! - `users_table/part-NNNNN.parquet`
//! - `time_table/year=<y>/month=<m>/part-NNNNN.parquet`
//! - `songplays/year=<y>/month=<m>/part-NNNNN.parquet`
//! - `_run_summary.json`
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin etl -- --input-root data --output-root output
//! cargo run --release --bin etl -- --config playlake.toml --stage logs
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use playlake::config::PipelineConfig;
use playlake::engine::Engine;
use playlake::pipeline::{Stage, run};

#[derive(Parser, Debug)]
#[command(about = "Build the songplays star schema from raw song and activity JSON")]
struct Args {
    /// TOML config file. Every key is optional; defaults are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the song and log patterns are resolved against. Overrides
    /// `input.root`.
    #[arg(long)]
    input_root: Option<PathBuf>,

    /// Directory the output datasets are written under. Overrides
    /// `output.root`.
    #[arg(long)]
    output_root: Option<PathBuf>,

    /// Which stages to run.
    #[arg(long, value_enum, default_value_t = Stage::All)]
    stage: Stage,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = PipelineConfig::load(args.config.as_deref())?;
    if let Some(root) = args.input_root {
        config.input.root = root;
    }
    if let Some(root) = args.output_root {
        config.output.root = root;
    }

    info!("Input:  {}", config.input.root.display());
    info!("Output: {}", config.output.root.display());
    info!("Stage:  {:?}", args.stage);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let engine = Engine::new(&config.engine);
    rt.block_on(run(&engine, &config, args.stage))?;
    Ok(())
}
