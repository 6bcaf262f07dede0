//! Inspect an output root: dump per-dataset file counts, partitions, row
//! counts, schemas and sample rows in a human-readable format.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --output-root output
//! cargo run --release --bin inspect -- --output-root output --sample-rows 10
//! ```

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use clap::Parser;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use walkdir::WalkDir;

use playlake::pipeline::RUN_SUMMARY_FILE;
use playlake::schema::{OUTPUT_TABLES, OutputTable};
use playlake::sink::SUCCESS_MARKER;

#[derive(Parser, Debug)]
#[command(about = "Inspect the datasets written by the etl binary")]
struct Args {
    /// Output root the datasets were written under.
    #[arg(long)]
    output_root: PathBuf,

    /// Number of sample rows to dump per dataset (0 to skip).
    #[arg(long, default_value_t = 5)]
    sample_rows: usize,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    // ── Overview ──────────────────────────────────────────────────────────
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Output root: {}", args.output_root.display());
    println!("╠══════════════════════════════════════════════════════════════╣");
    let summary_path = args.output_root.join(RUN_SUMMARY_FILE);
    match fs::read_to_string(&summary_path) {
        Ok(text) => {
            let summary: serde_json::Value = serde_json::from_str(&text)?;
            println!("║  Last run stage: {}", summary["stage"].as_str().unwrap_or("?"));
            println!("║  Last run took:  {:.1}s", summary["elapsed_secs"].as_f64().unwrap_or(0.0));
        }
        Err(_) => println!("║  No {RUN_SUMMARY_FILE} found"),
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // ── Datasets ─────────────────────────────────────────────────────────
    for table in OUTPUT_TABLES {
        inspect_table(&args.output_root, table, args.sample_rows)?;
        println!();
    }
    Ok(())
}

fn inspect_table(root: &Path, table: OutputTable, sample_rows: usize) -> Result<(), BoxError> {
    let dir = root.join(table.name);
    println!("┌─ Dataset \"{}\"", table.name);
    if !dir.is_dir() {
        println!("│  (missing)");
        println!("└──────────────────────────────────────────────────────────────");
        return Ok(());
    }

    let files = parquet_files(&dir);
    let partitions: BTreeSet<PathBuf> = files
        .iter()
        .filter_map(|f| f.parent())
        .filter(|p| *p != dir.as_path())
        .map(Path::to_path_buf)
        .collect();

    let mut total_rows: i64 = 0;
    for file in &files {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(file)?)?;
        total_rows += reader.metadata().file_metadata().num_rows();
    }

    let partition_str = if table.partition_by.is_empty() {
        "(unpartitioned)".to_string()
    } else {
        table.partition_by.join(", ")
    };
    println!(
        "│  Files: {}  Partitions: {}  Rows: {total_rows}",
        files.len(),
        partitions.len()
    );
    println!("│  Partitioned by: {partition_str}");
    println!(
        "│  Complete: {}",
        if dir.join(SUCCESS_MARKER).exists() { "yes" } else { "no (no _SUCCESS marker)" }
    );

    let Some(first) = files.first() else {
        println!("└──────────────────────────────────────────────────────────────");
        return Ok(());
    };

    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(first)?)?;
    println!("│");
    println!("│  File schema:");
    for field in builder.schema().fields() {
        let nullable = if field.is_nullable() { "" } else { " NOT NULL" };
        println!("│    {} : {}{nullable}", field.name(), field.data_type());
    }
    for column in table.partition_by {
        println!("│    {column} : (partition directory)");
    }

    for partition in partitions.iter().take(5) {
        let relative = partition.strip_prefix(&dir).unwrap_or(partition);
        println!("│  Partition: {}", relative.display());
    }
    if partitions.len() > 5 {
        println!("│  ... ({} more partitions)", partitions.len() - 5);
    }

    if sample_rows > 0 {
        let batches = sample(&files, sample_rows)?;
        let shown: usize = batches.iter().map(|b| b.num_rows()).sum();
        println!("│");
        println!("│  Sample rows (first {shown} of {total_rows}, partition columns omitted):");
        if shown > 0 {
            for line in pretty_format_batches(&batches)?.to_string().lines() {
                println!("│  {line}");
            }
        }
    }

    println!("└──────────────────────────────────────────────────────────────");
    Ok(())
}

fn parquet_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
        .collect();
    files.sort();
    files
}

/// Read up to `limit` rows, taking files in order.
fn sample(files: &[PathBuf], limit: usize) -> Result<Vec<RecordBatch>, BoxError> {
    let mut batches = Vec::new();
    let mut remaining = limit;
    for file in files {
        if remaining == 0 {
            break;
        }
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(file)?)?
            .with_batch_size(remaining)
            .with_limit(remaining)
            .build()?;
        for batch in reader {
            let batch = batch?;
            remaining = remaining.saturating_sub(batch.num_rows());
            if batch.num_rows() > 0 {
                batches.push(batch);
            }
        }
    }
    Ok(batches)
}
