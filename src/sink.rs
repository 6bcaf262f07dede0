//! Hive-style partitioned parquet output.
//!
//! ## Layout
//!
//! ```text
//! <dest>/
//!   year=2018/month=11/part-00000.parquet
//!   year=2018/month=11/part-00001.parquet
//!   year=2018/month=12/part-00000.parquet
//!   _SUCCESS
//! ```
//!
//! Partition columns live only in the directory names; the parquet files carry
//! the remaining columns. Rows are buffered until
//! [`SinkOptions::max_buffered_rows`] is reached, then every buffered
//! partition is flushed to its next numbered part file, so a directory holds
//! one file per flush that touched it. An unpartitioned table always has at
//! least `part-00000.parquet` directly under `<dest>`, written even when empty
//! so the schema is readable.
//!
//! ## Overwrite semantics
//!
//! The destination is removed before anything is written. There is no staging
//! directory: a write that fails halfway leaves a partial table behind. The
//! `_SUCCESS` marker is written last, so its absence identifies such a table.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::UInt32Array;
use arrow::compute::take_record_batch;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use indexmap::IndexMap;
use indicatif::{ProgressBar, ProgressStyle};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rayon::prelude::*;
use serde::Serialize;

use crate::error::{EtlError, Result};
use crate::schema::OutputTable;

pub const SUCCESS_MARKER: &str = "_SUCCESS";

fn part_file(index: usize) -> String {
    format!("part-{index:05}.parquet")
}

/// How a table write encodes and buffers its rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkOptions {
    pub compression: Compression,
    /// Buffered rows that trigger a flush of every open partition.
    pub max_buffered_rows: usize,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            compression: Compression::SNAPPY,
            max_buffered_rows: 1_000_000,
        }
    }
}

/// What a finished table write produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub table: String,
    pub rows: usize,
    pub files: usize,
    /// Number of partition directories; zero for unpartitioned tables.
    pub partitions: usize,
}

/// Escape a partition value for use in a `col=value` directory name.
///
/// Characters that are path separators, special to the hive layout or
/// rejected by common filesystems become `%XX`.
pub fn escape_partition_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        let needs_escape = c.is_control()
            || matches!(
                c,
                '/' | '\\' | '=' | '%' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '#'
            );
        if needs_escape {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        } else {
            out.push(c);
        }
    }
    if out.is_empty() || out == "." || out == ".." {
        out = out.replace('.', "%2E");
        if out.is_empty() {
            out.push_str("%00");
        }
    }
    out
}

/// Buffers record batches per partition and flushes them to numbered parquet
/// files whenever the row budget is spent.
pub struct PartitionedWriter {
    table: OutputTable,
    dest: PathBuf,
    file_schema: SchemaRef,
    partition_indices: Vec<usize>,
    data_indices: Vec<usize>,
    props: WriterProperties,
    max_buffered_rows: usize,
    buffers: IndexMap<String, Vec<RecordBatch>>,
    buffered_rows: usize,
    /// Next part index per partition directory.
    next_part: IndexMap<String, usize>,
    rows: usize,
    files: usize,
}

impl PartitionedWriter {
    /// Validate the partition columns against `schema` and clear `dest`.
    ///
    /// Validation happens before the destination is touched, so a bad
    /// partition column list never destroys previous output.
    pub fn try_new(
        dest: &Path,
        table: OutputTable,
        schema: SchemaRef,
        options: &SinkOptions,
    ) -> Result<Self> {
        let mut partition_indices = Vec::with_capacity(table.partition_by.len());
        for column in table.partition_by {
            let idx = schema
                .index_of(column)
                .map_err(|_| EtlError::MissingPartitionColumn {
                    table: table.name.to_string(),
                    column: column.to_string(),
                })?;
            partition_indices.push(idx);
        }
        let data_indices: Vec<usize> = (0..schema.fields().len())
            .filter(|i| !partition_indices.contains(i))
            .collect();
        let file_schema = Arc::new(schema.project(&data_indices)?);

        clear_destination(dest)?;
        fs::create_dir_all(dest).map_err(|source| EtlError::Write {
            path: dest.to_path_buf(),
            source,
        })?;

        let props = WriterProperties::builder()
            .set_compression(options.compression)
            .set_created_by(format!("playlake {}", env!("CARGO_PKG_VERSION")))
            .build();

        Ok(Self {
            table,
            dest: dest.to_path_buf(),
            file_schema,
            partition_indices,
            data_indices,
            props,
            max_buffered_rows: options.max_buffered_rows.max(1),
            buffers: IndexMap::new(),
            buffered_rows: 0,
            next_part: IndexMap::new(),
            rows: 0,
            files: 0,
        })
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.rows += batch.num_rows();
        self.buffered_rows += batch.num_rows();
        let data = batch.project(&self.data_indices)?;

        if self.partition_indices.is_empty() {
            self.buffers.entry(String::new()).or_default().push(data);
            return self.flush_if_full();
        }

        let columns: Vec<_> = self
            .partition_indices
            .iter()
            .zip(self.table.partition_by)
            .map(|(&idx, name)| {
                let array = batch.column(idx).clone();
                if array.null_count() > 0 {
                    return Err(EtlError::NullPartitionKey {
                        table: self.table.name.to_string(),
                        column: name.to_string(),
                    });
                }
                Ok((*name, array))
            })
            .collect::<Result<_>>()?;

        let mut groups: IndexMap<String, Vec<u32>> = IndexMap::new();
        for row in 0..batch.num_rows() {
            let mut dir = String::new();
            for (name, array) in &columns {
                let value = array_value_to_string(array, row)?;
                if !dir.is_empty() {
                    dir.push('/');
                }
                dir.push_str(name);
                dir.push('=');
                dir.push_str(&escape_partition_value(&value));
            }
            groups.entry(dir).or_default().push(row as u32);
        }

        for (dir, rows) in groups {
            let indices = UInt32Array::from(rows);
            let part = take_record_batch(&data, &indices)?;
            self.buffers.entry(dir).or_default().push(part);
        }
        self.flush_if_full()
    }

    fn flush_if_full(&mut self) -> Result<()> {
        if self.buffered_rows >= self.max_buffered_rows {
            self.flush()?;
        }
        Ok(())
    }

    /// Write every buffered partition to its next part file.
    fn flush(&mut self) -> Result<()> {
        let parts: Vec<(PathBuf, Vec<RecordBatch>)> = self
            .buffers
            .drain(..)
            .map(|(dir, batches)| {
                let index = self.next_part.entry(dir.clone()).or_insert(0);
                let path = self.dest.join(&dir).join(part_file(*index));
                *index += 1;
                (path, batches)
            })
            .collect();
        self.buffered_rows = 0;
        if parts.is_empty() {
            return Ok(());
        }

        let pb = ProgressBar::new(parts.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "  Writing    {bar:40.cyan/blue} {pos}/{len} partitions [{elapsed_precise}] {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
        );
        pb.set_message(self.table.name);

        parts.par_iter().try_for_each(|(path, batches)| {
            write_parquet_file(path, &self.file_schema, batches, &self.props)?;
            pb.inc(1);
            Ok::<_, EtlError>(())
        })?;
        pb.finish_and_clear();
        self.files += parts.len();
        Ok(())
    }

    /// Flush what is still buffered, then write the `_SUCCESS` marker.
    pub fn finish(mut self) -> Result<WriteSummary> {
        let partitioned = !self.partition_indices.is_empty();
        if !partitioned && self.files == 0 && self.buffers.is_empty() {
            self.buffers.insert(String::new(), Vec::new());
        }
        self.flush()?;

        let marker = self.dest.join(SUCCESS_MARKER);
        File::create(&marker).map_err(|source| EtlError::Write {
            path: marker,
            source,
        })?;

        Ok(WriteSummary {
            table: self.table.name.to_string(),
            rows: self.rows,
            files: self.files,
            partitions: if partitioned { self.next_part.len() } else { 0 },
        })
    }
}

fn clear_destination(dest: &Path) -> Result<()> {
    let removed = if dest.is_dir() {
        fs::remove_dir_all(dest)
    } else if dest.exists() {
        fs::remove_file(dest)
    } else {
        Ok(())
    };
    removed.map_err(|source| EtlError::Write {
        path: dest.to_path_buf(),
        source,
    })
}

fn write_parquet_file(
    path: &Path,
    schema: &SchemaRef,
    batches: &[RecordBatch],
    props: &WriterProperties,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| EtlError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let file = File::create(path).map_err(|source| EtlError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props.clone()))?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.close()?;
    Ok(())
}
