//! The execution engine every stage runs on.
//!
//! `Engine` wraps a DataFusion [`SessionContext`] and is passed explicitly to
//! each stage: JSON in, relational operators in between, partitioned parquet
//! out.

use std::path::Path;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use datafusion::dataframe::DataFrame;
use datafusion::datasource::MemTable;
use datafusion::error::DataFusionError;
use datafusion::prelude::{NdJsonReadOptions, SessionConfig, SessionContext};
use futures::StreamExt;
use indicatif::HumanCount;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{EtlError, Result};
use crate::schema::OutputTable;
use crate::sink::{PartitionedWriter, SinkOptions, WriteSummary};
use crate::source::SourcePattern;

pub struct Engine {
    ctx: SessionContext,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Self {
        let session_config = SessionConfig::new()
            .set_bool("datafusion.sql_parser.enable_ident_normalization", false)
            .with_target_partitions(config.target_partitions)
            .with_batch_size(config.batch_size);
        Self {
            ctx: SessionContext::new_with_config(session_config),
        }
    }

    /// Read every file matching `source` as newline-delimited JSON, typed by
    /// `schema`.
    ///
    /// Fields not in `schema` are ignored. Every resolved file is read
    /// whatever its extension. Decoding is lazy: a record missing a required
    /// field fails when the returned frame is executed, which
    /// [`Engine::scan_source`] does first.
    pub async fn read_json(&self, source: &SourcePattern, schema: &SchemaRef) -> Result<DataFrame> {
        let files = source.resolve()?;
        let paths: Vec<String> = files
            .iter()
            .map(|p| {
                let absolute = if p.is_absolute() {
                    p.clone()
                } else {
                    std::env::current_dir()?.join(p)
                };
                absolute
                    .to_str()
                    .map(str::to_string)
                    .ok_or_else(|| EtlError::SourceRead {
                        pattern: source.to_string(),
                        reason: format!("non UTF-8 path {}", p.display()),
                    })
            })
            .collect::<Result<_>>()?;
        info!("  Reading {} files from {}", HumanCount(paths.len() as u64), source);

        let options = NdJsonReadOptions::default()
            .schema(schema.as_ref())
            .file_extension("");
        self.ctx
            .read_json(paths, options)
            .await
            .map_err(|e| EtlError::SourceRead {
                pattern: source.to_string(),
                reason: e.to_string(),
            })
    }

    /// Execute a freshly read source once, decoding every column, and return
    /// its row count.
    ///
    /// A record missing a required field becomes [`EtlError::SchemaMismatch`]
    /// naming the field; any other decode failure becomes
    /// [`EtlError::SourceRead`].
    pub async fn scan_source(
        &self,
        df: &DataFrame,
        source: &SourcePattern,
        table: &str,
    ) -> Result<usize> {
        let mut stream = df
            .clone()
            .execute_stream()
            .await
            .map_err(|e| source_error(source, table, e))?;
        let mut rows = 0;
        while let Some(batch) = stream.next().await {
            rows += batch.map_err(|e| source_error(source, table, e))?.num_rows();
        }
        Ok(rows)
    }

    /// Wrap in-memory batches as a frame. `schema` is required so that an
    /// empty batch list still yields a typed, empty frame.
    pub fn from_batches(&self, schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<DataFrame> {
        let table = MemTable::try_new(schema, vec![batches])?;
        Ok(self.ctx.read_table(Arc::new(table))?)
    }

    /// Execute `df` and return its batches.
    pub async fn collect(&self, df: DataFrame) -> Result<Vec<RecordBatch>> {
        Ok(df.collect().await?)
    }

    /// Execute `df` and stream its rows into `<output_root>/<table.name>`,
    /// replacing whatever was there.
    pub async fn write(
        &self,
        df: DataFrame,
        table: OutputTable,
        output_root: &Path,
        options: &SinkOptions,
    ) -> Result<WriteSummary> {
        let dest = output_root.join(table.name);
        let schema: SchemaRef = df.schema().inner().clone();
        let mut writer = PartitionedWriter::try_new(&dest, table, schema, options)?;

        let mut stream = df.execute_stream().await?;
        while let Some(batch) = stream.next().await {
            writer.write(&batch?)?;
        }
        let summary = writer.finish()?;
        info!(
            "  Wrote {} ({} rows, {} files, {} partitions) to {}",
            table.name,
            HumanCount(summary.rows as u64),
            summary.files,
            summary.partitions,
            dest.display()
        );
        Ok(summary)
    }
}

/// Classify a failure to decode source records.
///
/// The JSON decoder reports an absent required field as unmasked nulls in a
/// non-nullable child, followed by the field's debug form.
fn source_error(source: &SourcePattern, table: &str, err: DataFusionError) -> EtlError {
    let reason = err.to_string();
    if let Some(column) = missing_required_field(&reason) {
        return EtlError::SchemaMismatch {
            table: table.to_string(),
            column,
        };
    }
    EtlError::SourceRead {
        pattern: source.to_string(),
        reason,
    }
}

fn missing_required_field(reason: &str) -> Option<String> {
    let (_, rest) = reason.split_once("non-nullable")?;
    let (_, rest) = rest.split_once("name: \"")?;
    let (name, _) = rest.split_once('"')?;
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use arrow::array::{Array, Float64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("score", DataType::Float64, true),
        ]))
    }

    fn engine() -> Engine {
        Engine::new(&EngineConfig::default())
    }

    #[tokio::test]
    async fn test_read_json_ignores_extra_fields() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("in")).unwrap();
        fs::write(
            dir.path().join("in/a.json"),
            "{\"id\": \"a\", \"score\": 1.5, \"extra\": true}\n{\"id\": \"b\"}\n",
        )
        .unwrap();

        let engine = engine();
        let df = engine
            .read_json(&SourcePattern::new(dir.path(), "in/*.json"), &schema())
            .await
            .unwrap();
        assert_eq!(df.schema().fields().len(), 2);

        let batches = engine.collect(df).await.unwrap();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);

        let mut seen = Vec::new();
        for batch in &batches {
            let ids = batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
            let scores = batch.column(1).as_any().downcast_ref::<Float64Array>().unwrap();
            for i in 0..batch.num_rows() {
                let score = (!scores.is_null(i)).then(|| scores.value(i));
                seen.push((ids.value(i).to_string(), score));
            }
        }
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(seen, vec![("a".to_string(), Some(1.5)), ("b".to_string(), None)]);
    }

    async fn scan(contents: &str, pattern: &str, file: &str) -> Result<usize> {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("in")).unwrap();
        fs::write(dir.path().join("in").join(file), contents).unwrap();

        let engine = engine();
        let source = SourcePattern::new(dir.path(), pattern);
        let df = engine.read_json(&source, &schema()).await?;
        engine.scan_source(&df, &source, "scores").await
    }

    #[tokio::test]
    async fn test_scan_source_counts_rows() {
        let rows = scan("{\"id\": \"a\"}\n{\"id\": \"b\"}\n", "in/*.json", "a.json").await;
        assert_eq!(rows.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_required_field_is_schema_mismatch() {
        let err = scan("{\"score\": 2.0}\n", "in/*.json", "a.json")
            .await
            .unwrap_err();
        match err {
            EtlError::SchemaMismatch { table, column } => {
                assert_eq!(table, "scores");
                assert_eq!(column, "id");
            }
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_json_is_source_read_error() {
        let err = scan("{not json\n", "in/*.json", "a.json").await.unwrap_err();
        match err {
            EtlError::SourceRead { pattern, .. } => assert!(pattern.ends_with("in/*.json")),
            other => panic!("expected SourceRead, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_any_resolved_extension_is_read() {
        let rows = scan("{\"id\": \"a\"}\n", "in/*.ndjson", "a.ndjson").await;
        assert_eq!(rows.unwrap(), 1);
    }

    #[test]
    fn test_missing_required_field_parses_decoder_message() {
        let message = "Arrow error: Json error: Encountered unmasked nulls in non-nullable \
                       StructArray child: Field { name: \"title\", data_type: Utf8 }";
        assert_eq!(missing_required_field(message).as_deref(), Some("title"));
        assert_eq!(missing_required_field("Encountered unexpected 'n'"), None);
    }

    #[tokio::test]
    async fn test_read_json_without_files_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = engine()
            .read_json(&SourcePattern::new(dir.path(), "in/*.json"), &schema())
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::NoSourceFiles { .. }));
    }

    #[tokio::test]
    async fn test_from_batches_accepts_no_batches() {
        let engine = engine();
        let df = engine.from_batches(schema(), Vec::new()).unwrap();
        assert_eq!(df.schema().fields().len(), 2);
        assert!(engine.collect(df).await.unwrap().iter().all(|b| b.num_rows() == 0));
    }

    #[tokio::test]
    async fn test_write_streams_frame_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let batch = RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(StringArray::from(vec!["a", "b"])),
                Arc::new(Float64Array::from(vec![Some(1.0), None])),
            ],
        )
        .unwrap();
        let df = engine.from_batches(schema(), vec![batch]).unwrap();

        let table = OutputTable {
            name: "scores",
            partition_by: &["id"],
        };
        let summary = engine
            .write(df, table, dir.path(), &SinkOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.partitions, 2);
        assert!(dir.path().join("scores/id=a/part-00000.parquet").exists());
        assert!(dir.path().join("scores/id=b/part-00000.parquet").exists());
    }
}
