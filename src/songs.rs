//! Song catalog stage: song metadata documents → `songs` and `artists_table`.

use datafusion::dataframe::DataFrame;
use datafusion::logical_expr::ident;
use indicatif::HumanDuration;
use tracing::info;

use crate::config::PipelineConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::pipeline::ensure_rows;
use crate::schema::{
    ARTIST_COLUMNS, ARTISTS_TABLE, SONG_COLUMNS, SONGS_TABLE, require_columns, song_record_schema,
};
use crate::sink::WriteSummary;

/// `song_id, title, artist_id, year, duration`, one row per distinct tuple.
pub fn songs_table(records: &DataFrame) -> Result<DataFrame> {
    require_columns(records, "song records", SONG_COLUMNS)?;
    Ok(records
        .clone()
        .select(SONG_COLUMNS.iter().map(|c| ident(*c)).collect::<Vec<_>>())?
        .distinct()?)
}

/// `artist_id, name, location, latitude, longitude`, one row per distinct
/// tuple.
///
/// Deduplication is on the whole row, so an artist whose location differs
/// between two song documents appears twice.
pub fn artists_table(records: &DataFrame) -> Result<DataFrame> {
    require_columns(records, "song records", ARTIST_COLUMNS.iter().map(|(src, _)| *src))?;
    Ok(records
        .clone()
        .select(
            ARTIST_COLUMNS
                .iter()
                .map(|(src, dst)| ident(*src).alias(*dst))
                .collect::<Vec<_>>(),
        )?
        .distinct()?)
}

/// Read song metadata and write the songs and artists dimension tables.
pub async fn process_song_data(
    engine: &Engine,
    config: &PipelineConfig,
) -> Result<Vec<WriteSummary>> {
    let stage_start = std::time::Instant::now();
    info!("Song catalog stage");

    let source = config.input.song_source();
    let records = engine.read_json(&source, &song_record_schema()).await?;
    let policy = config.pipeline.empty_source;
    ensure_rows(engine, &records, &source, "song records", policy).await?;

    let output = &config.output;
    let options = output.sink_options();
    let songs = engine
        .write(songs_table(&records)?, SONGS_TABLE, &output.root, &options)
        .await?;
    let artists = engine
        .write(artists_table(&records)?, ARTISTS_TABLE, &output.root, &options)
        .await?;

    info!(
        "Song catalog stage done in {}",
        HumanDuration(stage_start.elapsed())
    );
    Ok(vec![songs, artists])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{Array, Float64Array, Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;

    use crate::config::EngineConfig;
    use crate::error::EtlError;

    struct Song<'a> {
        song_id: &'a str,
        title: &'a str,
        artist_id: &'a str,
        artist_name: &'a str,
        location: Option<&'a str>,
        duration: f64,
        year: i64,
    }

    fn records(engine: &Engine, songs: &[Song]) -> DataFrame {
        let schema = song_record_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![Some(1); songs.len()])),
                Arc::new(StringArray::from_iter_values(songs.iter().map(|s| s.artist_id))),
                Arc::new(Float64Array::from(vec![None; songs.len()])),
                Arc::new(Float64Array::from(vec![None; songs.len()])),
                Arc::new(StringArray::from(
                    songs.iter().map(|s| s.location).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from_iter_values(songs.iter().map(|s| s.artist_name))),
                Arc::new(StringArray::from_iter_values(songs.iter().map(|s| s.song_id))),
                Arc::new(StringArray::from_iter_values(songs.iter().map(|s| s.title))),
                Arc::new(Float64Array::from_iter_values(songs.iter().map(|s| s.duration))),
                Arc::new(Int64Array::from_iter_values(songs.iter().map(|s| s.year))),
            ],
        )
        .unwrap();
        engine.from_batches(schema, vec![batch]).unwrap()
    }

    async fn row_count(engine: &Engine, df: DataFrame) -> usize {
        engine
            .collect(df)
            .await
            .unwrap()
            .iter()
            .map(|b| b.num_rows())
            .sum()
    }

    fn catalog() -> Vec<Song<'static>> {
        vec![
            Song {
                song_id: "SOA",
                title: "Setanta matins",
                artist_id: "AR1",
                artist_name: "Elena",
                location: Some("Dublin"),
                duration: 269.58,
                year: 0,
            },
            Song {
                song_id: "SOA",
                title: "Setanta matins",
                artist_id: "AR1",
                artist_name: "Elena",
                location: Some("Dublin"),
                duration: 269.58,
                year: 0,
            },
            Song {
                song_id: "SOB",
                title: "Der Kleine Dompfaff",
                artist_id: "AR1",
                artist_name: "Elena",
                location: Some("Cork"),
                duration: 152.92,
                year: 2008,
            },
        ]
    }

    #[tokio::test]
    async fn test_songs_table_collapses_duplicate_rows() {
        let engine = Engine::new(&EngineConfig::default());
        let songs = songs_table(&records(&engine, &catalog())).unwrap();

        let names: Vec<String> = songs
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, SONG_COLUMNS);
        assert_eq!(row_count(&engine, songs).await, 2);
    }

    /// `(song_id, title, artist_id, year, duration bits)`, sorted.
    async fn song_rows(engine: &Engine, df: DataFrame) -> Vec<(String, String, String, i64, u64)> {
        let mut rows = Vec::new();
        for batch in engine.collect(df).await.unwrap() {
            let text = |name: &str| {
                batch
                    .column_by_name(name)
                    .unwrap()
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .unwrap()
                    .clone()
            };
            let (ids, titles, artists) = (text("song_id"), text("title"), text("artist_id"));
            let years = batch.column_by_name("year").unwrap();
            let years = years.as_any().downcast_ref::<Int64Array>().unwrap();
            let durations = batch.column_by_name("duration").unwrap();
            let durations = durations.as_any().downcast_ref::<Float64Array>().unwrap();
            for i in 0..batch.num_rows() {
                rows.push((
                    ids.value(i).to_string(),
                    titles.value(i).to_string(),
                    artists.value(i).to_string(),
                    years.value(i),
                    durations.value(i).to_bits(),
                ));
            }
        }
        rows.sort();
        rows
    }

    #[tokio::test]
    async fn test_songs_table_is_idempotent() {
        let engine = Engine::new(&EngineConfig::default());
        let once = songs_table(&records(&engine, &catalog())).unwrap();
        let twice = songs_table(&once).unwrap();

        let first = song_rows(&engine, once).await;
        let second = song_rows(&engine, twice).await;
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(first[0].0, "SOA");
        assert_eq!(
            first[1],
            (
                "SOB".to_string(),
                "Der Kleine Dompfaff".to_string(),
                "AR1".to_string(),
                2008,
                152.92_f64.to_bits()
            )
        );
    }

    #[tokio::test]
    async fn test_artists_table_renames_and_keeps_distinct_locations() {
        let engine = Engine::new(&EngineConfig::default());
        let artists = artists_table(&records(&engine, &catalog())).unwrap();

        let names: Vec<String> = artists
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, ["artist_id", "name", "location", "latitude", "longitude"]);
        // Same artist, two locations: full-row dedup keeps both.
        assert_eq!(row_count(&engine, artists).await, 2);
    }

    #[tokio::test]
    async fn test_missing_column_is_schema_mismatch() {
        let engine = Engine::new(&EngineConfig::default());
        let without_title = records(&engine, &catalog())
            .select(vec![ident("song_id"), ident("artist_id"), ident("year")])
            .unwrap();
        assert!(matches!(
            songs_table(&without_title),
            Err(EtlError::SchemaMismatch { column, .. }) if column == "title"
        ));
    }
}
