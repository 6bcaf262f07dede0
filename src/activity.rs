//! Activity stage: page-view logs → `users_table`, `time_table`, `songplays`.
//!
//! Everything downstream of [`next_song_plays`] sees only song plays; other
//! page views (home, login, settings...) leave no trace in any output.

use datafusion::dataframe::DataFrame;
use datafusion::logical_expr::{ident, lit};
use indicatif::HumanDuration;
use tracing::info;

use crate::config::PipelineConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::pipeline::ensure_rows;
use crate::schema::{
    NEXT_SONG_PAGE, SONGPLAYS_TABLE, TIME_TABLE, USER_COLUMNS, USERS_TABLE, activity_record_schema,
    require_columns, song_record_schema,
};
use crate::sink::WriteSummary;
use crate::songplays::songplays_table;
use crate::time::{start_time_expr, time_table};

/// Keep only events whose `page` is `NextSong`.
pub fn next_song_plays(events: &DataFrame) -> Result<DataFrame> {
    require_columns(events, "activity records", ["page"])?;
    Ok(events
        .clone()
        .filter(ident("page").eq(lit(NEXT_SONG_PAGE)))?)
}

/// `userId, firstName, lastName, gender, level`, deduplicated on the full row.
///
/// A user whose level changed between plays appears once per level.
pub fn users_table(plays: &DataFrame) -> Result<DataFrame> {
    require_columns(plays, "play events", USER_COLUMNS)?;
    Ok(plays
        .clone()
        .select(USER_COLUMNS.iter().map(|c| ident(*c)).collect::<Vec<_>>())?
        .distinct()?)
}

/// Add `start_time`, the UTC timestamp of `ts` truncated to seconds.
pub fn with_start_time(plays: &DataFrame) -> Result<DataFrame> {
    require_columns(plays, "play events", ["ts"])?;
    Ok(plays.clone().with_column("start_time", start_time_expr())?)
}

/// Read the activity logs and write the users, time and songplays tables.
///
/// The song catalog is read again from its source rather than from the songs
/// output, so this stage runs on its own.
pub async fn process_log_data(
    engine: &Engine,
    config: &PipelineConfig,
) -> Result<Vec<WriteSummary>> {
    let stage_start = std::time::Instant::now();
    info!("Activity stage");

    let policy = config.pipeline.empty_source;
    let log_source = config.input.log_source();
    let events = engine
        .read_json(&log_source, &activity_record_schema())
        .await?;
    ensure_rows(engine, &events, &log_source, "activity records", policy).await?;

    let output = &config.output;
    let options = output.sink_options();

    let plays = next_song_plays(&events)?;
    let users = engine
        .write(users_table(&plays)?, USERS_TABLE, &output.root, &options)
        .await?;

    let plays = with_start_time(&plays)?;
    let time = time_table(engine, &plays).await?;
    let times = engine
        .write(time.clone(), TIME_TABLE, &output.root, &options)
        .await?;

    let song_source = config.input.song_source();
    let songs = engine
        .read_json(&song_source, &song_record_schema())
        .await?;
    ensure_rows(engine, &songs, &song_source, "song records", policy).await?;
    let songplays = engine
        .write(
            songplays_table(&plays, &songs, &time)?,
            SONGPLAYS_TABLE,
            &output.root,
            &options,
        )
        .await?;

    info!(
        "Activity stage done in {}",
        HumanDuration(stage_start.elapsed())
    );
    Ok(vec![users, times, songplays])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;

    use crate::config::EngineConfig;

    struct Event<'a> {
        page: &'a str,
        user: &'a str,
        level: &'a str,
        ts: i64,
    }

    fn events(engine: &Engine, events: &[Event]) -> DataFrame {
        let schema = activity_record_schema();
        let n = events.len();
        let columns = schema
            .fields()
            .iter()
            .map(|field| -> arrow::array::ArrayRef {
                match field.name().as_str() {
                    "page" => Arc::new(StringArray::from_iter_values(events.iter().map(|e| e.page))),
                    "userId" => Arc::new(StringArray::from_iter_values(events.iter().map(|e| e.user))),
                    "level" => Arc::new(StringArray::from_iter_values(events.iter().map(|e| e.level))),
                    "ts" => Arc::new(Int64Array::from_iter_values(events.iter().map(|e| e.ts))),
                    "sessionId" => Arc::new(Int64Array::from(vec![1; n])),
                    _ => arrow::array::new_null_array(field.data_type(), n),
                }
            })
            .collect();
        let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();
        engine.from_batches(schema, vec![batch]).unwrap()
    }

    fn log() -> Vec<Event<'static>> {
        vec![
            Event {
                page: "NextSong",
                user: "26",
                level: "free",
                ts: 1_541_106_334_796,
            },
            Event {
                page: "NextSong",
                user: "26",
                level: "free",
                ts: 1_541_106_334_796,
            },
            Event {
                page: "NextSong",
                user: "26",
                level: "paid",
                ts: 1_541_121_934_796,
            },
            Event {
                page: "Home",
                user: "99",
                level: "free",
                ts: 1_541_000_000_000,
            },
            Event {
                page: "Logout",
                user: "98",
                level: "paid",
                ts: 1_541_000_001_000,
            },
        ]
    }

    async fn collect_strings(engine: &Engine, df: DataFrame, column: &str) -> Vec<String> {
        let mut values = Vec::new();
        for batch in engine.collect(df).await.unwrap() {
            let array = batch
                .column_by_name(column)
                .unwrap()
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .clone();
            values.extend(array.iter().flatten().map(str::to_string));
        }
        values.sort();
        values
    }

    #[tokio::test]
    async fn test_only_next_song_events_survive() {
        let engine = Engine::new(&EngineConfig::default());
        let plays = next_song_plays(&events(&engine, &log())).unwrap();
        let pages = collect_strings(&engine, plays, "page").await;
        assert_eq!(pages, vec!["NextSong"; 3]);
    }

    #[tokio::test]
    async fn test_users_table_has_no_trace_of_other_pages() {
        let engine = Engine::new(&EngineConfig::default());
        let plays = next_song_plays(&events(&engine, &log())).unwrap();
        let users = users_table(&plays).unwrap();

        let names: Vec<String> = users
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, USER_COLUMNS);
        // One row per level the user held; users 98 and 99 never played.
        let levels = collect_strings(&engine, users.clone(), "level").await;
        assert_eq!(levels, vec!["free", "paid"]);
        let ids = collect_strings(&engine, users, "userId").await;
        assert_eq!(ids, vec!["26", "26"]);
    }

    #[tokio::test]
    async fn test_time_table_covers_play_timestamps_only() {
        let engine = Engine::new(&EngineConfig::default());
        let plays = with_start_time(&next_song_plays(&events(&engine, &log())).unwrap()).unwrap();
        let time = time_table(&engine, &plays).await.unwrap();

        let mut ts = Vec::new();
        for batch in engine.collect(time).await.unwrap() {
            let column = batch
                .column_by_name("ts")
                .unwrap()
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap()
                .clone();
            ts.extend(column.values().iter().copied());
        }
        ts.sort();
        assert_eq!(ts, vec![1_541_106_334_796, 1_541_121_934_796]);
    }

    #[tokio::test]
    async fn test_with_start_time_adds_timestamp_column() {
        let engine = Engine::new(&EngineConfig::default());
        let plays = with_start_time(&events(&engine, &log())).unwrap();
        let field = plays.schema().field_with_unqualified_name("start_time").unwrap();
        assert_eq!(field.data_type(), &crate::schema::start_time_type());
    }
}
