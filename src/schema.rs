//! Source record schemas and output table layouts.
//!
//! Sources are read against these declared schemas rather than inferred ones:
//! inference over thousands of small JSON documents is slow and, worse, picks
//! `Null` for columns that happen to be empty in the sampled files. Fields
//! marked non-nullable must be present in every record, otherwise the read
//! fails when the dataset is executed.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use datafusion::dataframe::DataFrame;

use crate::error::{EtlError, Result};

// ============================================================================
// Source schemas
// ============================================================================

/// One JSON document per song, with the artist denormalized onto it.
pub fn song_record_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("num_songs", DataType::Int64, true),
        Field::new("artist_id", DataType::Utf8, false),
        Field::new("artist_latitude", DataType::Float64, true),
        Field::new("artist_longitude", DataType::Float64, true),
        Field::new("artist_location", DataType::Utf8, true),
        Field::new("artist_name", DataType::Utf8, false),
        Field::new("song_id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("duration", DataType::Float64, false),
        Field::new("year", DataType::Int64, false),
    ]))
}

/// One JSON line per logged page view.
///
/// Only `page`, `sessionId` and `ts` are guaranteed on every event; the play
/// fields (`artist`, `song`, `length`) and the user fields are null for
/// non-play or logged-out events.
pub fn activity_record_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("artist", DataType::Utf8, true),
        Field::new("auth", DataType::Utf8, true),
        Field::new("firstName", DataType::Utf8, true),
        Field::new("gender", DataType::Utf8, true),
        Field::new("itemInSession", DataType::Int64, true),
        Field::new("lastName", DataType::Utf8, true),
        Field::new("length", DataType::Float64, true),
        Field::new("level", DataType::Utf8, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("method", DataType::Utf8, true),
        Field::new("page", DataType::Utf8, false),
        Field::new("registration", DataType::Float64, true),
        Field::new("sessionId", DataType::Int64, false),
        Field::new("song", DataType::Utf8, true),
        Field::new("status", DataType::Int64, true),
        Field::new("ts", DataType::Int64, false),
        Field::new("userAgent", DataType::Utf8, true),
        Field::new("userId", DataType::Utf8, true),
    ]))
}

/// `start_time` is stored with second precision, pinned to UTC.
pub fn start_time_type() -> DataType {
    DataType::Timestamp(TimeUnit::Second, Some("UTC".into()))
}

/// Schema produced by the time decomposer, before partitioning.
pub fn time_table_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Int64, false),
        Field::new("start_time", start_time_type(), true),
        Field::new("hour", DataType::Int32, true),
        Field::new("day", DataType::Int32, true),
        Field::new("week", DataType::Int32, true),
        Field::new("month", DataType::Int32, true),
        Field::new("year", DataType::Int32, true),
        Field::new("weekday", DataType::Int32, true),
    ]))
}

// ============================================================================
// Column sets
// ============================================================================

pub const SONG_COLUMNS: [&str; 5] = ["song_id", "title", "artist_id", "year", "duration"];

/// Source columns of the artists table and the names they are written under.
pub const ARTIST_COLUMNS: [(&str, &str); 5] = [
    ("artist_id", "artist_id"),
    ("artist_name", "name"),
    ("artist_location", "location"),
    ("artist_latitude", "latitude"),
    ("artist_longitude", "longitude"),
];

pub const USER_COLUMNS: [&str; 5] = ["userId", "firstName", "lastName", "gender", "level"];

/// Songplays output columns, in output order.
pub const SONGPLAY_COLUMNS: [&str; 10] = [
    "ts",
    "year",
    "month",
    "user_id",
    "level",
    "song_id",
    "artist_id",
    "session_id",
    "artist_location",
    "user_agent",
];

/// The only page value that represents a song play.
pub const NEXT_SONG_PAGE: &str = "NextSong";

// ============================================================================
// Output tables
// ============================================================================

/// A named output dataset and the columns it is partitioned by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputTable {
    /// Directory name under the output root.
    pub name: &'static str,
    pub partition_by: &'static [&'static str],
}

pub const SONGS_TABLE: OutputTable = OutputTable {
    name: "songs",
    partition_by: &["year", "artist_id"],
};

pub const ARTISTS_TABLE: OutputTable = OutputTable {
    name: "artists_table",
    partition_by: &[],
};

pub const USERS_TABLE: OutputTable = OutputTable {
    name: "users_table",
    partition_by: &[],
};

pub const TIME_TABLE: OutputTable = OutputTable {
    name: "time_table",
    partition_by: &["year", "month"],
};

pub const SONGPLAYS_TABLE: OutputTable = OutputTable {
    name: "songplays",
    partition_by: &["year", "month"],
};

pub const OUTPUT_TABLES: [OutputTable; 5] = [
    SONGS_TABLE,
    ARTISTS_TABLE,
    USERS_TABLE,
    TIME_TABLE,
    SONGPLAYS_TABLE,
];

// ============================================================================
// Validation
// ============================================================================

/// Fail with [`EtlError::SchemaMismatch`] on the first of `columns` that `df`
/// does not carry.
pub fn require_columns<'a>(
    df: &DataFrame,
    table: &str,
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let fields = df.schema().fields();
    for column in columns {
        if !fields.iter().any(|f| f.name() == column) {
            return Err(EtlError::SchemaMismatch {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
    }
    Ok(())
}
