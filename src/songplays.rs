//! Fact join: play events × song catalog × time table → `songplays`.
//!
//! Plays are matched to songs on the natural key `(title, artist name,
//! duration)` with exact equality on every column, including the float
//! duration. A logged length that differs from the catalog duration by any
//! amount does not match. Songs sharing the same natural key fan out to one
//! fact row each. Unmatched rows on either side are dropped.

use datafusion::common::JoinType;
use datafusion::dataframe::DataFrame;
use datafusion::logical_expr::{Expr, ident};

use crate::error::Result;
use crate::schema::{SONGPLAY_COLUMNS, require_columns};

/// Play columns the join reads.
const PLAY_KEYS: [&str; 3] = ["song", "artist", "length"];
/// Song columns the plays are matched against, paired with [`PLAY_KEYS`].
const SONG_KEYS: [&str; 3] = ["title", "artist_name", "duration"];

/// Build the songplays fact table.
///
/// `plays` are NextSong activity records; `songs` are raw song records (the
/// artist name lives on them); `time` is the decomposed time table.
pub fn songplays_table(plays: &DataFrame, songs: &DataFrame, time: &DataFrame) -> Result<DataFrame> {
    require_columns(
        plays,
        "play events",
        PLAY_KEYS
            .into_iter()
            .chain(["ts", "userId", "level", "sessionId", "userAgent"]),
    )?;
    require_columns(
        songs,
        "song records",
        SONG_KEYS
            .into_iter()
            .chain(["song_id", "artist_id", "artist_location"]),
    )?;
    require_columns(time, "time_table", ["ts", "year", "month"])?;

    // Only the columns the fact row needs cross the join, so no name is
    // carried by both sides.
    let catalog = songs.clone().select(
        ["song_id", "artist_id", "artist_location"]
            .into_iter()
            .chain(SONG_KEYS)
            .map(ident)
            .collect::<Vec<_>>(),
    )?;
    let calendar = time.clone().select(vec![
        ident("ts").alias("time_ts"),
        ident("year"),
        ident("month"),
    ])?;

    let joined = plays
        .clone()
        .join(catalog, JoinType::Inner, &PLAY_KEYS, &SONG_KEYS, None)?
        .join(calendar, JoinType::Inner, &["ts"], &["time_ts"], None)?;

    Ok(joined.select(output_columns())?.distinct()?)
}

fn output_columns() -> Vec<Expr> {
    SONGPLAY_COLUMNS
        .iter()
        .map(|&name| match name {
            "user_id" => ident("userId").alias(name),
            "session_id" => ident("sessionId").alias(name),
            "user_agent" => ident("userAgent").alias(name),
            _ => ident(name),
        })
        .collect()
}
