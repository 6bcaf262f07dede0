//! Calendar decomposition of play timestamps.
//!
//! Every field is computed in UTC from `start_time`, which is `ts` (epoch
//! milliseconds) truncated to whole seconds.
//!
//! | Field     | Range  | Meaning                                  |
//! |-----------|--------|------------------------------------------|
//! | `hour`    | 0–23   | hour of day                              |
//! | `day`     | 1–366  | day of year                              |
//! | `week`    | 1–53   | ISO-8601 week of year                    |
//! | `month`   | 1–12   | month of year                            |
//! | `year`    | e.g. 2018 | calendar year                         |
//! | `weekday` | 1–7    | day of week, **1 = Sunday … 7 = Saturday** |

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int32Builder, Int64Array, TimestampSecondArray};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, Timelike, Utc};
use datafusion::dataframe::DataFrame;
use datafusion::logical_expr::{Expr, cast, ident, lit};
use rayon::prelude::*;

use crate::engine::Engine;
use crate::error::{EtlError, Result};
use crate::schema::{require_columns, start_time_type, time_table_schema};

/// Calendar fields of a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeParts {
    pub hour: i32,
    pub day: i32,
    pub week: i32,
    pub month: i32,
    pub year: i32,
    pub weekday: i32,
}

impl TimeParts {
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            hour: dt.hour() as i32,
            day: dt.ordinal() as i32,
            week: dt.iso_week().week() as i32,
            month: dt.month() as i32,
            year: dt.year(),
            weekday: dt.weekday().number_from_sunday() as i32,
        }
    }
}

/// Epoch milliseconds to whole epoch seconds, truncating toward zero.
pub fn start_time_seconds(ts_ms: i64) -> i64 {
    ts_ms / 1000
}

/// Decompose an epoch-millisecond timestamp. `None` if it is out of range for
/// a calendar date.
pub fn decompose(ts_ms: i64) -> Option<TimeParts> {
    DateTime::<Utc>::from_timestamp(start_time_seconds(ts_ms), 0).map(TimeParts::from_datetime)
}

/// Expression deriving `start_time` from the `ts` column.
pub fn start_time_expr() -> Expr {
    cast(ident("ts") / lit(1000_i64), start_time_type())
}

/// Append the six calendar columns to a `(ts, start_time)` batch.
///
/// The output follows [`time_table_schema`]. Null `start_time` values give
/// null calendar fields.
pub fn decompose_batch(batch: &RecordBatch) -> Result<RecordBatch> {
    let ts = batch
        .column_by_name("ts")
        .ok_or_else(|| missing("ts"))?
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| missing("ts"))?;
    let start_time = batch
        .column_by_name("start_time")
        .ok_or_else(|| missing("start_time"))?
        .as_any()
        .downcast_ref::<TimestampSecondArray>()
        .ok_or_else(|| missing("start_time"))?;

    let n = batch.num_rows();
    let mut builders: [Int32Builder; 6] = std::array::from_fn(|_| Int32Builder::with_capacity(n));
    for i in 0..n {
        let parts = if start_time.is_null(i) {
            None
        } else {
            DateTime::<Utc>::from_timestamp(start_time.value(i), 0).map(TimeParts::from_datetime)
        };
        match parts {
            Some(p) => {
                let values = [p.hour, p.day, p.week, p.month, p.year, p.weekday];
                for (builder, value) in builders.iter_mut().zip(values) {
                    builder.append_value(value);
                }
            }
            None => builders.iter_mut().for_each(|b| b.append_null()),
        }
    }

    let mut columns: Vec<ArrayRef> = vec![Arc::new(ts.clone()), Arc::new(start_time.clone())];
    columns.extend(builders.iter_mut().map(|b| Arc::new(b.finish()) as ArrayRef));
    Ok(RecordBatch::try_new(time_table_schema(), columns)?)
}

fn missing(column: &str) -> EtlError {
    EtlError::SchemaMismatch {
        table: "time input".to_string(),
        column: column.to_string(),
    }
}

/// Build the time table from frames carrying `ts` and `start_time`.
///
/// Distinct `(ts, start_time)` pairs are decomposed in parallel, one record
/// batch per task, and the result is deduplicated again on the full row.
pub async fn time_table(engine: &Engine, plays: &DataFrame) -> Result<DataFrame> {
    require_columns(plays, "time input", ["ts", "start_time"])?;
    let instants = plays
        .clone()
        .select(vec![ident("ts"), ident("start_time")])?
        .distinct()?;
    let batches = engine.collect(instants).await?;

    let decomposed = batches
        .par_iter()
        .map(decompose_batch)
        .collect::<Result<Vec<_>>>()?;

    Ok(engine.from_batches(time_table_schema(), decomposed)?.distinct()?)
}
