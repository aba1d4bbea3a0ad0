//! Splicing a fresh result into the cached rows without duplicating or
//! dropping buckets.

use crate::chronology::{Chronology, Order};
use crate::config::Retention;
use crate::dataset::{row_time, DataSet, Row, Value};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub data: DataSet,
    /// Cached rows kept alongside the fresh ones.
    pub retained: usize,
    pub appended: usize,
    /// The retention cutoff selected none of the older cached rows, so all of
    /// them were kept and the next refresh should re-dispatch in full.
    pub truncated: bool,
}

/// Aligns `fresh` to the cached field order. Extra fresh fields go last.
///
/// Returns the final field list and the permuted fresh rows.
pub fn reconcile_fields(cached: &[String], fresh: DataSet) -> Result<(Vec<String>, Vec<Row>)> {
    if fresh.fields() == cached {
        return Ok(fresh.into_parts());
    }
    let missing: Vec<String> = cached
        .iter()
        .filter(|field| fresh.field_index(field).is_none())
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(SyncError::IncompatibleSchema { missing });
    }

    let mut fields = cached.to_vec();
    fields.extend(
        fresh
            .fields()
            .iter()
            .filter(|field| !cached.contains(field))
            .cloned(),
    );
    let positions: Vec<usize> = fields
        .iter()
        .filter_map(|field| fresh.field_index(field))
        .collect();
    let (_, rows) = fresh.into_parts();
    let rows = rows
        .into_iter()
        .map(|row| positions.iter().map(|&idx| row[idx].clone()).collect())
        .collect();
    Ok((fields, rows))
}

/// Merges `fresh` into `cached`, whose time column sits at `time_index`.
pub fn merge(
    cached: &DataSet,
    fresh: DataSet,
    time_index: usize,
    retention: Retention,
) -> Result<MergeOutcome> {
    let (fields, fresh_rows) = reconcile_fields(cached.fields(), fresh)?;
    let pad = fields.len() - cached.fields().len();
    let widen = |rows: &[Row]| -> Vec<Row> {
        rows.iter()
            .map(|row| {
                let mut row = row.clone();
                row.extend(std::iter::repeat(Value::Null).take(pad));
                row
            })
            .collect()
    };

    let rows = cached.rows();
    if fresh_rows.is_empty() {
        return Ok(MergeOutcome {
            data: DataSet::from_parts(fields, widen(rows)),
            retained: rows.len(),
            appended: 0,
            truncated: false,
        });
    }

    let chrono = Chronology::detect(rows, time_index)?;
    let time = |row: &Row| row_time(row, time_index);
    let fresh_earliest = chrono.earliest_time(&fresh_rows).unwrap_or(f64::NAN);
    let fresh_latest = chrono.latest_time(&fresh_rows).unwrap_or(f64::NAN);
    let cached_earliest = chrono.earliest_time(rows).unwrap_or(f64::NAN);
    let cached_latest = chrono.latest_time(rows).unwrap_or(f64::NAN);

    let fresh_range = (fresh_latest - cached_latest).abs();
    let cutoff = cached_earliest + fresh_range;

    // `older` is the contiguous block of cached rows strictly before the fresh data;
    // `kept` the part of it that is newer than the retention cutoff.
    let (older, kept): (&[Row], Option<&[Row]>) = match chrono.order() {
        Order::Ascending => {
            let cut_new = rows
                .iter()
                .rposition(|row| fresh_earliest > time(row))
                .map_or(0, |idx| idx + 1);
            let cut_old = match retention {
                Retention::Sliding => rows.iter().position(|row| cutoff < time(row)),
                Retention::Unbounded => Some(0),
            };
            let kept = cut_old
                .filter(|&cut_old| cut_old < cut_new)
                .map(|cut_old| &rows[cut_old..cut_new]);
            (&rows[..cut_new], kept)
        }
        Order::Descending => {
            let cut_new = rows
                .iter()
                .position(|row| fresh_earliest > time(row))
                .unwrap_or(rows.len());
            let cut_old = match retention {
                Retention::Sliding => rows
                    .iter()
                    .rposition(|row| cutoff < time(row))
                    .map(|idx| idx + 1),
                Retention::Unbounded => Some(rows.len()),
            };
            let kept = cut_old
                .filter(|&cut_old| cut_new < cut_old)
                .map(|cut_old| &rows[cut_new..cut_old]);
            (&rows[cut_new..], kept)
        }
    };

    // No older row passed the cutoff: keep them all and force a full redispatch.
    let truncated = !older.is_empty() && kept.is_none();
    let kept = widen(kept.unwrap_or(older));
    let retained = kept.len();
    let appended = fresh_rows.len();
    let merged = match chrono.order() {
        Order::Ascending => kept.into_iter().chain(fresh_rows).collect(),
        Order::Descending => fresh_rows.into_iter().chain(kept).collect(),
    };
    Ok(MergeOutcome {
        data: DataSet::from_parts(fields, merged),
        retained,
        appended,
        truncated,
    })
}
