use crate::dataset::{row_time, Row};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Order {
    Ascending,
    Descending,
}

/// Time ordering of a row set, derived from its first and last rows.
///
/// This is an O(1) heuristic: it trusts the cache to have been produced in a
/// consistent order by prior merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chronology {
    order: Order,
    time_index: usize,
}

impl Chronology {
    pub fn detect(rows: &[Row], time_index: usize) -> Result<Self> {
        let invalid = || SyncError::InvalidChronologyInput {
            rows: rows.len(),
            time_index,
        };
        let (first, last) = match (rows.first(), rows.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(invalid()),
        };
        if time_index >= first.len() {
            return Err(invalid());
        }
        let order = if row_time(first, time_index) > row_time(last, time_index) {
            Order::Descending
        } else {
            Order::Ascending
        };
        Ok(Self { order, time_index })
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn time_index(&self) -> usize {
        self.time_index
    }

    pub fn earliest<'a>(&self, rows: &'a [Row]) -> Option<&'a Row> {
        match self.order {
            Order::Ascending => rows.first(),
            Order::Descending => rows.last(),
        }
    }

    pub fn latest<'a>(&self, rows: &'a [Row]) -> Option<&'a Row> {
        match self.order {
            Order::Ascending => rows.last(),
            Order::Descending => rows.first(),
        }
    }

    pub fn earliest_time(&self, rows: &[Row]) -> Option<f64> {
        self.earliest(rows).map(|row| row_time(row, self.time_index))
    }

    pub fn latest_time(&self, rows: &[Row]) -> Option<f64> {
        self.latest(rows).map(|row| row_time(row, self.time_index))
    }

    /// Index range `[start, end)` of rows whose time lies in `[min, max)`.
    /// Rows are assumed sorted in this chronology's order.
    pub fn range_bounds(&self, rows: &[Row], min: f64, max: f64) -> (usize, usize) {
        let t = |row: &Row| row_time(row, self.time_index);
        match self.order {
            Order::Ascending => (
                rows.partition_point(|row| t(row) < min),
                rows.partition_point(|row| t(row) < max),
            ),
            Order::Descending => (
                rows.partition_point(|row| t(row) >= max),
                rows.partition_point(|row| t(row) >= min),
            ),
        }
    }

    pub fn is_monotonic(&self, rows: &[Row]) -> bool {
        rows.windows(2).all(|pair| {
            let (a, b) = (
                row_time(&pair[0], self.time_index),
                row_time(&pair[1], self.time_index),
            );
            match self.order {
                Order::Ascending => a <= b,
                Order::Descending => a >= b,
            }
        })
    }
}
