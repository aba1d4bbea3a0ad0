//! Reversible sub-range filtering of the cached rows.
//!
//! The snapshot is taken on the first activation and never refreshed while a
//! window stays active, so clearing restores the data as it was before
//! windowing started even if newer results arrived in between.

use crate::chronology::Chronology;
use crate::dataset::{DataSet, Row, TimeSpec};
use crate::error::{Result, SyncError};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct TimeWindowState {
    active: Option<(f64, f64)>,
    original: Option<(TimeSpec, TimeSpec)>,
    snapshot: Option<Arc<DataSet>>,
}

/// What `deactivate` hands back to restore the pre-window state.
#[derive(Debug, Clone)]
pub struct Restore {
    pub data: Arc<DataSet>,
    pub earliest: TimeSpec,
    pub latest: TimeSpec,
}

impl TimeWindowState {
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn bounds(&self) -> Option<(f64, f64)> {
        self.active
    }

    pub fn snapshot(&self) -> Option<&Arc<DataSet>> {
        self.snapshot.as_ref()
    }

    pub fn original_range(&self) -> Option<(&TimeSpec, &TimeSpec)> {
        self.original.as_ref().map(|(e, l)| (e, l))
    }

    /// Records the window. Returns false when `[min, max)` is already the active window.
    ///
    /// `current` and `range` are only captured on the first activation.
    pub fn activate(
        &mut self,
        min: f64,
        max: f64,
        current: &Arc<DataSet>,
        range: (&TimeSpec, &TimeSpec),
    ) -> Result<bool> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(SyncError::InvalidWindow { min, max });
        }
        if self.active == Some((min, max)) {
            return Ok(false);
        }
        if self.snapshot.is_none() {
            self.snapshot = Some(Arc::clone(current));
            self.original = Some((range.0.clone(), range.1.clone()));
        }
        self.active = Some((min, max));
        Ok(true)
    }

    /// Replace the range that clearing will restore.
    pub fn retarget(&mut self, earliest: TimeSpec, latest: TimeSpec) {
        if self.is_active() {
            self.original = Some((earliest, latest));
        }
    }

    /// Forget the window without restoring the snapshot. Returns the range
    /// clearing would have restored.
    pub fn reset(&mut self) -> Option<(TimeSpec, TimeSpec)> {
        self.active = None;
        self.snapshot = None;
        self.original.take()
    }

    pub fn deactivate(&mut self) -> Option<Restore> {
        self.active.take()?;
        let data = self.snapshot.take()?;
        let (earliest, latest) = self.original.take()?;
        Some(Restore {
            data,
            earliest,
            latest,
        })
    }
}

/// Rows of `data` whose time lies in `[min, max)`. Without a usable time
/// column the rows pass through untouched.
pub fn filter_window(data: &DataSet, time_field: &str, min: f64, max: f64) -> Vec<Row> {
    let rows = data.rows();
    let chrono = data
        .field_index(time_field)
        .and_then(|idx| Chronology::detect(rows, idx).ok());
    match chrono {
        Some(chrono) => {
            let (start, end) = chrono.range_bounds(rows, min, max);
            if start < end {
                rows[start..end].to_vec()
            } else {
                Vec::new()
            }
        }
        None => rows.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::series;

    fn range() -> (TimeSpec, TimeSpec) {
        (TimeSpec::Relative("-4h".into()), TimeSpec::Now)
    }

    #[test]
    fn filters_half_open_range() {
        let data = series(&["_time", "A"], (0..6).map(|i| vec![i as f64 * 60.0, 0.0]).collect());
        let rows = filter_window(&data, "_time", 60.0, 180.0);
        assert_eq!(rows, data.rows()[1..3].to_vec());
        assert!(filter_window(&data, "_time", 1000.0, 2000.0).is_empty());
        assert_eq!(filter_window(&data, "missing", 0.0, 1.0).len(), 6);
    }

    #[test]
    fn snapshot_taken_once() {
        let (earliest, latest) = range();
        let first = Arc::new(series(&["_time"], vec![vec![0.0], vec![60.0]]));
        let second = Arc::new(series(&["_time"], vec![vec![30.0]]));
        let mut state = TimeWindowState::default();

        assert!(state.activate(0.0, 60.0, &first, (&earliest, &latest)).unwrap());
        assert!(!state.activate(0.0, 60.0, &first, (&earliest, &latest)).unwrap());
        let narrowed = (TimeSpec::Absolute(0.0), TimeSpec::Absolute(60.0));
        assert!(state
            .activate(10.0, 50.0, &second, (&narrowed.0, &narrowed.1))
            .unwrap());

        let restore = state.deactivate().unwrap();
        assert!(Arc::ptr_eq(&restore.data, &first));
        assert_eq!(restore.earliest, earliest);
        assert_eq!(restore.latest, latest);
        assert!(!state.is_active());
        assert!(state.snapshot().is_none());
        assert!(state.deactivate().is_none());
    }

    #[test]
    fn rejects_inverted_or_non_finite_bounds() {
        let (earliest, latest) = range();
        let data = Arc::new(DataSet::empty());
        let mut state = TimeWindowState::default();
        assert!(state.activate(5.0, 1.0, &data, (&earliest, &latest)).is_err());
        assert!(state
            .activate(f64::NAN, 1.0, &data, (&earliest, &latest))
            .is_err());
        assert!(!state.is_active());
    }

    #[test]
    fn reset_discards_snapshot() {
        let (earliest, latest) = range();
        let data = Arc::new(series(&["_time"], vec![vec![0.0], vec![60.0]]));
        let mut state = TimeWindowState::default();
        assert!(state.reset().is_none());

        state.activate(0.0, 60.0, &data, (&earliest, &latest)).unwrap();
        assert_eq!(state.reset(), Some((earliest, latest)));
        assert!(!state.is_active());
        assert!(state.snapshot().is_none());
        assert!(state.deactivate().is_none());
    }
}
