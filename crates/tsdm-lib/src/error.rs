use thiserror::Error;

/// Errors raised by the synchronization engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// `keep_updated` was requested with a latest bound other than `now`.
    #[error("keep_updated requires latest time to be now (got {latest})")]
    InvalidStreamingConfig { latest: String },
    #[error("cannot determine chronological order of {rows} row(s) with time index {time_index}")]
    InvalidChronologyInput { rows: usize, time_index: usize },
    /// The fresh result lacks fields the cache depends on.
    #[error("fresh data is missing cached fields: {}", missing.join(", "))]
    IncompatibleSchema { missing: Vec<String> },
    #[error("data manager {id} used after teardown")]
    UseAfterTeardown { id: String },
    #[error("invalid time window [{min}, {max})")]
    InvalidWindow { min: f64, max: f64 },
    #[error("row {row} has {found} value(s), expected {expected}")]
    MalformedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("duplicate field {0}")]
    DuplicateField(String),
    #[error("invalid time spec {0:?}")]
    InvalidTimeSpec(String),
    #[error("min_update_interval must be a finite, non-negative number of seconds (got {0})")]
    InvalidUpdateInterval(f64),
    #[error("data manager {0} is already registered")]
    DuplicateManager(String),
    #[error("stale or unknown data manager handle")]
    StaleHandle,
    #[error("query executor rejected fetch: {0}")]
    Executor(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
