//! Seam between the data manager and whatever actually runs queries.

use crate::dataset::{DataSet, TimeSpec};
use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generation number of a dispatched fetch. Only the most recent one is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FetchId(pub u64);

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchKind {
    /// Triggered by configuration (`start`, `set_query`, `set_range`, windowing).
    Dispatch,
    /// Scheduled re-dispatch of the whole configured range.
    FullRefresh,
    /// Scheduled incremental fetch of a recent lookback period.
    TailRefresh,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRequest {
    pub id: FetchId,
    pub kind: FetchKind,
    pub query: String,
    pub earliest: TimeSpec,
    pub latest: TimeSpec,
    pub streaming: bool,
    /// Seconds the backend may serve a cached result; `None` forces a fresh run.
    pub cache_secs: Option<u64>,
}

/// Job status carried by progress and done notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    #[serde(default)]
    pub is_done: bool,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub result_count: Option<u64>,
    #[serde(default)]
    pub messages: Vec<String>,
}

/// Callback surface of one fetch. `Data` may arrive several times before
/// `Done` as progressively refined previews.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    Start,
    Progress(JobMeta),
    Data(DataSet),
    Error(String),
    Fail(String),
    Cancel,
    Done(JobMeta),
}

pub trait QueryExecutor {
    /// Begin running `request`. Results come back tagged with `request.id`.
    fn execute(&mut self, request: &QueryRequest) -> Result<(), SyncError>;

    /// Best-effort cancellation of a superseded fetch.
    fn cancel(&mut self, id: FetchId);

    /// Next queued callback, for executors that are pumped by the host loop.
    fn poll_event(&mut self) -> Option<(FetchId, ExecutorEvent)> {
        None
    }
}
