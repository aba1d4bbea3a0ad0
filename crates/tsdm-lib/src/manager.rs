//! The data manager: owns the cached result set for one query and keeps it in
//! sync with a [`QueryExecutor`].
//!
//! Everything here runs on the caller's thread. The host feeds executor
//! callbacks through [`DataManager::handle_event`] (or pumps them with
//! [`DataManager::run_until_idle`]) and fires refreshes with
//! [`DataManager::poll_timers`] / [`DataManager::on_timer`]. Each dispatched
//! fetch gets a fresh [`FetchId`]; callbacks for any other id are dropped.

use crate::clock::{Clock, SystemClock};
use crate::config::{validate_streaming, validate_update_interval, ManagerConfig};
use crate::dataset::{DataSet, Row, TimeSpec};
use crate::error::{Result, SyncError};
use crate::events::{EventBus, EventKind, ManagerEvent, Subscription};
use crate::executor::{ExecutorEvent, FetchId, FetchKind, QueryExecutor, QueryRequest};
use crate::merge::merge;
use crate::scheduler::{
    FetchTiming, RefreshMode, RefreshPlan, RefreshScheduler, TimerSlot, TimerToken,
};
use crate::window::{filter_window, TimeWindowState};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Fetching,
    Merging,
    /// Last fetch failed; behaves like `Idle` until the next dispatch.
    Failed,
    /// Last fetch was cancelled; behaves like `Idle` until the next dispatch.
    Cancelled,
}

/// How a result was folded into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Full,
    Partial,
    /// The result belonged to a superseded fetch and was dropped.
    Stale,
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Error,
    Fail,
    Cancel,
}

pub struct DataManager<E, C = SystemClock> {
    config: ManagerConfig,
    executor: E,
    clock: C,
    data: Arc<DataSet>,
    /// Cache as it was when the in-flight fetch delivered its first result.
    merge_base: Option<(FetchId, Arc<DataSet>)>,
    window: TimeWindowState,
    scheduler: RefreshScheduler,
    timer: TimerSlot,
    timing: FetchTiming,
    events: EventBus,
    state: ManagerState,
    generation: u64,
    in_flight: Option<FetchId>,
    last_plan: Option<RefreshPlan>,
    force_full: bool,
    started: bool,
    torn_down: bool,
}

impl<E, C> fmt::Debug for DataManager<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataManager")
            .field("id", &self.config.id)
            .field("state", &self.state)
            .field("rows", &self.data.len())
            .field("in_flight", &self.in_flight)
            .field("window", &self.window.bounds())
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

impl<E: QueryExecutor> DataManager<E, SystemClock> {
    pub fn new(config: ManagerConfig, executor: E) -> Result<Self> {
        Self::with_clock(config, executor, SystemClock)
    }
}

impl<E: QueryExecutor, C: Clock> DataManager<E, C> {
    pub fn with_clock(config: ManagerConfig, executor: E, clock: C) -> Result<Self> {
        config.validate()?;
        let scheduler = RefreshScheduler::new(config.time_field.clone(), config.span_field.clone());
        Ok(Self {
            config,
            executor,
            clock,
            data: Arc::new(DataSet::empty()),
            merge_base: None,
            window: TimeWindowState::default(),
            scheduler,
            timer: TimerSlot::default(),
            timing: FetchTiming::default(),
            events: EventBus::default(),
            state: ManagerState::Idle,
            generation: 0,
            in_flight: None,
            last_plan: None,
            force_full: false,
            started: false,
            torn_down: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn fields(&self) -> &[String] {
        self.data.fields()
    }

    pub fn rows(&self) -> &[Row] {
        self.data.rows()
    }

    pub fn snapshot(&self) -> Arc<DataSet> {
        Arc::clone(&self.data)
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn window(&self) -> &TimeWindowState {
        &self.window
    }

    pub fn in_flight(&self) -> Option<FetchId> {
        self.in_flight
    }

    pub fn last_plan(&self) -> Option<&RefreshPlan> {
        self.last_plan.as_ref()
    }

    pub fn next_refresh(&self) -> Option<(TimerToken, Instant)> {
        self.timer.pending()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    pub fn subscribe(
        &mut self,
        kind: EventKind,
        handler: impl FnMut(&ManagerEvent) + 'static,
    ) -> Result<Subscription> {
        self.ensure_live()?;
        Ok(self.events.subscribe(kind, handler))
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        self.events.unsubscribe(subscription)
    }

    pub fn last_search_event(&self) -> Option<EventKind> {
        self.events.last_search_event()
    }

    pub fn replay_last_search_event(&mut self) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.events.replay_last_search_event())
    }

    /// Configure the query and issue the first fetch.
    pub fn start(
        &mut self,
        query: impl Into<String>,
        earliest: TimeSpec,
        latest: TimeSpec,
        keep_updated: bool,
    ) -> Result<FetchId> {
        self.ensure_live()?;
        validate_streaming(keep_updated, &latest)?;
        let query = query.into();
        let windowed = self.window.reset().is_some();
        if windowed || query != self.config.search {
            self.clear_data();
        }
        self.config.search = query;
        self.config.earliest = earliest;
        self.config.latest = latest;
        self.config.keep_updated = keep_updated;
        self.started = true;
        Ok(self.dispatch_configured())
    }

    /// Change the query text. A new query drops the cached rows and any active
    /// window before re-fetching over the unwindowed range.
    pub fn set_query(&mut self, query: impl Into<String>) -> Result<Option<FetchId>> {
        self.ensure_live()?;
        let query = query.into();
        if query == self.config.search {
            return Ok(None);
        }
        self.config.search = query;
        if let Some((earliest, latest)) = self.window.reset() {
            debug!("{}: new query discards the window", self.config.id);
            self.config.earliest = earliest;
            self.config.latest = latest;
        }
        self.clear_data();
        Ok(self.started.then(|| self.dispatch_configured()))
    }

    /// Change the time range. While windowed, this only changes the range that
    /// [`clear_window`](Self::clear_window) restores.
    pub fn set_range(&mut self, earliest: TimeSpec, latest: TimeSpec) -> Result<Option<FetchId>> {
        self.ensure_live()?;
        validate_streaming(self.config.keep_updated, &latest)?;
        if self.window.is_active() {
            self.window.retarget(earliest, latest);
            return Ok(None);
        }
        if earliest == self.config.earliest && latest == self.config.latest {
            return Ok(None);
        }
        self.config.earliest = earliest;
        self.config.latest = latest;
        Ok(self.started.then(|| self.dispatch_configured()))
    }

    pub fn set_keep_updated(&mut self, keep_updated: bool) -> Result<()> {
        self.ensure_live()?;
        let latest = self
            .window
            .original_range()
            .map(|(_, latest)| latest)
            .unwrap_or(&self.config.latest);
        validate_streaming(keep_updated, latest)?;
        self.config.keep_updated = keep_updated;
        if !self.streaming() {
            self.cancel_refresh();
        } else if !self.data.is_empty() && self.in_flight.is_none() {
            self.schedule_next();
        }
        Ok(())
    }

    pub fn set_min_update_interval(&mut self, secs: f64) -> Result<()> {
        self.ensure_live()?;
        validate_update_interval(secs)?;
        self.config.min_update_interval = secs;
        Ok(())
    }

    /// Narrow the visible rows to `[min, max)` and re-query that range.
    pub fn apply_window(&mut self, min: f64, max: f64) -> Result<()> {
        self.ensure_live()?;
        let range = (&self.config.earliest, &self.config.latest);
        if !self.window.activate(min, max, &self.data, range)? {
            return Ok(());
        }
        debug!("{}: windowing to [{}, {})", self.config.id, min, max);
        let rows = filter_window(&self.data, &self.config.time_field, min, max);
        self.replace_data(DataSet::from_parts(self.data.fields().to_vec(), rows));
        self.config.earliest = TimeSpec::Absolute(min);
        self.config.latest = TimeSpec::Absolute(max);
        self.cancel_refresh();
        if self.started {
            self.dispatch_configured();
        }
        Ok(())
    }

    /// Restore the rows and range captured when windowing began.
    pub fn clear_window(&mut self) -> Result<()> {
        self.ensure_live()?;
        let Some(restore) = self.window.deactivate() else {
            return Ok(());
        };
        debug!("{}: clearing window", self.config.id);
        self.config.earliest = restore.earliest;
        self.config.latest = restore.latest;
        self.data = restore.data;
        self.events
            .emit(ManagerEvent::DataChanged(Arc::clone(&self.data)));
        if self.started {
            self.dispatch_configured();
        }
        Ok(())
    }

    /// Cancel pending work. Every later mutating call fails with `UseAfterTeardown`.
    pub fn teardown(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.cancel_refresh();
        if let Some(id) = self.in_flight.take() {
            self.executor.cancel(id);
        }
        self.merge_base = None;
        self.events.clear();
        self.torn_down = true;
        self.state = ManagerState::Idle;
        debug!("{}: torn down", self.config.id);
        Ok(())
    }

    /// Route one executor callback. Callbacks for superseded fetches are ignored.
    pub fn handle_event(&mut self, fetch: FetchId, event: ExecutorEvent) -> Result<()> {
        if !self.is_current(fetch) {
            debug!("{}: dropping {:?} for stale {}", self.config.id, event, fetch);
            return Ok(());
        }
        match event {
            ExecutorEvent::Start => {
                self.timing.started_at = Some(self.clock.now());
                self.state = ManagerState::Fetching;
                self.events.emit(ManagerEvent::SearchStart);
            }
            ExecutorEvent::Progress(meta) => self.events.emit(ManagerEvent::SearchProgress(meta)),
            ExecutorEvent::Data(fresh) => match self.on_result(fetch, fresh) {
                // Already surfaced as a SchemaError event.
                Err(SyncError::IncompatibleSchema { .. }) => {}
                other => {
                    other?;
                }
            },
            ExecutorEvent::Error(message) => self.on_failure(Failure::Error, message),
            ExecutorEvent::Fail(message) => self.on_failure(Failure::Fail, message),
            ExecutorEvent::Cancel => self.on_failure(Failure::Cancel, String::new()),
            ExecutorEvent::Done(meta) => {
                self.in_flight = None;
                self.merge_base = None;
                if self.state == ManagerState::Fetching {
                    self.state = ManagerState::Idle;
                }
                self.events.emit(ManagerEvent::SearchDone(meta));
            }
        }
        Ok(())
    }

    /// Fold a result into the cache: replace it wholesale, or merge when
    /// streaming into a cache with a time field.
    ///
    /// Repeated results for one fetch are previews of the same data and are
    /// each merged into the cache as it stood before that fetch.
    pub fn on_result(&mut self, fetch: FetchId, fresh: DataSet) -> Result<UpdateKind> {
        if !self.is_current(fetch) {
            debug!("{}: dropping result of stale {}", self.config.id, fetch);
            return Ok(UpdateKind::Stale);
        }
        self.timing.finished_at = Some(self.clock.now());
        self.state = ManagerState::Merging;

        let base = match self.merge_base.take() {
            Some((id, base)) if id == fetch => base,
            _ => Arc::clone(&self.data),
        };
        self.merge_base = Some((fetch, Arc::clone(&base)));
        let streaming = self.streaming();
        let time_idx = base.field_index(&self.config.time_field);
        let kind = match time_idx {
            Some(time_idx) if streaming && !base.is_empty() => {
                match merge(&base, fresh.clone(), time_idx, self.config.retention) {
                    Ok(outcome) => {
                        if outcome.truncated {
                            warn!(
                                "{}: cutoff kept no history, keeping older rows",
                                self.config.id
                            );
                            self.force_full = true;
                        }
                        self.replace_data(outcome.data);
                        UpdateKind::Partial
                    }
                    Err(SyncError::IncompatibleSchema { missing }) => {
                        warn!(
                            "{}: fresh fields do not cover cached fields {:?} (search is {})",
                            self.config.id, missing, self.config.search
                        );
                        self.state = ManagerState::Idle;
                        self.events.emit(ManagerEvent::SchemaError {
                            missing: missing.clone(),
                        });
                        self.schedule_next();
                        return Err(SyncError::IncompatibleSchema { missing });
                    }
                    Err(err) => {
                        debug!("{}: cannot merge ({}), replacing", self.config.id, err);
                        self.replace_data(fresh);
                        UpdateKind::Full
                    }
                }
            }
            _ => {
                self.replace_data(fresh);
                UpdateKind::Full
            }
        };

        self.state = ManagerState::Idle;
        match kind {
            UpdateKind::Partial => {
                info!("{}: partial update complete ({} rows)", self.config.id, self.data.len());
                self.events.emit(ManagerEvent::PartialUpdateComplete);
            }
            _ => {
                info!("{}: full refresh complete ({} rows)", self.config.id, self.data.len());
                self.events.emit(ManagerEvent::FullRefreshComplete);
            }
        }
        if streaming {
            self.schedule_next();
        }
        Ok(kind)
    }

    /// Fire the pending refresh if its deadline has passed.
    pub fn poll_timers(&mut self) -> Result<Option<FetchId>> {
        self.ensure_live()?;
        match self.timer.take_due(self.clock.now()) {
            Some(plan) => Ok(self.run_plan(plan)),
            None => Ok(None),
        }
    }

    /// Fire the refresh armed under `token`; stale tokens do nothing.
    pub fn on_timer(&mut self, token: TimerToken) -> Result<Option<FetchId>> {
        self.ensure_live()?;
        match self.timer.fire(token) {
            Some(plan) => Ok(self.run_plan(plan)),
            None => Ok(None),
        }
    }

    /// Deliver every queued executor callback. Returns how many were handled.
    pub fn run_until_idle(&mut self) -> Result<usize> {
        self.ensure_live()?;
        let mut handled = 0;
        while let Some((fetch, event)) = self.executor.poll_event() {
            handled += 1;
            self.handle_event(fetch, event)?;
        }
        Ok(handled)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.torn_down {
            return Err(SyncError::UseAfterTeardown {
                id: self.config.id.clone(),
            });
        }
        Ok(())
    }

    fn is_current(&self, fetch: FetchId) -> bool {
        !self.torn_down && self.in_flight == Some(fetch)
    }

    /// Streaming is suspended while a window is active.
    fn streaming(&self) -> bool {
        self.config.keep_updated && !self.window.is_active()
    }

    fn replace_data(&mut self, data: DataSet) {
        self.data = Arc::new(data);
        self.events
            .emit(ManagerEvent::DataChanged(Arc::clone(&self.data)));
    }

    fn clear_data(&mut self) {
        if !self.data.is_empty() || !self.data.fields().is_empty() {
            self.replace_data(DataSet::empty());
        }
    }

    fn cancel_refresh(&mut self) {
        if let Some(token) = self.timer.cancel() {
            debug!("{}: cancelled refresh {:?}", self.config.id, token);
        }
    }

    fn schedule_next(&mut self) {
        let mut plan = self.scheduler.plan(
            &self.data,
            &self.timing,
            self.config.min_update_interval,
        );
        if self.force_full && plan.mode == RefreshMode::PartialTailFetch {
            plan = plan.into_full();
        }
        self.force_full = false;
        let now = self.clock.now();
        let due = now.checked_add(plan.delay).unwrap_or(now);
        debug!(
            "{}: next refresh {:?} in {:?} (span {}s, lookback {:?})",
            self.config.id, plan.mode, plan.delay, plan.span, plan.lookback
        );
        self.timer.arm(due, plan.clone());
        self.last_plan = Some(plan);
    }

    fn run_plan(&mut self, plan: RefreshPlan) -> Option<FetchId> {
        let (kind, earliest, latest, cache) = match plan.mode {
            RefreshMode::Idle => return None,
            RefreshMode::FullRedispatch => (
                FetchKind::FullRefresh,
                self.config.earliest.clone(),
                self.config.latest.clone(),
                self.config.result_cache_secs,
            ),
            RefreshMode::PartialTailFetch => {
                let lookback = plan.lookback.clone().unwrap_or_default();
                let earliest = match lookback.parse() {
                    Ok(spec) => spec,
                    Err(_) => self.config.earliest.clone(),
                };
                (FetchKind::TailRefresh, earliest, TimeSpec::Now, None)
            }
        };
        self.events
            .emit(ManagerEvent::RefreshStart { mode: plan.mode });
        Some(self.dispatch(kind, earliest, latest, cache))
    }

    fn dispatch_configured(&mut self) -> FetchId {
        self.dispatch(
            FetchKind::Dispatch,
            self.config.earliest.clone(),
            self.config.latest.clone(),
            self.config.result_cache_secs,
        )
    }

    fn dispatch(
        &mut self,
        kind: FetchKind,
        earliest: TimeSpec,
        latest: TimeSpec,
        cache_secs: Option<u64>,
    ) -> FetchId {
        self.cancel_refresh();
        if let Some(previous) = self.in_flight.take() {
            debug!("{}: superseding {}", self.config.id, previous);
            self.executor.cancel(previous);
        }
        self.generation += 1;
        let id = FetchId(self.generation);
        self.in_flight = Some(id);
        self.merge_base = None;
        self.timing = FetchTiming::begin(self.clock.now());
        self.state = ManagerState::Fetching;
        let request = QueryRequest {
            id,
            kind,
            query: self.config.search.clone(),
            earliest,
            latest,
            streaming: self.streaming(),
            cache_secs,
        };
        debug!(
            "{}: dispatching {} {:?} [{}, {}]",
            self.config.id, id, kind, request.earliest, request.latest
        );
        if let Err(err) = self.executor.execute(&request) {
            warn!("{}: {}", self.config.id, err);
            self.on_failure(Failure::Fail, err.to_string());
        }
        id
    }

    fn on_failure(&mut self, failure: Failure, message: String) {
        self.in_flight = None;
        self.merge_base = None;
        let keep_cache = matches!(failure, Failure::Cancel) && self.config.keep_updated;
        if !keep_cache {
            self.clear_data();
        }
        let (state, event) = match failure {
            Failure::Error => (ManagerState::Failed, ManagerEvent::SearchError(message)),
            Failure::Fail => (ManagerState::Failed, ManagerEvent::SearchFail(message)),
            Failure::Cancel => (ManagerState::Cancelled, ManagerEvent::SearchCancel),
        };
        debug!("{}: {:?}", self.config.id, event.kind());
        self.state = state;
        self.events.emit(event);
        if self.streaming() {
            self.schedule_next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dataset::{series, Value};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        requests: Vec<QueryRequest>,
        cancelled: Vec<FetchId>,
        reject: bool,
    }

    impl QueryExecutor for Recorder {
        fn execute(&mut self, request: &QueryRequest) -> Result<()> {
            if self.reject {
                return Err(SyncError::Executor("offline".into()));
            }
            self.requests.push(request.clone());
            Ok(())
        }

        fn cancel(&mut self, id: FetchId) {
            self.cancelled.push(id);
        }
    }

    fn manager() -> (DataManager<Recorder, ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let config = ManagerConfig {
            id: "cpu".into(),
            ..ManagerConfig::default()
        };
        let manager = DataManager::with_clock(config, Recorder::default(), clock.clone()).unwrap();
        (manager, clock)
    }

    fn every(span: f64, from: u32, to: u32) -> DataSet {
        series(
            &["_time", "A", "B"],
            (from..=to).map(|i| vec![i as f64 * span, i as f64, 0.0]).collect(),
        )
    }

    fn record(manager: &mut DataManager<Recorder, ManualClock>) -> Rc<RefCell<Vec<EventKind>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        for kind in [
            EventKind::DataChanged,
            EventKind::FullRefreshComplete,
            EventKind::PartialUpdateComplete,
            EventKind::SchemaError,
            EventKind::SearchCancel,
            EventKind::SearchFail,
        ] {
            let sink = seen.clone();
            manager
                .subscribe(kind, move |event| sink.borrow_mut().push(event.kind()))
                .unwrap();
        }
        seen
    }

    #[test]
    fn streaming_requires_latest_now() {
        let (mut manager, _) = manager();
        let err = manager
            .start(
                "search",
                TimeSpec::Relative("-1h".into()),
                TimeSpec::Relative("-5m".into()),
                true,
            )
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::InvalidStreamingConfig {
                latest: "-5m".into()
            }
        );
        assert!(manager.executor().requests.is_empty());
    }

    #[test]
    fn one_shot_results_replace_the_cache() {
        let (mut manager, _) = manager();
        let seen = record(&mut manager);
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, false)
            .unwrap();
        assert_eq!(manager.state(), ManagerState::Fetching);
        manager.handle_event(id, ExecutorEvent::Data(every(60.0, 0, 3))).unwrap();
        manager.handle_event(id, ExecutorEvent::Data(every(60.0, 0, 5))).unwrap();
        assert_eq!(manager.rows().len(), 6);
        assert_eq!(manager.state(), ManagerState::Idle);
        assert!(manager.next_refresh().is_none());
        assert_eq!(
            *seen.borrow(),
            vec![
                EventKind::DataChanged,
                EventKind::FullRefreshComplete,
                EventKind::DataChanged,
                EventKind::FullRefreshComplete
            ]
        );
    }

    #[test]
    fn streaming_merges_and_arms_refresh() {
        let (mut manager, clock) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, true)
            .unwrap();
        manager.handle_event(id, ExecutorEvent::Start).unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(
            manager.on_result(id, every(60.0, 0, 59)).unwrap(),
            UpdateKind::Full
        );
        let plan = manager.last_plan().unwrap().clone();
        assert_eq!(plan.mode, RefreshMode::PartialTailFetch);
        assert_eq!(plan.lookback.as_deref(), Some("-1260s"));
        assert_eq!(plan.delay, Duration::from_secs(58));

        clock.advance(Duration::from_secs(57));
        assert_eq!(manager.poll_timers().unwrap(), None);
        clock.advance(Duration::from_secs(1));
        let tail = manager.poll_timers().unwrap().unwrap();
        let request = manager.executor().requests.last().unwrap().clone();
        assert_eq!(request.kind, FetchKind::TailRefresh);
        assert_eq!(request.earliest, TimeSpec::Relative("-1260s".into()));
        assert_eq!(request.latest, TimeSpec::Now);
        assert_eq!(request.cache_secs, None);
        assert!(request.streaming);

        let kind = manager.on_result(tail, every(60.0, 39, 60)).unwrap();
        assert_eq!(kind, UpdateKind::Partial);
        let times = manager.snapshot().column_times(0);
        assert_eq!(times.last(), Some(&3600.0));
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert!(manager.next_refresh().is_some());
    }

    #[test]
    fn stale_results_are_dropped() {
        let (mut manager, _) = manager();
        let first = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, false)
            .unwrap();
        let second = manager.set_query("other search").unwrap().unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.executor().cancelled, vec![first]);
        assert_eq!(
            manager.on_result(first, every(60.0, 0, 3)).unwrap(),
            UpdateKind::Stale
        );
        manager.handle_event(first, ExecutorEvent::Cancel).unwrap();
        assert!(manager.rows().is_empty());
        assert_eq!(manager.state(), ManagerState::Fetching);
        manager.handle_event(second, ExecutorEvent::Data(every(60.0, 0, 1))).unwrap();
        assert_eq!(manager.rows().len(), 2);
    }

    #[test]
    fn new_query_clears_cache() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, false)
            .unwrap();
        manager.on_result(id, every(60.0, 0, 3)).unwrap();
        assert_eq!(manager.set_query("search").unwrap(), None);
        assert_eq!(manager.rows().len(), 4);
        manager.set_query("other").unwrap();
        assert!(manager.rows().is_empty());
        assert!(manager.fields().is_empty());
    }

    #[test]
    fn schema_mismatch_keeps_cache() {
        let (mut manager, _) = manager();
        let seen = record(&mut manager);
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, true)
            .unwrap();
        manager.on_result(id, every(60.0, 0, 3)).unwrap();
        let before = manager.snapshot();
        let token = manager.next_refresh().unwrap().0;
        let refresh = manager.on_timer(token).unwrap().unwrap();
        seen.borrow_mut().clear();

        let fresh = series(&["_time", "A"], vec![vec![240.0, 4.0]]);
        let err = manager.on_result(refresh, fresh).unwrap_err();
        assert_eq!(
            err,
            SyncError::IncompatibleSchema {
                missing: vec!["B".into()]
            }
        );
        assert_eq!(*manager.snapshot(), *before);
        assert_eq!(*seen.borrow(), vec![EventKind::SchemaError]);
        assert!(manager.next_refresh().is_some());
    }

    #[test]
    fn window_round_trip_restores_rows() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, true)
            .unwrap();
        manager.on_result(id, every(60.0, 0, 59)).unwrap();
        let before = manager.snapshot();

        manager.apply_window(600.0, 1200.0).unwrap();
        assert_eq!(manager.rows().len(), 10);
        assert_eq!(manager.config().earliest, TimeSpec::Absolute(600.0));
        assert_eq!(manager.config().latest, TimeSpec::Absolute(1200.0));
        assert!(manager.next_refresh().is_none());
        let windowed = manager.executor().requests.last().unwrap().clone();
        assert!(!windowed.streaming);

        // Finer-grained data for the window replaces the visible rows.
        manager
            .on_result(windowed.id, every(10.0, 60, 119))
            .unwrap();
        assert_eq!(manager.rows().len(), 60);
        assert!(manager.next_refresh().is_none());

        manager.apply_window(700.0, 800.0).unwrap();
        assert_eq!(manager.rows().len(), 10);

        manager.clear_window().unwrap();
        assert_eq!(*manager.snapshot(), *before);
        assert_eq!(manager.config().earliest, TimeSpec::Relative("-1h".into()));
        assert_eq!(manager.config().latest, TimeSpec::Now);
        assert!(manager.executor().requests.last().unwrap().streaming);
        manager.clear_window().unwrap();
    }

    #[test]
    fn window_on_unstarted_manager_only_filters() {
        let (mut manager, _) = manager();
        manager.apply_window(0.0, 10.0).unwrap();
        assert!(manager.executor().requests.is_empty());
        assert!(manager.apply_window(10.0, 0.0).is_err());
        manager.clear_window().unwrap();
        assert!(manager.executor().requests.is_empty());
    }

    #[test]
    fn failures_clear_cache_but_streaming_cancel_keeps_it() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, true)
            .unwrap();
        manager.on_result(id, every(60.0, 0, 59)).unwrap();
        let token = manager.next_refresh().unwrap().0;
        let tail = manager.on_timer(token).unwrap().unwrap();
        manager.handle_event(tail, ExecutorEvent::Cancel).unwrap();
        assert_eq!(manager.rows().len(), 60);
        assert_eq!(manager.state(), ManagerState::Cancelled);

        let token = manager.next_refresh().unwrap().0;
        let again = manager.on_timer(token).unwrap().unwrap();
        manager
            .handle_event(again, ExecutorEvent::Fail("job expired".into()))
            .unwrap();
        assert!(manager.rows().is_empty());
        assert_eq!(manager.state(), ManagerState::Failed);
        let plan = manager.last_plan().unwrap();
        assert_eq!(plan.mode, RefreshMode::FullRedispatch);
        assert_eq!(plan.delay, Duration::from_secs(900));
    }

    #[test]
    fn one_shot_cancel_clears_cache() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, false)
            .unwrap();
        manager.on_result(id, every(60.0, 0, 3)).unwrap();
        let id = manager
            .set_range(TimeSpec::Relative("-2h".into()), TimeSpec::Now)
            .unwrap()
            .unwrap();
        manager.handle_event(id, ExecutorEvent::Cancel).unwrap();
        assert!(manager.rows().is_empty());
        assert!(manager.next_refresh().is_none());
    }

    #[test]
    fn rejected_dispatch_surfaces_as_fail() {
        let clock = ManualClock::new();
        let executor = Recorder {
            reject: true,
            ..Recorder::default()
        };
        let mut manager =
            DataManager::with_clock(ManagerConfig::default(), executor, clock).unwrap();
        let seen = record(&mut manager);
        manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, false)
            .unwrap();
        assert_eq!(manager.state(), ManagerState::Failed);
        assert_eq!(manager.in_flight(), None);
        assert_eq!(*seen.borrow(), vec![EventKind::SearchFail]);
    }

    #[test]
    fn teardown_is_final() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, true)
            .unwrap();
        manager.teardown().unwrap();
        assert_eq!(manager.executor().cancelled, vec![id]);
        assert!(manager.next_refresh().is_none());
        assert_eq!(
            manager.on_result(id, every(60.0, 0, 3)).unwrap(),
            UpdateKind::Stale
        );
        let err = manager.set_query("x").unwrap_err();
        assert_eq!(err, SyncError::UseAfterTeardown { id: "cpu".into() });
        assert!(manager.apply_window(0.0, 1.0).is_err());
        assert!(manager.teardown().is_err());
        assert!(manager
            .subscribe(EventKind::DataChanged, |_| {})
            .is_err());
    }

    #[test]
    fn keep_updated_toggle_arms_and_cancels() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, false)
            .unwrap();
        manager.on_result(id, every(60.0, 0, 59)).unwrap();
        manager.handle_event(id, ExecutorEvent::Done(Default::default())).unwrap();
        assert!(manager.next_refresh().is_none());
        manager.set_keep_updated(true).unwrap();
        assert!(manager.next_refresh().is_some());
        manager.set_keep_updated(false).unwrap();
        assert!(manager.next_refresh().is_none());

        manager
            .set_range(TimeSpec::Relative("-1h".into()), TimeSpec::Relative("-1m".into()))
            .unwrap();
        assert!(manager.set_keep_updated(true).is_err());
        assert!(manager.set_min_update_interval(f64::NAN).is_err());
    }

    #[test]
    fn set_range_while_windowed_retargets_restore() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, false)
            .unwrap();
        manager.on_result(id, every(60.0, 0, 59)).unwrap();
        manager.apply_window(0.0, 600.0).unwrap();
        let sent = manager.executor().requests.len();
        assert_eq!(
            manager
                .set_range(TimeSpec::Relative("-2h".into()), TimeSpec::Now)
                .unwrap(),
            None
        );
        assert_eq!(manager.executor().requests.len(), sent);
        manager.clear_window().unwrap();
        assert_eq!(manager.config().earliest, TimeSpec::Relative("-2h".into()));
    }

    #[test]
    fn search_status_is_replayed() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, false)
            .unwrap();
        manager.handle_event(id, ExecutorEvent::Start).unwrap();
        assert_eq!(manager.last_search_event(), Some(EventKind::SearchStart));
        let count = Rc::new(RefCell::new(0));
        let sink = count.clone();
        manager
            .subscribe(EventKind::SearchStart, move |_| *sink.borrow_mut() += 1)
            .unwrap();
        assert!(manager.replay_last_search_event().unwrap());
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn text_times_are_merged_numerically() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, true)
            .unwrap();
        let text = |t: &str| vec![Value::from(t), Value::Number(1.0)];
        let cached = DataSet::new(
            vec!["_time".into(), "A".into()],
            vec![text("0.000"), text("60.000"), text("120.000")],
        )
        .unwrap();
        manager.on_result(id, cached).unwrap();
        let token = manager.next_refresh().unwrap().0;
        let refresh = manager.on_timer(token).unwrap().unwrap();
        let fresh = DataSet::new(
            vec!["_time".into(), "A".into()],
            vec![text("120.000"), text("180.000")],
        )
        .unwrap();
        assert_eq!(manager.on_result(refresh, fresh).unwrap(), UpdateKind::Partial);
        let times = manager.snapshot().column_times(0);
        assert_eq!(times.last(), Some(&180.0));
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn repeated_previews_merge_against_the_pre_fetch_cache() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, true)
            .unwrap();
        manager.on_result(id, every(60.0, 0, 59)).unwrap();
        let token = manager.next_refresh().unwrap().0;
        let tail = manager.on_timer(token).unwrap().unwrap();
        for _ in 0..4 {
            manager
                .handle_event(tail, ExecutorEvent::Data(every(60.0, 39, 60)))
                .unwrap();
            let times = manager.snapshot().column_times(0);
            assert_eq!(times.len(), 59);
            assert_eq!(times.first(), Some(&120.0));
            assert_eq!(times.last(), Some(&3600.0));
        }
        manager.handle_event(tail, ExecutorEvent::Done(Default::default())).unwrap();
        assert_eq!(manager.rows().len(), 59);
    }

    #[test]
    fn disjoint_refresh_keeps_history_under_default_retention() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, true)
            .unwrap();
        manager.on_result(id, every(60.0, 0, 2)).unwrap();
        let token = manager.next_refresh().unwrap().0;
        let refresh = manager.on_timer(token).unwrap().unwrap();
        manager.on_result(refresh, every(60.0, 3, 4)).unwrap();
        assert_eq!(
            manager.snapshot().column_times(0),
            vec![0.0, 60.0, 120.0, 180.0, 240.0]
        );
        assert_eq!(manager.last_plan().unwrap().mode, RefreshMode::FullRedispatch);
    }

    #[test]
    fn new_query_while_windowed_drops_the_window() {
        let (mut manager, _) = manager();
        let marked = |from: u32, to: u32, mark: f64| {
            series(
                &["_time", "A", "B"],
                (from..=to).map(|i| vec![i as f64 * 30.0, mark, 0.0]).collect(),
            )
        };
        let id = manager
            .start("query-A", TimeSpec::Relative("-1h".into()), TimeSpec::Now, true)
            .unwrap();
        manager.on_result(id, marked(0, 110, 111.0)).unwrap();
        manager.apply_window(600.0, 1200.0).unwrap();
        assert_eq!(manager.rows().len(), 20);

        let fetch = manager.set_query("query-B").unwrap().unwrap();
        assert!(!manager.window().is_active());
        assert!(manager.window().snapshot().is_none());
        assert!(manager.rows().is_empty());
        assert_eq!(manager.config().earliest, TimeSpec::Relative("-1h".into()));
        assert_eq!(manager.config().latest, TimeSpec::Now);
        let request = manager.executor().requests.last().unwrap().clone();
        assert_eq!(request.id, fetch);
        assert_eq!(request.query, "query-B");
        assert!(request.streaming);

        let sent = manager.executor().requests.len();
        manager.clear_window().unwrap();
        assert!(manager.rows().is_empty());
        assert_eq!(manager.executor().requests.len(), sent);

        assert_eq!(
            manager.on_result(fetch, marked(100, 120, 222.0)).unwrap(),
            UpdateKind::Full
        );
        assert_eq!(manager.rows().len(), 21);
        assert!(manager
            .rows()
            .iter()
            .all(|row| row[1] == Value::Number(222.0)));
    }

    #[test]
    fn restart_while_windowed_drops_the_window() {
        let (mut manager, _) = manager();
        let id = manager
            .start("search", TimeSpec::Relative("-1h".into()), TimeSpec::Now, true)
            .unwrap();
        manager.on_result(id, every(60.0, 0, 59)).unwrap();
        manager.apply_window(600.0, 1200.0).unwrap();

        let id = manager
            .start("search", TimeSpec::Relative("-2h".into()), TimeSpec::Now, true)
            .unwrap();
        assert!(!manager.window().is_active());
        assert!(manager.rows().is_empty());
        manager.clear_window().unwrap();
        assert!(manager.rows().is_empty());
        assert_eq!(manager.config().earliest, TimeSpec::Relative("-2h".into()));

        assert_eq!(manager.on_result(id, every(60.0, 0, 9)).unwrap(), UpdateKind::Full);
        assert_eq!(manager.rows().len(), 10);
        assert!(manager.next_refresh().is_some());
    }
}
