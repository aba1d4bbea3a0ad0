use anyhow::{Context, Result};
use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tsdm_lib::{
    row_time, Chronology, DataManager, DataSet, EventKind, ExecutorEvent, FetchId, FetchKind,
    JobMeta, ManagerConfig, ManualClock, Order, QueryExecutor, QueryRequest, RefreshMode, Row,
    SyncError, TimeSpec, Value,
};

fn default_span() -> f64 {
    60.0
}

fn default_fields() -> Vec<String> {
    vec!["count".into()]
}

fn default_origin() -> f64 {
    1_700_000_000.0
}

fn default_cycles() -> usize {
    3
}

fn default_manager() -> ManagerConfig {
    ManagerConfig {
        id: "sim".into(),
        earliest: TimeSpec::Relative("-20m".into()),
        keep_updated: true,
        ..ManagerConfig::default()
    }
}

/// A streaming run against the simulated backend, usually read from TOML.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Scenario {
    pub name: String,
    /// Bucket width of the generated series, in seconds.
    #[serde(default = "default_span")]
    pub span_secs: f64,
    /// Value columns besides the time (and optional span) column.
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Simulated search duration; the clock advances by this before data arrives.
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub include_span_field: bool,
    /// Epoch seconds the simulated clock starts at.
    #[serde(default = "default_origin")]
    pub origin_epoch: f64,
    /// 1-based request numbers the backend fails.
    #[serde(default)]
    pub fail_on: Vec<usize>,
    /// Fetch rounds to run, the initial dispatch included.
    #[serde(default = "default_cycles")]
    pub cycles: usize,
    #[serde(default = "default_manager")]
    pub manager: ManagerConfig,
}

impl Scenario {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            span_secs: default_span(),
            fields: default_fields(),
            seed: None,
            latency_ms: 0,
            descending: false,
            include_span_field: false,
            origin_epoch: default_origin(),
            fail_on: Vec::new(),
            cycles: default_cycles(),
            manager: default_manager(),
        }
    }
}

pub fn parse_scenario(text: &str) -> Result<Scenario> {
    let scenario: Scenario = toml::from_str(text).context("parsing scenario")?;
    scenario.manager.validate()?;
    if !(scenario.span_secs.is_finite() && scenario.span_secs > 0.0) {
        anyhow::bail!("span_secs must be positive (got {})", scenario.span_secs);
    }
    Ok(scenario)
}

pub fn read_scenario(path: &Path) -> Result<Scenario> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario {}", path.display()))?;
    parse_scenario(&contents).with_context(|| format!("parsing scenario {}", path.display()))
}

/// Seconds described by a relative time-spec such as `-20m`, `-1260s`, `-4h`, `-1d`.
pub fn relative_offset(text: &str) -> Result<f64, SyncError> {
    let invalid = || SyncError::InvalidTimeSpec(text.to_string());
    let trimmed = text.trim();
    let (sign, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if body.is_empty() {
        return Err(invalid());
    }
    let split = body
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(body.len());
    let (number, unit) = body.split_at(split);
    let amount: f64 = if number.is_empty() {
        1.0
    } else {
        number.parse().map_err(|_| invalid())?
    };
    let scale = match unit {
        "" | "s" | "sec" | "secs" => 1.0,
        "m" | "min" | "mins" => 60.0,
        "h" | "hr" | "hrs" => 3_600.0,
        "d" | "day" | "days" => 86_400.0,
        "w" | "week" | "weeks" => 604_800.0,
        _ => return Err(invalid()),
    };
    Ok(sign * amount * scale)
}

/// Epoch seconds for `spec` given the current time.
pub fn resolve_time(spec: &TimeSpec, now: f64) -> Result<f64, SyncError> {
    match spec {
        TimeSpec::Now => Ok(now),
        TimeSpec::Absolute(t) => Ok(*t),
        TimeSpec::Relative(text) => Ok(now + relative_offset(text)?),
    }
}

#[derive(Debug)]
struct Pending {
    fetch: FetchId,
    event: ExecutorEvent,
    /// Simulated time spent before this event is delivered.
    delay: Duration,
}

/// Query executor producing seeded, bucketed series against a [`ManualClock`].
#[derive(Debug)]
pub struct SimulatedBackend {
    clock: ManualClock,
    span: f64,
    time_field: String,
    span_field: Option<String>,
    fields: Vec<String>,
    seed: u64,
    latency: Duration,
    descending: bool,
    origin: f64,
    fail_on: BTreeSet<usize>,
    queue: VecDeque<Pending>,
    requests: Vec<QueryRequest>,
    cancelled: Vec<FetchId>,
}

impl SimulatedBackend {
    pub fn new(scenario: &Scenario, clock: ManualClock) -> Self {
        Self {
            clock,
            span: scenario.span_secs,
            time_field: scenario.manager.time_field.clone(),
            span_field: scenario
                .include_span_field
                .then(|| scenario.manager.span_field.clone()),
            fields: scenario.fields.clone(),
            seed: scenario.seed.unwrap_or(0),
            latency: Duration::from_millis(scenario.latency_ms),
            descending: scenario.descending,
            origin: scenario.origin_epoch,
            fail_on: scenario.fail_on.iter().copied().collect(),
            queue: VecDeque::new(),
            requests: Vec::new(),
            cancelled: Vec::new(),
        }
    }

    /// Current simulated epoch time.
    pub fn now_epoch(&self) -> f64 {
        self.origin + self.clock.elapsed().as_secs_f64()
    }

    pub fn requests(&self) -> &[QueryRequest] {
        &self.requests
    }

    pub fn cancelled(&self) -> &[FetchId] {
        &self.cancelled
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn field_names(&self) -> Vec<String> {
        let mut names = vec![self.time_field.clone()];
        names.extend(self.span_field.iter().cloned());
        names.extend(self.fields.iter().cloned());
        names
    }

    /// Buckets aligned to the span inside `[earliest, latest)`, or up to and
    /// including the current bucket when `latest` is now.
    pub fn generate(
        &self,
        earliest: f64,
        latest: f64,
        latest_is_now: bool,
    ) -> Result<DataSet, SyncError> {
        let first = (earliest / self.span).ceil() as i64;
        let mut last = (latest / self.span).floor() as i64;
        if !latest_is_now && last as f64 * self.span >= latest {
            last -= 1;
        }
        let mut rows: Vec<Row> = (first..=last)
            .map(|bucket| {
                let time = bucket as f64 * self.span;
                let mut rng = StdRng::seed_from_u64(self.seed ^ bucket as u64);
                let mut row = vec![Value::Number(time)];
                if self.span_field.is_some() {
                    row.push(Value::Number(self.span));
                }
                row.extend(
                    self.fields
                        .iter()
                        .map(|_| Value::Number(rng.gen_range(0..1000) as f64)),
                );
                row
            })
            .collect();
        if self.descending {
            rows.reverse();
        }
        DataSet::new(self.field_names(), rows)
    }

    fn push(&mut self, fetch: FetchId, event: ExecutorEvent, delay: Duration) {
        self.queue.push_back(Pending {
            fetch,
            event,
            delay,
        });
    }
}

impl QueryExecutor for SimulatedBackend {
    fn execute(&mut self, request: &QueryRequest) -> Result<(), SyncError> {
        self.requests.push(request.clone());
        let number = self.requests.len();
        let now = self.now_epoch();
        let earliest = resolve_time(&request.earliest, now)?;
        let latest = resolve_time(&request.latest, now)?;
        debug!(
            "sim: request {} {} {:?} [{}, {}]",
            number, request.id, request.kind, earliest, latest
        );

        self.push(request.id, ExecutorEvent::Start, Duration::ZERO);
        if self.fail_on.contains(&number) {
            self.push(
                request.id,
                ExecutorEvent::Fail(format!("injected failure on request {}", number)),
                self.latency,
            );
            return Ok(());
        }
        let data = self.generate(earliest, latest, request.latest.is_now())?;
        let result_count = data.len() as u64;
        self.push(
            request.id,
            ExecutorEvent::Progress(JobMeta {
                progress: Some(0.5),
                ..JobMeta::default()
            }),
            Duration::ZERO,
        );
        self.push(request.id, ExecutorEvent::Data(data), self.latency);
        self.push(
            request.id,
            ExecutorEvent::Done(JobMeta {
                is_done: true,
                progress: Some(1.0),
                result_count: Some(result_count),
                messages: Vec::new(),
            }),
            Duration::ZERO,
        );
        Ok(())
    }

    fn cancel(&mut self, id: FetchId) {
        let before = self.queue.len();
        self.queue.retain(|pending| pending.fetch != id);
        if self.queue.len() != before {
            self.cancelled.push(id);
            self.push(id, ExecutorEvent::Cancel, Duration::ZERO);
        }
    }

    fn poll_event(&mut self) -> Option<(FetchId, ExecutorEvent)> {
        let pending = self.queue.pop_front()?;
        self.clock.advance(pending.delay);
        Some((pending.fetch, pending.event))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: usize,
    pub kind: Option<FetchKind>,
    pub rows: usize,
    pub earliest: Option<f64>,
    pub latest: Option<f64>,
    pub next_mode: Option<RefreshMode>,
    pub lookback: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StreamReport {
    pub scenario: String,
    pub cycles: Vec<CycleReport>,
    pub full_refreshes: usize,
    pub partial_updates: usize,
    pub failures: usize,
    pub schema_errors: usize,
    pub requests: usize,
    pub rows: usize,
    pub order: Option<Order>,
    pub duplicate_times: usize,
    pub monotonic: bool,
}

#[derive(Debug, Default)]
struct Tally {
    full: usize,
    partial: usize,
    failures: usize,
    schema: usize,
}

fn duplicate_times(data: &DataSet, time_index: usize) -> usize {
    let mut seen = BTreeSet::new();
    data.rows()
        .iter()
        .map(|row| row_time(row, time_index))
        .filter(|t| !seen.insert(t.to_bits()))
        .count()
}

/// Run `scenario.cycles` fetch rounds, advancing the simulated clock to each
/// armed refresh.
pub fn run_scenario(scenario: &Scenario) -> Result<(StreamReport, DataSet)> {
    let clock = ManualClock::new();
    let backend = SimulatedBackend::new(scenario, clock.clone());
    let config = scenario.manager.clone();
    let mut manager = DataManager::with_clock(config.clone(), backend, clock.clone())?;

    let tally = Rc::new(RefCell::new(Tally::default()));
    let kinds = [
        EventKind::FullRefreshComplete,
        EventKind::PartialUpdateComplete,
        EventKind::SearchFail,
        EventKind::SearchError,
        EventKind::SchemaError,
    ];
    for kind in kinds {
        let sink = Rc::clone(&tally);
        manager.subscribe(kind, move |event| {
            let mut tally = sink.borrow_mut();
            match event.kind() {
                EventKind::FullRefreshComplete => tally.full += 1,
                EventKind::PartialUpdateComplete => tally.partial += 1,
                EventKind::SchemaError => tally.schema += 1,
                _ => tally.failures += 1,
            }
        })?;
    }

    manager.start(
        config.search.clone(),
        config.earliest.clone(),
        config.latest.clone(),
        config.keep_updated,
    )?;
    manager.run_until_idle()?;

    let mut cycles = Vec::with_capacity(scenario.cycles);
    for cycle in 1..=scenario.cycles {
        if cycle > 1 {
            let Some((_, due)) = manager.next_refresh() else {
                debug!("sim: nothing scheduled after cycle {}", cycle - 1);
                break;
            };
            clock.advance_to(due);
            manager.poll_timers()?;
            manager.run_until_idle()?;
        }
        let snapshot = manager.snapshot();
        let time_index = snapshot.field_index(&config.time_field);
        let chrono = time_index.and_then(|idx| Chronology::detect(snapshot.rows(), idx).ok());
        let plan = manager.last_plan();
        cycles.push(CycleReport {
            cycle,
            kind: manager.executor().requests().last().map(|r| r.kind),
            rows: snapshot.len(),
            earliest: chrono.and_then(|c| c.earliest_time(snapshot.rows())),
            latest: chrono.and_then(|c| c.latest_time(snapshot.rows())),
            next_mode: plan.map(|p| p.mode),
            lookback: plan.and_then(|p| p.lookback.clone()),
        });
    }

    let data = (*manager.snapshot()).clone();
    let time_index = data.field_index(&config.time_field);
    let chrono = time_index.and_then(|idx| Chronology::detect(data.rows(), idx).ok());
    let tally = tally.borrow();
    let report = StreamReport {
        scenario: scenario.name.clone(),
        cycles,
        full_refreshes: tally.full,
        partial_updates: tally.partial,
        failures: tally.failures,
        schema_errors: tally.schema,
        requests: manager.executor().requests().len(),
        rows: data.len(),
        order: chrono.map(|c| c.order()),
        duplicate_times: time_index.map_or(0, |idx| duplicate_times(&data, idx)),
        monotonic: chrono.map_or(true, |c| c.is_monotonic(data.rows())),
    };
    info!(
        "sim: {} finished {} cycle(s) with {} rows",
        report.scenario,
        report.cycles.len(),
        report.rows
    );
    manager.teardown()?;
    Ok((report, data))
}

pub fn write_report(path: &Path, report: &StreamReport) -> Result<()> {
    let file = fs::File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

pub fn read_report(path: &Path) -> Result<StreamReport> {
    let file =
        fs::File::open(path).with_context(|| format!("opening report {}", path.display()))?;
    let report = serde_json::from_reader::<_, StreamReport>(file)
        .with_context(|| format!("parsing report {}", path.display()))?;
    Ok(report)
}
