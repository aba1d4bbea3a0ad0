//! Decides when the next refresh runs and whether it re-dispatches the whole
//! query or only fetches a recent tail.

use crate::dataset::{row_time, DataSet, TimeSpec};
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// History (seconds) the cache must span before tail-fetches are trusted.
pub const HISTORY_FLOOR_SECS: f64 = 1200.0;
/// Re-dispatch period (seconds) when the cadence cannot be determined.
pub const UNKNOWN_CADENCE_SECS: f64 = 900.0;
/// Lower bound on any refresh delay.
pub const MIN_REFRESH_DELAY: Duration = Duration::from_millis(5);

/// Span value used when the bucket width is unknown.
pub const UNKNOWN_SPAN: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshMode {
    FullRedispatch,
    PartialTailFetch,
    Idle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshPlan {
    pub mode: RefreshMode,
    pub delay: Duration,
    /// Relative earliest bound for a tail-fetch, e.g. `-1260s`.
    pub lookback: Option<String>,
    /// Effective bucket width in seconds after throttling, or [`UNKNOWN_SPAN`].
    pub span: f64,
}

impl RefreshPlan {
    pub fn idle() -> Self {
        Self {
            mode: RefreshMode::Idle,
            delay: Duration::ZERO,
            lookback: None,
            span: UNKNOWN_SPAN,
        }
    }

    pub fn into_full(self) -> Self {
        Self {
            mode: RefreshMode::FullRedispatch,
            lookback: None,
            ..self
        }
    }
}

/// Start/finish instants of the latest fetch; only used for scheduling.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FetchTiming {
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl FetchTiming {
    pub fn begin(now: Instant) -> Self {
        Self {
            started_at: Some(now),
            finished_at: None,
        }
    }

    pub fn search_duration(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(finish)) => finish.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshScheduler {
    time_field: String,
    span_field: String,
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self::new("_time", "_span")
    }
}

impl RefreshScheduler {
    pub fn new(time_field: impl Into<String>, span_field: impl Into<String>) -> Self {
        Self {
            time_field: time_field.into(),
            span_field: span_field.into(),
        }
    }

    /// Bucket width in seconds, or [`UNKNOWN_SPAN`] when it cannot be determined.
    pub fn infer_span(&self, data: &DataSet) -> f64 {
        let Some(time_idx) = data.field_index(&self.time_field) else {
            warn!(
                "cannot keep data updated efficiently without {} in the fields",
                self.time_field
            );
            return UNKNOWN_SPAN;
        };
        if let Some(span_idx) = data.field_index(&self.span_field) {
            return data
                .rows()
                .first()
                .and_then(|row| row[span_idx].as_f64())
                .filter(|span| span.is_finite() && *span != 0.0)
                .unwrap_or(UNKNOWN_SPAN);
        }
        match data.rows() {
            [.., a, b] => {
                let span = (row_time(a, time_idx) - row_time(b, time_idx)).abs();
                if span.is_finite() {
                    span
                } else {
                    UNKNOWN_SPAN
                }
            }
            _ => {
                warn!(
                    "cannot infer cadence without {} or at least two rows",
                    self.span_field
                );
                UNKNOWN_SPAN
            }
        }
    }

    pub fn plan(
        &self,
        data: &DataSet,
        timing: &FetchTiming,
        min_update_interval: f64,
    ) -> RefreshPlan {
        let span = self.infer_span(data);
        let search = timing.search_duration();

        if span < 1.0 {
            return RefreshPlan {
                mode: RefreshMode::FullRedispatch,
                delay: refresh_delay(UNKNOWN_CADENCE_SECS, search),
                lookback: None,
                span: UNKNOWN_SPAN,
            };
        }

        let span = span.max(min_update_interval);
        let delay = refresh_delay(span, search);
        let data_range = self.data_range(data);
        let too_short = match data_range {
            None => true,
            Some(range) => range < HISTORY_FLOOR_SECS || span > range,
        };
        if too_short {
            return RefreshPlan {
                mode: RefreshMode::FullRedispatch,
                delay,
                lookback: None,
                span,
            };
        }

        let lookback_secs = if span > HISTORY_FLOOR_SECS {
            span * 2.0
        } else {
            span + HISTORY_FLOOR_SECS
        };
        RefreshPlan {
            mode: RefreshMode::PartialTailFetch,
            delay,
            lookback: Some(TimeSpec::lookback(lookback_secs).to_string()),
            span,
        }
    }

    /// Distance between the first and last cached rows, if there are two or more.
    fn data_range(&self, data: &DataSet) -> Option<f64> {
        let time_idx = data.field_index(&self.time_field)?;
        match data.rows() {
            [first, .., last] => {
                Some((row_time(first, time_idx) - row_time(last, time_idx)).abs())
                    .filter(|range| range.is_finite())
            }
            _ => None,
        }
    }
}

/// One bucket minus the time the last fetch took, floored at [`MIN_REFRESH_DELAY`].
pub fn refresh_delay(span_secs: f64, search: Duration) -> Duration {
    Duration::try_from_secs_f64(span_secs)
        .unwrap_or(Duration::ZERO)
        .checked_sub(search)
        .filter(|remaining| *remaining >= MIN_REFRESH_DELAY)
        .unwrap_or(MIN_REFRESH_DELAY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

#[derive(Debug, Clone)]
struct Armed {
    token: TimerToken,
    due: Instant,
    plan: RefreshPlan,
}

/// Holds at most one pending refresh. Arming again invalidates the previous token.
#[derive(Debug, Default)]
pub struct TimerSlot {
    next: u64,
    armed: Option<Armed>,
}

impl TimerSlot {
    pub fn arm(&mut self, due: Instant, plan: RefreshPlan) -> TimerToken {
        self.next += 1;
        let token = TimerToken(self.next);
        self.armed = Some(Armed { token, due, plan });
        token
    }

    pub fn cancel(&mut self) -> Option<TimerToken> {
        self.armed.take().map(|armed| armed.token)
    }

    pub fn pending(&self) -> Option<(TimerToken, Instant)> {
        self.armed.as_ref().map(|armed| (armed.token, armed.due))
    }

    pub fn is_current(&self, token: TimerToken) -> bool {
        self.armed.as_ref().is_some_and(|armed| armed.token == token)
    }

    /// Takes the plan if `token` is still the armed one.
    pub fn fire(&mut self, token: TimerToken) -> Option<RefreshPlan> {
        if self.is_current(token) {
            self.armed.take().map(|armed| armed.plan)
        } else {
            None
        }
    }

    /// Takes the plan if its deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<RefreshPlan> {
        match &self.armed {
            Some(armed) if armed.due <= now => self.armed.take().map(|armed| armed.plan),
            _ => None,
        }
    }
}
