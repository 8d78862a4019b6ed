//! Commit Timestamps and Time Sources
//!
//! Provides the time abstractions the commit log is built on:
//!
//! - `CommitTime`: millisecond-precision commit timestamp
//! - `TimeSource`: trait over wall-clock vs. simulated time
//! - `CommitClock`: monotonic allocator of commit timestamps
//!
//! ## Design Principles
//!
//! 1. **Explicit time**: all time operations go through `TimeSource`
//! 2. **No hidden state**: clock state is visible and controllable
//! 3. **Deterministic**: simulated time produces reproducible tests

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A commit timestamp in milliseconds since the Unix epoch.
///
/// Manifest ids are derived from commit times, so within a bucket these are
/// unique and strictly increasing with commit order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct CommitTime(pub u64);

impl CommitTime {
    /// The distinguished minimal value, used as the "beginning of time"
    /// lower bound for the very first export.
    pub const START_OF_TIME: CommitTime = CommitTime(0);

    pub fn from_millis(ms: u64) -> Self {
        CommitTime(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// The next representable commit time (this time plus one millisecond).
    ///
    /// Converts an inclusive bound into the start of a half-open range:
    /// `(a, b]` becomes `[a.next(), b.next())`.
    pub fn next(&self) -> CommitTime {
        CommitTime(
            self.0
                .checked_add(1)
                .expect("commit time overflow is unreachable before year 584556019"),
        )
    }

    pub fn saturating_sub(&self, duration: Duration) -> CommitTime {
        CommitTime(self.0.saturating_sub(duration.as_millis() as u64))
    }

    /// Format as RFC 3339 with millisecond precision, UTC.
    pub fn to_rfc3339(&self) -> String {
        // u64 millis always fit chrono's supported date range
        let dt = DateTime::<Utc>::from_timestamp_millis(self.0 as i64)
            .expect("millisecond commit times are within chrono's range");
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Parse an RFC 3339 timestamp. Pre-epoch times are rejected.
    pub fn parse_rfc3339(s: &str) -> Result<Self, TimeParseError> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|e| TimeParseError::Invalid(s.to_string(), e.to_string()))?;
        let ms = dt.timestamp_millis();
        if ms < 0 {
            return Err(TimeParseError::PreEpoch(s.to_string()));
        }
        Ok(CommitTime(ms as u64))
    }
}

impl std::fmt::Display for CommitTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

impl std::ops::Add<Duration> for CommitTime {
    type Output = CommitTime;

    fn add(self, rhs: Duration) -> Self::Output {
        CommitTime(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

/// Error parsing a textual timestamp
#[derive(Debug)]
pub enum TimeParseError {
    /// Not a valid RFC 3339 timestamp
    Invalid(String, String),
    /// Valid timestamp but before the Unix epoch
    PreEpoch(String),
}

impl std::fmt::Display for TimeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeParseError::Invalid(input, reason) => {
                write!(f, "Invalid RFC 3339 timestamp {:?}: {}", input, reason)
            }
            TimeParseError::PreEpoch(input) => {
                write!(f, "Timestamp {:?} is before the Unix epoch", input)
            }
        }
    }
}

impl std::error::Error for TimeParseError {}

/// Time source trait
///
/// Implementations:
/// - `SystemTimeSource`: real wall-clock time
/// - `SimulatedTimeSource`: controlled virtual time for deterministic tests
pub trait TimeSource: Send + Sync + Clone + 'static {
    /// Current time
    fn now(&self) -> CommitTime;

    /// Elapsed time since a previous timestamp
    fn elapsed(&self, since: CommitTime) -> Duration {
        let now = self.now();
        Duration::from_millis(now.0.saturating_sub(since.0))
    }
}

/// Wall-clock time source
///
/// Anchored to an `Instant` at construction so repeated reads are monotonic
/// even if the system clock steps backwards.
#[derive(Clone)]
pub struct SystemTimeSource {
    start: Instant,
    start_millis: u64,
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemTimeSource {
    pub fn new() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX_EPOCH")
            .as_millis() as u64;
        SystemTimeSource {
            start: Instant::now(),
            start_millis,
        }
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> CommitTime {
        let elapsed = self.start.elapsed().as_millis() as u64;
        CommitTime(self.start_millis + elapsed)
    }
}

/// Simulated time source for deterministic testing
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
#[derive(Clone)]
pub struct SimulatedTimeSource {
    time_ms: Arc<AtomicU64>,
}

impl Default for SimulatedTimeSource {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedTimeSource {
    /// Create a simulated time source starting at the given epoch millis
    pub fn new(start_ms: u64) -> Self {
        SimulatedTimeSource {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }
}

impl TimeSource for SimulatedTimeSource {
    fn now(&self) -> CommitTime {
        CommitTime(self.time_ms.load(Ordering::SeqCst))
    }
}

/// Monotonic commit-time allocator
///
/// Issues strictly increasing commit times: each call returns
/// `max(now, last_issued + 1)`. No two transactions in a process ever share
/// a millisecond, and issued times never move backwards even if the
/// underlying clock does. Shared via `Clone` (clones share state).
#[derive(Clone)]
pub struct CommitClock<T: TimeSource> {
    time_source: T,
    last_issued: Arc<AtomicU64>,
}

impl<T: TimeSource> CommitClock<T> {
    pub fn new(time_source: T) -> Self {
        CommitClock {
            time_source,
            last_issued: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Allocate the next commit time.
    pub fn next(&self) -> CommitTime {
        let now = self.time_source.now().0;
        loop {
            let last = self.last_issued.load(Ordering::SeqCst);
            let candidate = now.max(
                last.checked_add(1)
                    .expect("commit clock overflow is unreachable"),
            );
            if self
                .last_issued
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return CommitTime(candidate);
            }
        }
    }

    /// Advance the allocator past an externally observed commit time.
    ///
    /// Used after restore so newly issued times stay ahead of replayed ones.
    pub fn observe(&self, time: CommitTime) {
        self.last_issued.fetch_max(time.0, Ordering::SeqCst);
    }

    pub fn time_source(&self) -> &T {
        &self.time_source
    }
}
