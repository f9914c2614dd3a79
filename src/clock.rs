//! Wall-clock timestamps anchored to the monotonic clock.
//!
//! Capture schedules are expressed in wall-clock seconds since the Unix epoch
//! (that is what storage and the camera metadata record), but every wait in
//! the core must be immune to wall-clock jumps. A [`Clock`] takes one
//! `SystemTime` reading and one `tokio::time::Instant` reading at creation and
//! derives all later timestamps from the monotonic side. Waiting until a
//! timestamp is then a single `sleep_until` on the equivalent instant.
//!
//! Because the monotonic side is tokio's clock, tests running with paused
//! time see a consistent, fast-forwarded wall clock as well.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    /// Wraps raw epoch seconds.
    pub const fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    /// Raw epoch seconds.
    pub const fn as_secs(self) -> f64 {
        self.0
    }

    /// Signed number of seconds from `earlier` to `self`.
    pub fn seconds_since(self, earlier: Timestamp) -> f64 {
        self.0 - earlier.0
    }

    /// Total ordering, used by priority queues keyed on timestamps.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }

    /// Human-readable UTC rendering, for logs and the CLI.
    pub fn to_datetime(self) -> Option<chrono::DateTime<chrono::Utc>> {
        let secs = self.0.floor();
        let nanos = ((self.0 - secs) * 1e9) as u32;
        chrono::DateTime::from_timestamp(secs as i64, nanos)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

impl Add<f64> for Timestamp {
    type Output = Timestamp;

    fn add(self, secs: f64) -> Timestamp {
        Timestamp(self.0 + secs)
    }
}

impl Sub<f64> for Timestamp {
    type Output = Timestamp;

    fn sub(self, secs: f64) -> Timestamp {
        Timestamp(self.0 - secs)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, d: Duration) -> Timestamp {
        Timestamp(self.0 + d.as_secs_f64())
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, d: Duration) -> Timestamp {
        Timestamp(self.0 - d.as_secs_f64())
    }
}

/// Shared time source for all actors.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall_anchor: f64,
    mono_anchor: Instant,
}

impl Clock {
    /// Anchors a clock at the current system time.
    pub fn system() -> Self {
        let wall_anchor = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self::anchored_at(Timestamp(wall_anchor))
    }

    /// Anchors a clock so that "now" reads as `wall`.
    pub fn anchored_at(wall: Timestamp) -> Self {
        Self {
            wall_anchor: wall.0,
            mono_anchor: Instant::now(),
        }
    }

    /// Current wall-clock timestamp.
    pub fn now(&self) -> Timestamp {
        Timestamp(self.wall_anchor + self.mono_anchor.elapsed().as_secs_f64())
    }

    /// Monotonic instant corresponding to `ts`. Timestamps before the anchor
    /// map to the anchor itself, which is already in the past.
    pub fn instant_at(&self, ts: Timestamp) -> Instant {
        let offset = ts.0 - self.wall_anchor;
        if offset <= 0.0 || !offset.is_finite() {
            self.mono_anchor
        } else {
            self.mono_anchor + Duration::from_secs_f64(offset)
        }
    }

    /// Waits until `ts`. Returns immediately for timestamps in the past.
    pub async fn sleep_until(&self, ts: Timestamp) {
        tokio::time::sleep_until(self.instant_at(ts)).await;
    }

    /// Seconds from now until `ts` (negative when `ts` has passed).
    pub fn seconds_until(&self, ts: Timestamp) -> f64 {
        ts.seconds_since(self.now())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
