//! Channel-local logical time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A monotonic instant in channel-local time, in nanoseconds.
///
/// Channel time is advanced by the channel's tick rather than read from the
/// wall clock, so fan-out schedules are deterministic under test.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChannelTime(i64);

impl ChannelTime {
    pub const ZERO: ChannelTime = ChannelTime(0);

    pub fn from_millis(ms: i64) -> Self {
        ChannelTime(ms.saturating_mul(1_000_000))
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn as_millis(self) -> i64 {
        self.0 / 1_000_000
    }

    /// This time plus `ms` milliseconds.
    pub fn add_millis(self, ms: i64) -> Self {
        ChannelTime(self.0.saturating_add(ms.saturating_mul(1_000_000)))
    }

    /// This time plus `ns` nanoseconds.
    pub fn add_nanos(self, ns: i64) -> Self {
        ChannelTime(self.0.saturating_add(ns))
    }

    /// This time plus a wall-clock duration.
    pub fn add_duration(self, d: Duration) -> Self {
        self.add_nanos(d.as_nanos().min(i64::MAX as u128) as i64)
    }
}

impl fmt::Display for ChannelTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.as_millis())
    }
}
