//! Per-(connection, channel) subscription state.

use crate::connection::ConnectionId;
use crate::time::ChannelTime;
use serde::{Deserialize, Serialize};

/// Options supplied by the subscriber on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionOptions {
    /// Fan-out cadence. Defaults to the channel's tick interval.
    pub fan_out_interval_ms: Option<u32>,
    /// Field mask for fan-out payloads. Accepted and carried; filtering is
    /// not applied at this revision.
    pub field_mask: Option<Vec<String>>,
}

/// Read-only view of one subscription, as reported by channel snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub conn_id: ConnectionId,
    /// Cadence in channel-time nanoseconds.
    pub fan_out_interval_ns: i64,
    pub field_mask: Option<Vec<String>>,
}

/// Fan-out bookkeeping for one subscriber on one channel.
///
/// Holds a lookup key for the connection, never the connection itself;
/// connection teardown removes the subscription without coordination.
#[derive(Debug)]
pub(crate) struct Subscription {
    pub(crate) conn_id: ConnectionId,
    /// Cadence in channel-time nanoseconds.
    pub(crate) fan_out_interval: i64,
    /// The earliest tick at which this subscriber fires next.
    pub(crate) next_fan_out_at: ChannelTime,
    /// False until the first fan-out delivers the whole current payload.
    pub(crate) has_received_initial: bool,
    /// Index into the update log of the first update not yet delivered.
    pub(crate) cursor_index: usize,
    pub(crate) field_mask: Option<Vec<String>>,
}

impl Subscription {
    pub(crate) fn new(
        conn_id: ConnectionId,
        fan_out_interval: i64,
        now: ChannelTime,
        log_len: usize,
        field_mask: Option<Vec<String>>,
    ) -> Self {
        Self {
            conn_id,
            fan_out_interval,
            // Fires on the next tick at or after creation.
            next_fan_out_at: now,
            has_received_initial: false,
            cursor_index: log_len,
            field_mask,
        }
    }

    pub(crate) fn due(&self, now: ChannelTime) -> bool {
        now >= self.next_fan_out_at
    }

    /// Advance the schedule past `now` on the subscription's own grid, so a
    /// slow tick neither drifts the cadence nor triggers rapid catch-up
    /// fires: every missed fire collapses into the next delivery.
    pub(crate) fn advance(&mut self, now: ChannelTime) {
        loop {
            self.next_fan_out_at = self.next_fan_out_at.add_nanos(self.fan_out_interval);
            if self.next_fan_out_at > now {
                break;
            }
        }
    }

    /// Restart the cadence from `now`. Used after the initial snapshot
    /// delivery, which anchors the subscriber's grid.
    pub(crate) fn restart(&mut self, now: ChannelTime) {
        self.next_fan_out_at = now.add_nanos(self.fan_out_interval);
    }

    pub(crate) fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            conn_id: self.conn_id,
            fan_out_interval_ns: self.fan_out_interval,
            field_mask: self.field_mask.clone(),
        }
    }
}
