//! Per-channel payload state and the update log.

use crate::connection::ConnectionId;
use crate::error::{EngineError, Result};
use crate::merge::MergeOptions;
use crate::payload::{Payload, PayloadCodec};
use crate::time::ChannelTime;
use std::collections::VecDeque;
use std::sync::Arc;

/// One published delta, timestamped in channel time.
#[derive(Debug, Clone)]
pub struct Update {
    pub time: ChannelTime,
    pub delta: Payload,
    pub originator: Option<ConnectionId>,
}

/// The running merged view of a channel plus the log of recent updates.
///
/// The log is kept only as long as some subscriber's fan-out cursor still
/// references it; the channel prunes it after every tick. `current` is
/// always the left-fold of all applied deltas over the initial payload.
pub struct ChannelData {
    codec: Arc<PayloadCodec>,
    options: MergeOptions,
    current: Payload,
    update_log: VecDeque<Update>,
    last_update_time: ChannelTime,
}

impl ChannelData {
    pub fn new(initial: Payload, options: MergeOptions, codec: Arc<PayloadCodec>) -> Self {
        Self {
            codec,
            options,
            current: initial,
            update_log: VecDeque::new(),
            last_update_time: ChannelTime::ZERO,
        }
    }

    pub fn current(&self) -> &Payload {
        &self.current
    }

    pub fn merge_options(&self) -> &MergeOptions {
        &self.options
    }

    pub fn last_update_time(&self) -> ChannelTime {
        self.last_update_time
    }

    pub fn log_len(&self) -> usize {
        self.update_log.len()
    }

    /// Apply a delta at time `t` and append it to the update log.
    ///
    /// Rejects updates older than the last applied one with `OutOfOrder`;
    /// the caller decides whether that is fatal. On any error the state is
    /// unchanged.
    pub fn on_update(
        &mut self,
        delta: Payload,
        t: ChannelTime,
        originator: Option<ConnectionId>,
    ) -> Result<()> {
        if t < self.last_update_time {
            return Err(EngineError::OutOfOrder {
                update: t,
                last: self.last_update_time,
            });
        }
        self.codec.merge(&mut self.current, &delta, &self.options)?;
        self.update_log.push_back(Update {
            time: t,
            delta,
            originator,
        });
        self.last_update_time = t;
        Ok(())
    }

    /// Coalesce every update at or after `cursor` into a single payload.
    ///
    /// Returns `None` when the cursor is already at the end of the log,
    /// otherwise the folded payload and the new cursor position. Merging the
    /// returned payload into any destination is equivalent to merging the
    /// covered updates individually, in order.
    pub fn slice_since(&self, cursor: usize) -> Result<(Option<Payload>, usize)> {
        if cursor >= self.update_log.len() {
            return Ok((None, cursor));
        }
        let mut folded = self.codec.new_empty(self.current.type_tag());
        for update in self.update_log.iter().skip(cursor) {
            self.codec.merge(&mut folded, &update.delta, &self.options)?;
        }
        Ok((Some(folded), self.update_log.len()))
    }

    /// Drop log entries before `min_index`. Remaining subscriber cursors
    /// must be shifted down by the same amount by the caller.
    pub fn prune_before(&mut self, min_index: usize) {
        let n = min_index.min(self.update_log.len());
        self.update_log.drain(..n);
    }
}
