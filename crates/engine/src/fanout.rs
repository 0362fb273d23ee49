//! Per-tick fan-out scheduling and delta coalescing.

use crate::channel::ChannelId;
use crate::connection::ConnectionRegistry;
use crate::data::ChannelData;
use crate::proto::ServerMessage;
use crate::subscription::Subscription;
use crate::time::ChannelTime;
use tracing::{debug, warn};

/// Run one fan-out pass over `subs` at channel time `now`.
///
/// Subscriptions are visited in insertion order, so same-tick fires are
/// delivered deterministically. A subscriber's first fire ships the whole
/// current payload and anchors its cadence; later fires ship one payload
/// coalesced from the updates its cursor has not covered yet. Subscribers
/// whose connection is gone are removed here, and the update log is pruned
/// to the earliest cursor still pending.
///
/// Returns the number of messages delivered.
pub(crate) fn tick_fan_out(
    channel_id: ChannelId,
    data: &mut ChannelData,
    subs: &mut Vec<Subscription>,
    registry: &ConnectionRegistry,
    now: ChannelTime,
) -> usize {
    let mut sent = 0;

    subs.retain_mut(|sub| {
        if !sub.due(now) {
            return true;
        }

        let payload = if !sub.has_received_initial {
            sub.has_received_initial = true;
            sub.cursor_index = data.log_len();
            sub.restart(now);
            Some(data.current().clone())
        } else {
            match data.slice_since(sub.cursor_index) {
                Ok((payload, cursor)) => {
                    sub.cursor_index = cursor;
                    sub.advance(now);
                    payload
                }
                Err(err) => {
                    warn!(channel = %channel_id, conn = %sub.conn_id, %err, "coalescing failed");
                    sub.advance(now);
                    None
                }
            }
        };

        let Some(payload) = payload else {
            // Nothing pending; the schedule advanced above.
            return true;
        };

        let delivered = registry.send(
            &sub.conn_id,
            ServerMessage::Update {
                channel_id,
                data: payload.into_value(),
            },
        );
        if delivered {
            sent += 1;
            true
        } else {
            debug!(channel = %channel_id, conn = %sub.conn_id, "dropping subscription for dead connection");
            false
        }
    });

    let min_cursor = subs
        .iter()
        .map(|sub| sub.cursor_index)
        .min()
        .unwrap_or_else(|| data.log_len());
    if min_cursor > 0 {
        data.prune_before(min_cursor);
        for sub in subs.iter_mut() {
            sub.cursor_index -= min_cursor;
        }
    }

    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, ConnectionId, ConnectionKind};
    use crate::merge::MergeOptions;
    use crate::payload::{Payload, PayloadCodec};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn make_conn(
        registry: &ConnectionRegistry,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.register(Arc::new(ConnectionHandle::new(ConnectionKind::Client, tx)));
        (id, rx)
    }

    fn make_data(initial: serde_json::Value) -> ChannelData {
        ChannelData::new(
            Payload::new("test.Data", initial),
            MergeOptions::default(),
            Arc::new(PayloadCodec::new()),
        )
    }

    fn recv_update(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> serde_json::Value {
        match rx.try_recv() {
            Ok(ServerMessage::Update { data, .. }) => data,
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_first_fire_delivers_snapshot_not_log() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = make_conn(&registry);
        let mut data = make_data(json!({ "text": "a", "num": 1 }));
        data.on_update(
            Payload::new("test.Data", json!({ "text": "b" })),
            ChannelTime::from_millis(10),
            None,
        )
        .unwrap();

        // Joined after the update was logged; the snapshot covers it.
        let mut subs = vec![Subscription::new(conn, 50_000_000, ChannelTime::ZERO, 0, None)];
        let sent = tick_fan_out(
            ChannelId::new(1),
            &mut data,
            &mut subs,
            &registry,
            ChannelTime::from_millis(100),
        );

        assert_eq!(sent, 1);
        assert_eq!(recv_update(&mut rx), json!({ "text": "b", "num": 1 }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_quiet_subscriber_advances_without_message() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = make_conn(&registry);
        let mut data = make_data(json!({ "text": "a" }));
        let mut subs = vec![Subscription::new(conn, 50_000_000, ChannelTime::ZERO, 0, None)];

        tick_fan_out(
            ChannelId::new(1),
            &mut data,
            &mut subs,
            &registry,
            ChannelTime::from_millis(100),
        );
        let _ = recv_update(&mut rx);

        // No publishes since the snapshot: nothing is sent, but the
        // schedule still moves to the next slot.
        let sent = tick_fan_out(
            ChannelId::new(1),
            &mut data,
            &mut subs,
            &registry,
            ChannelTime::from_millis(150),
        );
        assert_eq!(sent, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(subs[0].next_fan_out_at, ChannelTime::from_millis(200));
    }

    #[test]
    fn test_dead_connection_is_removed_lazily() {
        let registry = ConnectionRegistry::new();
        let (gone, rx) = make_conn(&registry);
        drop(rx);
        let (alive, mut alive_rx) = make_conn(&registry);

        let mut data = make_data(json!({ "text": "a" }));
        let mut subs = vec![
            Subscription::new(gone, 50_000_000, ChannelTime::ZERO, 0, None),
            Subscription::new(alive, 50_000_000, ChannelTime::ZERO, 0, None),
        ];

        let sent = tick_fan_out(
            ChannelId::new(1),
            &mut data,
            &mut subs,
            &registry,
            ChannelTime::from_millis(100),
        );
        assert_eq!(sent, 1);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].conn_id, alive);
        let _ = recv_update(&mut alive_rx);
    }

    #[test]
    fn test_log_pruned_once_all_cursors_pass() {
        let registry = ConnectionRegistry::new();
        let (fast, mut fast_rx) = make_conn(&registry);
        let (slow, mut slow_rx) = make_conn(&registry);

        let mut data = make_data(json!({ "text": "a" }));
        let mut subs = vec![
            Subscription::new(fast, 50_000_000, ChannelTime::ZERO, 0, None),
            Subscription::new(slow, 100_000_000, ChannelTime::ZERO, 0, None),
        ];

        // Both take their initial snapshot at 100ms.
        tick_fan_out(ChannelId::new(1), &mut data, &mut subs, &registry, ChannelTime::from_millis(100));
        let _ = recv_update(&mut fast_rx);
        let _ = recv_update(&mut slow_rx);

        data.on_update(
            Payload::new("test.Data", json!({ "text": "b" })),
            ChannelTime::from_millis(110),
            None,
        )
        .unwrap();

        // Only the fast subscriber fires at 150ms: the slow cursor still
        // pins the log.
        tick_fan_out(ChannelId::new(1), &mut data, &mut subs, &registry, ChannelTime::from_millis(150));
        assert_eq!(recv_update(&mut fast_rx), json!({ "text": "b" }));
        assert!(slow_rx.try_recv().is_err());
        assert_eq!(data.log_len(), 1);

        // At 200ms the slow subscriber catches up and the log drains.
        tick_fan_out(ChannelId::new(1), &mut data, &mut subs, &registry, ChannelTime::from_millis(200));
        assert_eq!(recv_update(&mut slow_rx), json!({ "text": "b" }));
        assert_eq!(data.log_len(), 0);
        assert_eq!(subs[0].cursor_index, 0);
        assert_eq!(subs[1].cursor_index, 0);
    }
}
