//! Wire envelopes exchanged with peers.
//!
//! JSON with an internal `type` tag; payload data travels as a raw JSON
//! value whose type is fixed by the channel it belongs to.

use crate::channel::{ChannelId, ChannelKind};
use crate::merge::MergeOptions;
use crate::subscription::SubscriptionOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message sent from a peer to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a channel and initialize its data in one step.
    CreateChannel {
        kind: ChannelKind,
        type_tag: String,
        data: Value,
        #[serde(default)]
        merge_options: MergeOptions,
        /// Tick cadence override; defaults to the gateway-wide interval.
        #[serde(default)]
        tick_interval_ms: Option<u64>,
    },
    /// Close a channel owned by this peer.
    RemoveChannel { channel_id: ChannelId },
    /// Subscribe to a channel's fan-out.
    Subscribe {
        channel_id: ChannelId,
        #[serde(default)]
        options: SubscriptionOptions,
    },
    /// Drop this peer's subscription.
    Unsubscribe { channel_id: ChannelId },
    /// Publish a sparse delta onto a channel.
    Update { channel_id: ChannelId, data: Value },
    /// Keepalive.
    Ping,
}

/// Message sent from the gateway to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirmation of channel creation.
    ChannelCreated { channel_id: ChannelId },
    /// The channel was closed; all its subscriptions are gone.
    ChannelClosed { channel_id: ChannelId },
    /// Confirmation of subscription.
    Subscribed { channel_id: ChannelId },
    /// Confirmation of unsubscription.
    Unsubscribed { channel_id: ChannelId },
    /// Fan-out delivery: the coalesced delta, or the whole current payload
    /// on the subscriber's first fire.
    Update { channel_id: ChannelId, data: Value },
    /// Keepalive response.
    Pong,
    /// Request-level failure.
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_format() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "subscribe",
            "channel_id": 7,
            "options": { "fan_out_interval_ms": 50 },
        }))
        .unwrap();
        match msg {
            ClientMessage::Subscribe {
                channel_id,
                options,
            } => {
                assert_eq!(channel_id, ChannelId::new(7));
                assert_eq!(options.fan_out_interval_ms, Some(50));
                assert!(options.field_mask.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_options_default_when_omitted() {
        let msg: ClientMessage =
            serde_json::from_value(json!({ "type": "subscribe", "channel_id": 1 })).unwrap();
        match msg {
            ClientMessage::Subscribe { options, .. } => {
                assert_eq!(options, SubscriptionOptions::default());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_server_update_round_trip() {
        let msg = ServerMessage::Update {
            channel_id: ChannelId::new(3),
            data: json!({ "text": "b" }),
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            encoded,
            json!({ "type": "update", "channel_id": 3, "data": { "text": "b" } })
        );
    }
}
