//! Message routing between connections and channels.

use crate::channel::{ChannelHandle, ChannelId, ChannelKind};
use crate::connection::{ConnectionId, ConnectionKind, ConnectionRegistry};
use crate::error::{EngineError, Result};
use crate::merge::MergeOptions;
use crate::payload::{Payload, PayloadCodec};
use crate::proto::{ClientMessage, ServerMessage};
use crate::subscription::SubscriptionOptions;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Payload type of the built-in global channel.
const GLOBAL_TYPE_TAG: &str = "gateway.GlobalState";

/// Owns the channel map and dispatches inbound messages to the owning
/// channel. Outbound traffic flows the other way: channels resolve
/// subscriber connections through the registry held here.
pub struct Router {
    channels: DashMap<ChannelId, ChannelHandle>,
    connections: Arc<ConnectionRegistry>,
    codec: Arc<PayloadCodec>,
    next_channel_id: AtomicU32,
    default_tick_interval: Duration,
}

impl Router {
    /// Create a router with the global channel already live.
    pub fn new(codec: Arc<PayloadCodec>, default_tick_interval: Duration) -> Arc<Router> {
        let router = Router {
            channels: DashMap::new(),
            connections: Arc::new(ConnectionRegistry::new()),
            codec,
            next_channel_id: AtomicU32::new(1),
            default_tick_interval,
        };
        let global = ChannelHandle::spawn(
            ChannelId::GLOBAL,
            ChannelKind::Global,
            None,
            Arc::from(GLOBAL_TYPE_TAG),
            default_tick_interval,
            Some((
                router.codec.new_empty(GLOBAL_TYPE_TAG),
                MergeOptions::default(),
            )),
            router.connections.clone(),
            router.codec.clone(),
        );
        router.channels.insert(ChannelId::GLOBAL, global);
        Arc::new(router)
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Copy out the handle for a channel.
    pub fn channel(&self, id: ChannelId) -> Result<ChannelHandle> {
        self.channels
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::NoSuchChannel(id))
    }

    /// Create a channel owned by `owner`, initialized and live.
    ///
    /// Server peers may create any kind; client peers only private
    /// channels.
    pub fn create_channel(
        &self,
        owner: ConnectionId,
        kind: ChannelKind,
        type_tag: &str,
        data: Value,
        merge_options: MergeOptions,
        tick_interval: Option<Duration>,
    ) -> Result<ChannelId> {
        let owner_kind = self
            .connections
            .get(&owner)
            .map(|conn| conn.kind)
            .ok_or(EngineError::NotAuthorized("create a channel"))?;
        if owner_kind != ConnectionKind::Server && kind != ChannelKind::Private {
            return Err(EngineError::NotAuthorized("create a non-private channel"));
        }

        let id = ChannelId::new(self.next_channel_id.fetch_add(1, Ordering::Relaxed));
        let handle = ChannelHandle::spawn(
            id,
            kind,
            Some(owner),
            Arc::from(type_tag),
            tick_interval.unwrap_or(self.default_tick_interval),
            Some((Payload::new(type_tag.to_string(), data), merge_options)),
            self.connections.clone(),
            self.codec.clone(),
        );
        self.channels.insert(id, handle);
        info!(channel = %id, kind = kind.as_str(), owner = %owner, "channel created");
        Ok(id)
    }

    /// Close and remove a channel. Only its owner may do so; the global
    /// channel is permanent.
    pub async fn remove_channel(&self, id: ChannelId, requester: ConnectionId) -> Result<()> {
        let handle = self.channel(id)?;
        if handle.owner() != Some(requester) {
            return Err(EngineError::NotAuthorized("remove this channel"));
        }
        self.channels.remove(&id);
        handle.close().await;
        Ok(())
    }

    /// Dispatch one inbound message from `conn_id`. Returns the
    /// acknowledgement to send back, if the message has one.
    pub async fn handle_message(
        &self,
        conn_id: ConnectionId,
        msg: ClientMessage,
    ) -> Result<Option<ServerMessage>> {
        match msg {
            ClientMessage::CreateChannel {
                kind,
                type_tag,
                data,
                merge_options,
                tick_interval_ms,
            } => {
                let channel_id = self.create_channel(
                    conn_id,
                    kind,
                    &type_tag,
                    data,
                    merge_options,
                    tick_interval_ms.map(Duration::from_millis),
                )?;
                Ok(Some(ServerMessage::ChannelCreated { channel_id }))
            }
            ClientMessage::RemoveChannel { channel_id } => {
                self.remove_channel(channel_id, conn_id).await?;
                Ok(None)
            }
            ClientMessage::Subscribe {
                channel_id,
                options,
            } => {
                self.with_channel(channel_id, |handle| async move {
                    handle.subscribe(conn_id, options).await
                })
                .await?;
                Ok(Some(ServerMessage::Subscribed { channel_id }))
            }
            ClientMessage::Unsubscribe { channel_id } => {
                self.with_channel(channel_id, |handle| async move {
                    handle.unsubscribe(conn_id).await
                })
                .await?;
                Ok(Some(ServerMessage::Unsubscribed { channel_id }))
            }
            ClientMessage::Update { channel_id, data } => {
                let handle = self.channel(channel_id)?;
                let delta = Payload::new(handle.type_tag().clone(), data);
                self.with_channel(channel_id, |handle| async move {
                    handle.update(delta, None, Some(conn_id)).await
                })
                .await?;
                Ok(None)
            }
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
        }
    }

    /// Detach a closed connection: every channel drops its subscription,
    /// and channels it owned are closed and removed.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        self.connections.unregister(&conn_id);

        let handles: Vec<ChannelHandle> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            if handle.owner() == Some(conn_id) {
                self.channels.remove(&handle.id());
            }
            handle.notify_disconnect(conn_id).await;
        }
        debug!(conn = %conn_id, "connection detached from router");
    }

    /// Run `op` against a channel, evicting the map entry when the
    /// executor turns out to be gone already.
    async fn with_channel<F, Fut>(&self, id: ChannelId, op: F) -> Result<()>
    where
        F: FnOnce(ChannelHandle) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let handle = self.channel(id)?;
        match op(handle).await {
            Err(EngineError::ChannelClosing(_)) => {
                self.channels.remove(&id);
                Err(EngineError::NoSuchChannel(id))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::time::ChannelTime;
    use serde_json::json;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const FAR_TICK: Duration = Duration::from_secs(3600);

    fn make_router() -> Arc<Router> {
        Router::new(Arc::new(PayloadCodec::new()), FAR_TICK)
    }

    fn connect(
        router: &Router,
        kind: ConnectionKind,
    ) -> (ConnectionId, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = router
            .connections()
            .register(Arc::new(ConnectionHandle::new(kind, tx)));
        (id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn create_room(router: &Router, owner: ConnectionId) -> ChannelId {
        router
            .create_channel(
                owner,
                ChannelKind::Room,
                "test.Room",
                json!({ "text": "a", "num": 1 }),
                MergeOptions::default(),
                Some(FAR_TICK),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_global_channel_exists_at_startup() {
        let router = make_router();
        assert_eq!(router.channel_count(), 1);
        let global = router.channel(ChannelId::GLOBAL).unwrap();
        assert_eq!(global.kind(), ChannelKind::Global);
        assert_eq!(global.owner(), None);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_reported() {
        let router = make_router();
        let (conn, _rx) = connect(&router, ConnectionKind::Client);
        let err = router
            .handle_message(
                conn,
                ClientMessage::Subscribe {
                    channel_id: ChannelId::new(42),
                    options: SubscriptionOptions::default(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_SUCH_CHANNEL");
    }

    #[tokio::test]
    async fn test_client_cannot_create_room_channel() {
        let router = make_router();
        let (client, _rx) = connect(&router, ConnectionKind::Client);

        let err = router
            .create_channel(
                client,
                ChannelKind::Room,
                "test.Room",
                json!({}),
                MergeOptions::default(),
                None,
            )
            .unwrap_err();
        assert_eq!(err.code(), "NOT_AUTHORIZED");

        // Private channels are allowed for clients.
        router
            .create_channel(
                client,
                ChannelKind::Private,
                "test.Private",
                json!({}),
                MergeOptions::default(),
                None,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_only_owner_may_remove() {
        let router = make_router();
        let (owner, _owner_rx) = connect(&router, ConnectionKind::Server);
        let (other, _other_rx) = connect(&router, ConnectionKind::Server);
        let id = create_room(&router, owner);

        let err = router.remove_channel(id, other).await.unwrap_err();
        assert_eq!(err.code(), "NOT_AUTHORIZED");

        router.remove_channel(id, owner).await.unwrap();
        assert!(matches!(
            router.channel(id),
            Err(EngineError::NoSuchChannel(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_update_fan_out_via_messages() {
        let router = make_router();
        let (owner, mut owner_rx) = connect(&router, ConnectionKind::Server);
        let (sub, mut sub_rx) = connect(&router, ConnectionKind::Client);

        let ack = router
            .handle_message(
                owner,
                ClientMessage::CreateChannel {
                    kind: ChannelKind::Room,
                    type_tag: "test.Room".to_string(),
                    data: json!({ "text": "a", "num": 1 }),
                    merge_options: MergeOptions::default(),
                    tick_interval_ms: Some(3_600_000),
                },
            )
            .await
            .unwrap();
        let Some(ServerMessage::ChannelCreated { channel_id }) = ack else {
            panic!("expected creation ack, got {ack:?}");
        };

        let ack = router
            .handle_message(
                sub,
                ClientMessage::Subscribe {
                    channel_id,
                    options: SubscriptionOptions {
                        fan_out_interval_ms: Some(50),
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap();
        assert!(matches!(ack, Some(ServerMessage::Subscribed { .. })));

        router
            .handle_message(
                owner,
                ClientMessage::Update {
                    channel_id,
                    data: json!({ "text": "b" }),
                },
            )
            .await
            .unwrap();

        let handle = router.channel(channel_id).unwrap();
        handle.tick(ChannelTime::from_millis(100)).await.unwrap();

        let msgs = drain(&mut sub_rx);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            ServerMessage::Update { data, .. } => {
                assert_eq!(data, &json!({ "text": "b", "num": 1 }));
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert!(drain(&mut owner_rx).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_closes_owned_channels() {
        let router = make_router();
        let (owner, _owner_rx) = connect(&router, ConnectionKind::Server);
        let (sub, mut sub_rx) = connect(&router, ConnectionKind::Client);
        let id = create_room(&router, owner);

        router
            .handle_message(
                sub,
                ClientMessage::Subscribe {
                    channel_id: id,
                    options: SubscriptionOptions::default(),
                },
            )
            .await
            .unwrap();

        router.disconnect(owner).await;
        assert!(router.channel(id).is_err());
        assert!(router.connections().get(&owner).is_none());

        // The subscriber hears about the teardown.
        let closed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(ServerMessage::ChannelClosed { channel_id }) = sub_rx.recv().await {
                    break channel_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(closed, id);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let router = make_router();
        let (conn, _rx) = connect(&router, ConnectionKind::Client);
        let ack = router.handle_message(conn, ClientMessage::Ping).await.unwrap();
        assert!(matches!(ack, Some(ServerMessage::Pong)));
    }
}
