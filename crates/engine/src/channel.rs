//! Channels and their single-writer executors.
//!
//! Every channel owns its data, its subscriptions, and its logical clock on
//! a dedicated task. Callers enqueue commands on a bounded queue and may
//! await a reply; queue depth is the only backpressure at this layer. The
//! task is the sole mutator, so no channel state is ever shared across
//! tasks.

use crate::connection::{ConnectionId, ConnectionKind, ConnectionRegistry};
use crate::data::ChannelData;
use crate::error::{EngineError, Result};
use crate::fanout::tick_fan_out;
use crate::merge::MergeOptions;
use crate::payload::{Payload, PayloadCodec};
use crate::proto::ServerMessage;
use crate::subscription::{Subscription, SubscriptionInfo, SubscriptionOptions};
use crate::time::ChannelTime;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, trace, warn};

/// Unique channel identifier. Id 0 is the global channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChannelId(u32);

impl ChannelId {
    pub const GLOBAL: ChannelId = ChannelId(0);

    pub fn new(id: u32) -> Self {
        ChannelId(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Global,
    Room,
    Private,
    Test,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Global => "global",
            ChannelKind::Room => "room",
            ChannelKind::Private => "private",
            ChannelKind::Test => "test",
        }
    }
}

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, no data yet.
    Open,
    /// Data initialized; ticking and fanning out.
    Live,
    /// Tearing down; new work is rejected.
    Closing,
    Closed,
}

/// Point-in-time view of a channel's state, taken on its executor.
#[derive(Debug)]
pub struct ChannelSnapshot {
    pub state: ChannelState,
    pub clock: ChannelTime,
    pub last_update_time: ChannelTime,
    pub log_len: usize,
    pub subscriptions: Vec<SubscriptionInfo>,
    pub current: Option<Payload>,
}

pub(crate) enum ChannelCommand {
    InitData {
        initial: Payload,
        options: MergeOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    Update {
        delta: Payload,
        time: Option<ChannelTime>,
        originator: Option<ConnectionId>,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        conn_id: ConnectionId,
        options: SubscriptionOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        conn_id: ConnectionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Tick {
        now: ChannelTime,
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        conn_id: ConnectionId,
    },
    Snapshot {
        reply: oneshot::Sender<ChannelSnapshot>,
    },
    Close,
}

const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Cheap handle to a channel's executor.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    kind: ChannelKind,
    owner: Option<ConnectionId>,
    type_tag: Arc<str>,
    tx: mpsc::Sender<ChannelCommand>,
}

impl ChannelHandle {
    /// Spawn a channel executor. With `initial` data the channel starts
    /// Live; otherwise it stays Open until `init_data`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: ChannelId,
        kind: ChannelKind,
        owner: Option<ConnectionId>,
        type_tag: Arc<str>,
        tick_interval: Duration,
        initial: Option<(Payload, MergeOptions)>,
        registry: Arc<ConnectionRegistry>,
        codec: Arc<PayloadCodec>,
    ) -> ChannelHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let runner = ChannelRunner {
            id,
            kind,
            owner,
            state: if initial.is_some() {
                ChannelState::Live
            } else {
                ChannelState::Open
            },
            data: initial.map(|(payload, options)| {
                ChannelData::new(payload, options, codec.clone())
            }),
            subscriptions: Vec::new(),
            registry,
            codec,
            clock: ChannelTime::ZERO,
            tick_interval: tick_interval.max(Duration::from_millis(1)),
        };
        tokio::spawn(runner.run(rx));
        ChannelHandle {
            id,
            kind,
            owner,
            type_tag,
            tx,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    pub fn type_tag(&self) -> &Arc<str> {
        &self.type_tag
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ChannelCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosing(self.id))?;
        reply_rx
            .await
            .map_err(|_| EngineError::ChannelClosing(self.id))
    }

    /// Initialize the channel's data. Valid once per lifetime.
    pub async fn init_data(&self, initial: Payload, options: MergeOptions) -> Result<()> {
        self.request(|reply| ChannelCommand::InitData {
            initial,
            options,
            reply,
        })
        .await?
    }

    /// Publish a delta. Without an explicit time the update is stamped with
    /// the channel clock.
    pub async fn update(
        &self,
        delta: Payload,
        time: Option<ChannelTime>,
        originator: Option<ConnectionId>,
    ) -> Result<()> {
        self.request(|reply| ChannelCommand::Update {
            delta,
            time,
            originator,
            reply,
        })
        .await?
    }

    /// Subscribe, or update an existing subscription's options.
    pub async fn subscribe(
        &self,
        conn_id: ConnectionId,
        options: SubscriptionOptions,
    ) -> Result<()> {
        self.request(|reply| ChannelCommand::Subscribe {
            conn_id,
            options,
            reply,
        })
        .await?
    }

    pub async fn unsubscribe(&self, conn_id: ConnectionId) -> Result<()> {
        self.request(|reply| ChannelCommand::Unsubscribe { conn_id, reply })
            .await?
    }

    /// Advance the channel clock to `now` and run one fan-out pass.
    /// Channels also tick themselves on their configured interval; this
    /// entry point drives tests and administrative catch-up.
    pub async fn tick(&self, now: ChannelTime) -> Result<()> {
        self.request(|reply| ChannelCommand::Tick { now, reply }).await
    }

    /// Request a state snapshot from the executor.
    pub async fn snapshot(&self) -> Result<ChannelSnapshot> {
        self.request(|reply| ChannelCommand::Snapshot { reply }).await
    }

    /// Detach a disconnected peer: drops its subscription, and closes the
    /// channel when the peer owned it.
    pub async fn notify_disconnect(&self, conn_id: ConnectionId) {
        let _ = self.tx.send(ChannelCommand::Disconnect { conn_id }).await;
    }

    /// Begin channel teardown.
    pub async fn close(&self) {
        let _ = self.tx.send(ChannelCommand::Close).await;
    }
}

struct ChannelRunner {
    id: ChannelId,
    kind: ChannelKind,
    owner: Option<ConnectionId>,
    state: ChannelState,
    data: Option<ChannelData>,
    subscriptions: Vec<Subscription>,
    registry: Arc<ConnectionRegistry>,
    codec: Arc<PayloadCodec>,
    clock: ChannelTime,
    tick_interval: Duration,
}

impl ChannelRunner {
    async fn run(mut self, mut rx: mpsc::Receiver<ChannelCommand>) {
        gauge!("gateway_channel_num", "type" => self.kind.as_str()).increment(1.0);
        info!(channel = %self.id, kind = self.kind.as_str(), "channel started");

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();

        loop {
            tokio::select! {
                biased;

                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match panic::catch_unwind(AssertUnwindSafe(|| self.on_command(cmd))) {
                        Ok(ControlFlow::Continue(())) => {}
                        Ok(ControlFlow::Break(())) => break,
                        Err(_) => {
                            error!(channel = %self.id, "channel executor panicked; closing");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.clock = self.clock.add_duration(self.tick_interval);
                    let now = self.clock;
                    if panic::catch_unwind(AssertUnwindSafe(|| self.tick_now(now))).is_err() {
                        error!(channel = %self.id, "channel tick panicked; closing");
                        break;
                    }
                }
            }
        }

        // Cancel enqueued work before tearing down; in-flight senders see
        // the queue as closing.
        rx.close();
        self.shutdown();
    }

    fn on_command(&mut self, cmd: ChannelCommand) -> ControlFlow<()> {
        match cmd {
            ChannelCommand::InitData {
                initial,
                options,
                reply,
            } => {
                let result = if self.data.is_some() {
                    Err(EngineError::AlreadyInitialized(self.id))
                } else {
                    self.data = Some(ChannelData::new(initial, options, self.codec.clone()));
                    self.state = ChannelState::Live;
                    info!(channel = %self.id, "channel data initialized");
                    Ok(())
                };
                let _ = reply.send(result);
            }
            ChannelCommand::Update {
                delta,
                time,
                originator,
                reply,
            } => {
                let _ = reply.send(self.on_update(delta, time, originator));
            }
            ChannelCommand::Subscribe {
                conn_id,
                options,
                reply,
            } => {
                self.on_subscribe(conn_id, &options);
                let _ = reply.send(Ok(()));
            }
            ChannelCommand::Unsubscribe { conn_id, reply } => {
                self.subscriptions.retain(|sub| sub.conn_id != conn_id);
                let _ = reply.send(Ok(()));
            }
            ChannelCommand::Tick { now, reply } => {
                self.clock = self.clock.max(now);
                self.tick_now(now);
                let _ = reply.send(());
            }
            ChannelCommand::Disconnect { conn_id } => {
                self.subscriptions.retain(|sub| sub.conn_id != conn_id);
                if self.owner == Some(conn_id) {
                    info!(channel = %self.id, owner = %conn_id, "owner disconnected; closing channel");
                    return ControlFlow::Break(());
                }
            }
            ChannelCommand::Snapshot { reply } => {
                let _ = reply.send(ChannelSnapshot {
                    state: self.state,
                    clock: self.clock,
                    last_update_time: self
                        .data
                        .as_ref()
                        .map(|d| d.last_update_time())
                        .unwrap_or_default(),
                    log_len: self.data.as_ref().map(|d| d.log_len()).unwrap_or(0),
                    subscriptions: self.subscriptions.iter().map(|sub| sub.info()).collect(),
                    current: self.data.as_ref().map(|d| d.current().clone()),
                });
            }
            ChannelCommand::Close => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn on_update(
        &mut self,
        delta: Payload,
        time: Option<ChannelTime>,
        originator: Option<ConnectionId>,
    ) -> Result<()> {
        if let Some(conn_id) = originator {
            if !self.may_publish(conn_id) {
                return Err(EngineError::NotAuthorized("publish to this channel"));
            }
        }
        let Some(data) = self.data.as_mut() else {
            warn!(channel = %self.id, "dropping update for uninitialized channel");
            counter!("gateway_updates_dropped_total").increment(1);
            return Ok(());
        };
        let t = time.unwrap_or(self.clock);
        match data.on_update(delta, t, originator) {
            Ok(()) => Ok(()),
            Err(err @ EngineError::OutOfOrder { .. }) => {
                warn!(channel = %self.id, %err, "dropping out-of-order update");
                counter!("gateway_updates_dropped_total").increment(1);
                Ok(())
            }
            Err(err) => {
                counter!("gateway_updates_dropped_total").increment(1);
                Err(err)
            }
        }
    }

    /// Publishing is restricted to the owner and subscribed server peers.
    fn may_publish(&self, conn_id: ConnectionId) -> bool {
        if self.owner == Some(conn_id) {
            return true;
        }
        self.subscriptions.iter().any(|sub| sub.conn_id == conn_id)
            && self
                .registry
                .get(&conn_id)
                .is_some_and(|conn| conn.kind == ConnectionKind::Server)
    }

    fn on_subscribe(&mut self, conn_id: ConnectionId, options: &SubscriptionOptions) {
        let interval = options
            .fan_out_interval_ms
            .map(|ms| i64::from(ms) * 1_000_000)
            .unwrap_or(self.tick_interval.as_nanos() as i64)
            .max(1);

        match self
            .subscriptions
            .iter_mut()
            .find(|sub| sub.conn_id == conn_id)
        {
            // Idempotent: options are refreshed, delivery state is kept.
            Some(sub) => {
                sub.fan_out_interval = interval;
                sub.next_fan_out_at = self.clock;
                sub.field_mask = options.field_mask.clone();
            }
            None => {
                let log_len = self.data.as_ref().map(|d| d.log_len()).unwrap_or(0);
                self.subscriptions.push(Subscription::new(
                    conn_id,
                    interval,
                    self.clock,
                    log_len,
                    options.field_mask.clone(),
                ));
            }
        }
        trace!(channel = %self.id, conn = %conn_id, "subscription updated");
    }

    fn tick_now(&mut self, now: ChannelTime) {
        if self.state != ChannelState::Live {
            return;
        }
        let Some(data) = self.data.as_mut() else {
            return;
        };
        let sent = tick_fan_out(self.id, data, &mut self.subscriptions, &self.registry, now);
        if sent > 0 {
            trace!(channel = %self.id, %now, sent, "fan-out tick");
        }
    }

    fn shutdown(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closing;

        // Late joiners still get one snapshot of the final state.
        if let Some(data) = &self.data {
            for sub in self
                .subscriptions
                .iter()
                .filter(|sub| !sub.has_received_initial)
            {
                self.registry.send(
                    &sub.conn_id,
                    ServerMessage::Update {
                        channel_id: self.id,
                        data: data.current().value().clone(),
                    },
                );
            }
        }
        for sub in &self.subscriptions {
            self.registry.send(
                &sub.conn_id,
                ServerMessage::ChannelClosed { channel_id: self.id },
            );
        }
        self.subscriptions.clear();

        self.state = ChannelState::Closed;
        gauge!("gateway_channel_num", "type" => self.kind.as_str()).decrement(1.0);
        info!(channel = %self.id, "channel closed");
    }
}
