//! Channel fan-out engine.
//!
//! Multiplexes many logical channels over a small number of transport
//! connections. Publishers push sparse deltas onto a channel; the channel
//! folds them into its running payload and, on every tick, fans the
//! accumulated state out to each subscriber at that subscriber's own
//! cadence.
//!
//! ## Architecture
//!
//! ```text
//! publisher ──▶ Router ──▶ Channel executor (one task per channel)
//!                              ├─ ChannelData: current payload + update log
//!                              └─ fan-out tick: per-subscriber coalesced deltas
//!                                     ↓
//!                          ConnectionRegistry ──▶ subscriber queues
//! ```
//!
//! Channel state is owned by a single task; every mutation goes through its
//! command queue. Subscribers reference connections by id only, so a
//! dropped connection cleans itself up on the next fan-out.

pub mod channel;
pub mod connection;
pub mod data;
pub mod error;
pub mod fanout;
pub mod merge;
pub mod payload;
pub mod proto;
pub mod router;
pub mod subscription;
pub mod time;

pub use channel::{ChannelHandle, ChannelId, ChannelKind, ChannelSnapshot, ChannelState};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionKind, ConnectionRegistry};
pub use data::{ChannelData, Update};
pub use error::{EngineError, Result};
pub use merge::{merge_values, MergeOptions};
pub use payload::{Payload, PayloadCodec};
pub use proto::{ClientMessage, ServerMessage};
pub use router::Router;
pub use subscription::{SubscriptionInfo, SubscriptionOptions};
pub use time::ChannelTime;
