//! WebSocket gateway for channel fan-out streaming.
//!
//! This service:
//! - Accepts WebSocket connections from server and client peers
//! - Lets authorized peers create channels and publish sparse deltas
//! - Fans channel state out to each subscriber at its own cadence
//!
//! ## Architecture
//!
//! ```text
//! WebSocket peers
//!         ↓
//! ws_server (axum, one pump task per socket)
//!         ↓
//! engine::Router → per-channel executors → subscriber queues
//! ```
//!
//! ## Low-Latency Design
//!
//! - Lock-free connection registry (DashMap)
//! - One single-writer task per channel; no shared channel state
//! - Unbounded per-connection outbound queues so fan-out never blocks

pub mod error;
pub mod ws_server;

pub use error::{GatewayError, Result};
pub use ws_server::{create_router, AppState};
