//! WebSocket server handler using Axum.

use crate::error::{GatewayError, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use engine::{ConnectionHandle, ConnectionKind, ServerMessage};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Shared application state.
pub struct AppState {
    pub router: Arc<engine::Router>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.router.connections().count();
    let channels = state.router.channel_count();
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds();
    format!(
        r#"{{"status":"ok","connections":{},"channels":{},"uptime_s":{}}}"#,
        connections, channels, uptime
    )
}

#[derive(Debug, Deserialize)]
struct WsParams {
    /// Role of the connecting peer; defaults to client.
    kind: Option<ConnectionKind>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let kind = params.kind.unwrap_or(ConnectionKind::Client);
    ws.on_upgrade(move |socket| handle_socket(socket, state, kind))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, kind: ConnectionKind) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound queue: channel executors enqueue here, this task owns the
    // socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let conn = Arc::new(ConnectionHandle::new(kind, tx));
    let conn_id = state.router.connections().register(conn.clone());

    counter!("gateway_connections_total").increment(1);
    info!(conn = %conn_id, kind = kind.as_str(), "peer connected");

    // Forward queued messages to the socket and ping it on idle stretches.
    let send_task = tokio::spawn(async move {
        let mut ping_interval = interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(err) => {
                            warn!(%err, "failed to serialize outbound message");
                            continue;
                        }
                    };
                    counter!("gateway_packets_out_total").increment(1);
                    counter!("gateway_bytes_out_total").increment(json.len() as u64);
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut idle_check = interval(PING_INTERVAL);
    idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        last_seen = Instant::now();
                        if let Err(err) = handle_message(&state, &conn, msg).await {
                            warn!(conn = %conn_id, %err, "error handling message");
                            let _ = conn.send(ServerMessage::Error {
                                code: err.code().to_string(),
                                message: err.to_string(),
                            });
                        }
                    }
                    Some(Err(err)) => {
                        warn!(conn = %conn_id, %err, "websocket error");
                        break;
                    }
                    None => break,
                }
            }

            _ = idle_check.tick() => {
                if last_seen.elapsed() > IDLE_TIMEOUT {
                    warn!(conn = %conn_id, "peer idle; closing");
                    break;
                }
            }
        }
    }

    state.router.disconnect(conn_id).await;
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    info!(conn = %conn_id, "peer disconnected");
}

/// Handle a single WebSocket message.
async fn handle_message(
    state: &Arc<AppState>,
    conn: &Arc<ConnectionHandle>,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Text(text) => {
            counter!("gateway_packets_in_total").increment(1);
            counter!("gateway_bytes_in_total").increment(text.len() as u64);
            let client_msg = serde_json::from_str(&text)?;
            dispatch(state, conn, client_msg).await
        }
        Message::Binary(data) => {
            counter!("gateway_packets_in_total").increment(1);
            counter!("gateway_bytes_in_total").increment(data.len() as u64);
            let client_msg = serde_json::from_slice(&data)?;
            dispatch(state, conn, client_msg).await
        }
        // Transport-level ping/pong already refreshed the idle clock.
        Message::Ping(_) | Message::Pong(_) => Ok(()),
        Message::Close(_) => Ok(()),
    }
}

/// Route a parsed message and deliver its acknowledgement.
async fn dispatch(
    state: &Arc<AppState>,
    conn: &Arc<ConnectionHandle>,
    msg: engine::ClientMessage,
) -> Result<()> {
    debug!(conn = %conn.id, ?msg, "dispatching");
    if let Some(ack) = state.router.handle_message(conn.id, msg).await? {
        if !conn.send(ack) {
            return Err(GatewayError::ChannelSend);
        }
    }
    Ok(())
}
