//! Quick end-to-end exercise against a running gateway.
//!
//! Connects as a server peer, creates a room channel, subscribes to it,
//! publishes a few deltas, and prints the fan-out that comes back.

use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[tokio::main]
async fn main() {
    let url = std::env::var("GATEWAY_URL")
        .unwrap_or_else(|_| "ws://127.0.0.1:8081/ws?kind=server".to_string());
    println!("Connecting to {url}...");
    let (mut ws, _) = connect_async(&url).await.expect("connect failed");

    let create = json!({
        "type": "create_channel",
        "kind": "room",
        "type_tag": "demo.Room",
        "data": { "topic": "demo", "messages": [] },
        "merge_options": { "list_size_limit": 16, "truncate_top": true },
    });
    ws.send(Message::text(create.to_string())).await.unwrap();

    // Wait for the creation ack to learn the channel id.
    let channel_id = loop {
        let msg = ws.next().await.expect("connection closed").unwrap();
        if let Message::Text(text) = msg {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            println!("<- {value}");
            if value["type"] == "channel_created" {
                break value["channel_id"].clone();
            }
        }
    };

    let subscribe = json!({
        "type": "subscribe",
        "channel_id": channel_id,
        "options": { "fan_out_interval_ms": 100 },
    });
    ws.send(Message::text(subscribe.to_string())).await.unwrap();

    for i in 0..3 {
        let update = json!({
            "type": "update",
            "channel_id": channel_id,
            "data": { "messages": [format!("hello {i}")] },
        });
        ws.send(Message::text(update.to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    // Print whatever fan-out arrived.
    while let Ok(Some(Ok(msg))) = tokio::time::timeout(Duration::from_millis(500), ws.next()).await
    {
        if let Message::Text(text) = msg {
            println!("<- {text}");
        }
    }
}
