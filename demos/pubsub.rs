//! Publish/subscribe demo.
//!
//! This example demonstrates:
//! - Connecting with the builder and a client name
//! - A wildcard subscription with a typed handler
//! - Publishing with headers and flushing
//! - Draining before exit
//!
//! # Running
//!
//! ```sh
//! nats-server &
//! RUST_LOG=natswire_client=debug cargo run --example pubsub
//! ```

use std::time::Duration;

use natswire_client::{Client, HandlerError, Headers, Message};
use serde::{Deserialize, Serialize};

/// A temperature reading, carried as JSON.
#[derive(Serialize, Deserialize, Debug)]
struct Reading {
    room: String,
    celsius: f32,
}

impl TryFrom<Message> for Reading {
    type Error = HandlerError;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        Ok(serde_json::from_slice(&msg.payload)?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = Client::builder()
        .name("pubsub-demo")
        .connect("127.0.0.1", 4222)
        .await?;

    client.subscribe_typed("sensors.*.temperature", |reading: Reading| async move {
        println!("{}: {:.1}°C", reading.room, reading.celsius);
        Ok::<(), HandlerError>(())
    })?;

    for (room, celsius) in [("kitchen", 21.5), ("attic", 17.25), ("cellar", 12.0)] {
        let payload = serde_json::to_vec(&Reading {
            room: room.to_string(),
            celsius,
        })?;
        let headers = Headers::new().with("Content-Type", "application/json");
        client.publish_with_headers(&format!("sensors.{}.temperature", room), headers, payload)?;
    }
    client.flush(Duration::from_secs(1)).await?;

    // Handlers finish what is buffered before the connection closes.
    client.drain().await?;
    Ok(())
}
