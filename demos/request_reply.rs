//! Request/reply demo.
//!
//! This example demonstrates:
//! - A queue-group responder answering requests
//! - A single request with the default timeout
//! - Scatter-gather with `request_many`
//! - The no-responders fast failure
//!
//! # Running
//!
//! ```sh
//! nats-server &
//! RUST_LOG=natswire_client=debug cargo run --example request_reply
//! ```

use std::time::Duration;

use natswire_client::{Client, HandlerError, Message, NatsError};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = Client::builder()
        .name("request-reply-demo")
        .request_timeout(Duration::from_secs(2))
        .connect("127.0.0.1", 4222)
        .await?;

    // Two workers share the load; each request reaches one of them.
    for worker in 0..2 {
        client.queue_reply("text.upper", "upper-workers", move |msg: Message| async move {
            let text = msg.payload_str().unwrap_or_default().to_uppercase();
            Ok::<_, HandlerError>(format!("{} (worker {})", text, worker))
        })?;
    }

    // Every instance answers a census.
    for instance in ["east", "west", "north"] {
        client.reply("census", move |_msg: Message| async move {
            Ok::<_, HandlerError>(instance)
        })?;
    }
    client.flush(Duration::from_secs(1)).await?;

    let reply = client.request("text.upper", "hello").await?;
    println!("upper: {}", reply.payload_str().unwrap_or("<binary>"));

    let members = client
        .request_many("census", "", 10, Duration::from_millis(250))
        .await?;
    for member in &members {
        println!("census: {}", member.payload_str().unwrap_or("<binary>"));
    }

    match client.request("nobody.listens", "?").await {
        Err(NatsError::NoResponders) => println!("no responders, as expected"),
        other => println!("unexpected: {:?}", other.map(|m| m.payload)),
    }

    client.drain().await?;
    Ok(())
}
