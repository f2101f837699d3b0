//! # natswire-client
//!
//! Async client for the NATS text protocol.
//!
//! The crate has two layers:
//!
//! - **Protocol** ([`protocol`]): a pure codec for every NATS verb.
//!   [`FrameBuffer`](protocol::FrameBuffer) turns bytes into
//!   [`Frame`](protocol::Frame)s incrementally; frames encode back to bytes.
//! - **Runtime** ([`Client`]): a connection supervisor with a reader task, a
//!   batching writer task, per-subscription handler workers, request/reply
//!   over inboxes, reconnect with subscription replay, and graceful drain.
//!
//! ## Example
//!
//! ```no_run
//! use natswire_client::{Client, Message};
//!
//! #[tokio::main]
//! async fn main() -> natswire_client::Result<()> {
//!     let client = Client::builder().connect("127.0.0.1", 4222).await?;
//!
//!     let sub = client.subscribe("sensors.*.temperature", |msg: Message| async move {
//!         println!("{}: {:?}", msg.subject, msg.payload_str());
//!         Ok(())
//!     })?;
//!
//!     client.publish("sensors.kitchen.temperature", "21.5")?;
//!     client.flush(std::time::Duration::from_secs(1)).await?;
//!
//!     sub.unsubscribe().await?;
//!     client.drain().await
//! }
//! ```

pub mod default_client;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod subject;
pub mod transport;

mod backpressure;
mod client;
mod connection;
mod diagnostics;
mod keepalive;
mod message;
mod options;
mod reader;
mod request;
mod state;
mod subscription;
mod supervisor;
mod writer;

pub use backpressure::DEFAULT_MAX_PENDING;
pub use client::{Client, ClientBuilder};
pub use diagnostics::{Diagnostic, DEFAULT_DIAGNOSTICS_INTERVAL};
pub use error::{NatsError, Result};
pub use handler::{DispatchMode, FnHandler, HandlerError, HandlerResult, MessageHandler, TypedHandler};
pub use message::{Message, Reply};
pub use options::{
    Options, ReconnectMode, ReconnectPolicy, SubscribeOptions, DEFAULT_INBOX_PREFIX,
    DEFAULT_SUBSCRIPTION_CAPACITY,
};
pub use protocol::{Headers, ServerInfo};
pub use request::{new_inbox, Request};
pub use state::ConnectionState;
pub use subscription::Subscription;
pub use transport::{ServerAddr, TcpTransport, Transport};
