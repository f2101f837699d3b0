//! Handler module - subscription bookkeeping and handler dispatch.
//!
//! Provides:
//! - [`MessageHandler`] - the handler capability, with closure adapters
//!   [`FnHandler`] and [`TypedHandler`]
//! - [`DispatchMode`] - sequential or bounded-concurrent handler scheduling
//! - the internal subscription registry that routes inbound messages by sid
//!
//! # Example
//!
//! ```
//! use natswire_client::handler::{HandlerError, MessageHandler, TypedHandler};
//! use natswire_client::Message;
//!
//! struct Temperature(f64);
//!
//! impl TryFrom<Message> for Temperature {
//!     type Error = HandlerError;
//!
//!     fn try_from(msg: Message) -> Result<Self, Self::Error> {
//!         let text = msg.payload_str().ok_or("not UTF-8")?;
//!         Ok(Temperature(text.trim().parse()?))
//!     }
//! }
//!
//! let handler = TypedHandler::new(|t: Temperature| async move {
//!     println!("{:.1} degrees", t.0);
//!     Ok(())
//! });
//! # fn assert_handler<H: MessageHandler>(_: &H) {}
//! # assert_handler(&handler);
//! ```

mod callback;
pub(crate) mod dispatch;
pub(crate) mod registry;

pub use callback::{BoxFuture, FnHandler, HandlerError, HandlerResult, MessageHandler, TypedHandler};
pub use dispatch::{DispatchMode, DEFAULT_MAX_IN_FLIGHT};
