//! Handler capability and its closure adapters.
//!
//! Handlers are anything implementing [`MessageHandler`]. Closures are
//! wrapped by [`FnHandler`] (raw [`Message`]) or [`TypedHandler`], which runs
//! the `TryFrom<Message>` conversion first. Conversion failures are handler
//! errors and are reported like any other.

use std::error::Error as StdError;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use crate::message::Message;

/// Error type handlers may return.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Result type for handler functions.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for message handlers.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one delivered message.
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that passes the raw message to a closure.
pub struct FnHandler<F> {
    handler: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new raw handler.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(message))
    }
}

/// Wrapper that converts the message before calling the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: TryFrom<Message> + Send + 'static,
    T::Error: Into<HandlerError>,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: TryFrom<Message> + Send + 'static,
    T::Error: Into<HandlerError>,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> MessageHandler for TypedHandler<F, T, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: TryFrom<Message> + Send + 'static,
    T::Error: Into<HandlerError>,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerResult> {
        let parsed = match T::try_from(message) {
            Ok(v) => v,
            Err(e) => {
                let e: HandlerError = e.into();
                return Box::pin(async move { Err(e) });
            }
        };

        Box::pin((self.handler)(parsed))
    }
}
