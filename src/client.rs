//! Client builder and handle.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring a connection.
//! Connecting:
//! 1. Opens the transport to the first reachable server
//! 2. Reads INFO, sends CONNECT and confirms it with PING/PONG
//! 3. Spawns the supervisor, which runs the reader and writer tasks and
//!    reconnects when a session is lost
//!
//! The returned [`Client`] is a cheap, cloneable handle. The connection
//! closes when [`Client::close`] or [`Client::drain`] is called, or when the
//! last handle is dropped.
//!
//! # Example
//!
//! ```no_run
//! use natswire_client::{Client, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .name("greeter")
//!         .connect("127.0.0.1", 4222)
//!         .await?;
//!
//!     client.reply("greet", |msg: Message| async move {
//!         let name = msg.payload_str().unwrap_or("stranger").to_string();
//!         Ok(format!("hello, {}", name))
//!     })?;
//!
//!     let answer = client.request("greet", "world").await?;
//!     assert_eq!(answer.payload_str(), Some("hello, world"));
//!
//!     client.drain().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::connection::{Command, ConnectionInner};
use crate::diagnostics::Diagnostic;
use crate::error::{NatsError, Result};
use crate::handler::{
    BoxFuture, DispatchMode, FnHandler, HandlerError, HandlerResult, MessageHandler, TypedHandler,
};
use crate::message::{Message, Reply};
use crate::options::{Options, ReconnectPolicy, SubscribeOptions};
use crate::protocol::{Headers, ServerInfo};
use crate::request::{self, Request};
use crate::state::ConnectionState;
use crate::subscription::Subscription;
use crate::supervisor::{ServerPool, Supervisor};
use crate::transport::{ServerAddr, TcpTransport, Transport};

/// Builder for configuring and connecting a client.
pub struct ClientBuilder {
    options: Options,
    cancellation: Option<CancellationToken>,
}

impl ClientBuilder {
    /// Create a new client builder with default options.
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    /// Start from a complete set of options.
    pub fn with_options(options: Options) -> Self {
        Self {
            options,
            cancellation: None,
        }
    }

    /// Client name reported to the server.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    /// Authenticate with user and password.
    pub fn user_and_password(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.options.user = Some(user.into());
        self.options.pass = Some(pass.into());
        self
    }

    /// Authenticate with a token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.options.token = Some(token.into());
        self
    }

    pub fn jwt(mut self, jwt: impl Into<String>) -> Self {
        self.options.jwt = Some(jwt.into());
        self
    }

    /// Ask the server to acknowledge every frame with `+OK`.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.options.verbose = verbose;
        self
    }

    pub fn pedantic(mut self, pedantic: bool) -> Self {
        self.options.pedantic = pedantic;
        self
    }

    /// Receive messages this connection publishes.
    ///
    /// Default: true
    pub fn echo(mut self, echo: bool) -> Self {
        self.options.echo = echo;
        self
    }

    pub fn tls_required(mut self, required: bool) -> Self {
        self.options.tls_required = required;
        self
    }

    /// Advertise header support.
    ///
    /// Default: true
    pub fn headers(mut self, enabled: bool) -> Self {
        self.options.headers = enabled;
        self
    }

    /// Ask for fast "no responders" failures on requests.
    ///
    /// Default: true
    pub fn no_responders(mut self, enabled: bool) -> Self {
        self.options.no_responders = enabled;
        self
    }

    /// Bound on connecting and completing the handshake, per server.
    ///
    /// Default: 2 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Default deadline for [`Client::request`].
    ///
    /// Default: 5 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    /// Interval between keepalive PINGs.
    ///
    /// Default: 2 minutes
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.options.ping_interval = interval;
        self
    }

    /// Unanswered keepalive PINGs before the connection counts as stale.
    ///
    /// Default: 2
    pub fn max_pings_outstanding(mut self, max: usize) -> Self {
        self.options.max_pings_outstanding = max;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.options.reconnect = policy;
        self
    }

    /// Set the maximum pending outbound frames.
    ///
    /// When this limit is reached, publishes fail with `Capacity`.
    /// Default: 8192
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.options.max_pending_frames = limit;
        self
    }

    /// Default buffer size of each subscription.
    ///
    /// Default: 512
    pub fn subscription_capacity(mut self, capacity: usize) -> Self {
        self.options.subscription_capacity = capacity;
        self
    }

    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.options.dispatch_mode = mode;
        self
    }

    pub fn inbox_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.inbox_prefix = prefix.into();
        self
    }

    /// Bound on [`Client::drain`].
    ///
    /// Default: 30 seconds
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.options.drain_timeout = timeout;
        self
    }

    /// Rate-limit window of the diagnostics channel.
    ///
    /// Default: 1 second
    pub fn diagnostics_interval(mut self, interval: Duration) -> Self {
        self.options.diagnostics_interval = interval;
        self
    }

    pub fn max_control_line(mut self, max: usize) -> Self {
        self.options.max_control_line = max;
        self
    }

    /// Add a fallback server.
    pub fn server(mut self, addr: ServerAddr) -> Self {
        self.options.servers.push(addr);
        self
    }

    /// Close the connection when `token` is cancelled.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Connect over TCP.
    pub async fn connect(self, host: &str, port: u16) -> Result<Client> {
        self.connect_with_transport(ServerAddr::new(host, port), TcpTransport)
            .await
    }

    /// Connect to a `nats://` or `tls://` address.
    pub async fn connect_url(self, url: &str) -> Result<Client> {
        let addr: ServerAddr = url.parse()?;
        self.connect_with_transport(addr, TcpTransport).await
    }

    /// Connect through a custom transport, e.g. one that upgrades to TLS.
    pub async fn connect_with_transport<T: Transport>(
        self,
        addr: ServerAddr,
        transport: T,
    ) -> Result<Client> {
        let shutdown = match &self.cancellation {
            Some(token) => token.child_token(),
            None => CancellationToken::new(),
        };
        let servers = self.options.servers.clone();
        let (inner, commands, queue) = ConnectionInner::new(self.options, shutdown);

        let pool = ServerPool::new(addr, servers);
        let mut supervisor =
            Supervisor::new(inner.clone(), Arc::new(transport), queue, pool, commands);
        let session = supervisor.connect().await?;
        tokio::spawn(supervisor.run(session));

        Ok(Client::new(inner))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected NATS client.
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ConnectionInner>,
    /// Closes the connection when the last handle goes away.
    _close_on_drop: Arc<DropGuard>,
}

impl Client {
    fn new(inner: Arc<ConnectionInner>) -> Self {
        let guard = inner.shutdown.clone().drop_guard();
        Self {
            inner,
            _close_on_drop: Arc::new(guard),
        }
    }

    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect over TCP with the given options.
    pub async fn connect(host: &str, port: u16, options: Options) -> Result<Client> {
        ClientBuilder::with_options(options)
            .connect(host, port)
            .await
    }

    /// Publish a message.
    ///
    /// Returns once the frame is queued; fails fast with `Capacity` when the
    /// outbound buffer is full.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.inner
            .publish_message(subject, None, None, payload.into())
    }

    /// Publish a message that expects replies on `reply_to`.
    pub fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.inner
            .publish_message(subject, Some(reply_to), None, payload.into())
    }

    /// Publish a message with headers.
    pub fn publish_with_headers(
        &self,
        subject: &str,
        headers: Headers,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.inner
            .publish_message(subject, None, Some(headers), payload.into())
    }

    /// Publish with every field spelled out.
    pub fn publish_message(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        headers: Option<Headers>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.inner
            .publish_message(subject, reply_to, headers, payload.into())
    }

    /// Subscribe a closure to `subject`. Wildcards are allowed.
    pub fn subscribe<F, Fut>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_with(subject, SubscribeOptions::default(), FnHandler::new(handler))
    }

    /// Subscribe as a member of a queue group; each message goes to one member.
    pub fn queue_subscribe<F, Fut>(
        &self,
        subject: &str,
        queue_group: &str,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_with(
            subject,
            SubscribeOptions::new().queue_group(queue_group),
            FnHandler::new(handler),
        )
    }

    /// Subscribe with explicit options and any [`MessageHandler`].
    pub fn subscribe_with<H: MessageHandler>(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: H,
    ) -> Result<Subscription> {
        let queue_group = options.queue_group.clone();
        let sid = self
            .inner
            .subscribe_with_handler(subject, options, Arc::new(handler))?;
        Ok(Subscription::new(
            sid,
            subject,
            queue_group,
            Arc::downgrade(&self.inner),
        ))
    }

    /// Subscribe a handler that takes a type converted from each message.
    ///
    /// Conversion failures are reported like handler errors.
    pub fn subscribe_typed<T, F, Fut>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: TryFrom<Message> + Send + 'static,
        T::Error: Into<HandlerError>,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_with(subject, SubscribeOptions::default(), TypedHandler::new(handler))
    }

    /// Unsubscribe now, or after `max_msgs` messages in total.
    pub async fn unsubscribe(&self, subscription: &Subscription, max_msgs: Option<u64>) -> Result<()> {
        self.inner.unsubscribe(subscription.sid(), max_msgs).await
    }

    /// Send a request and wait for one reply, up to the default timeout.
    pub async fn request(&self, subject: &str, payload: impl Into<Bytes>) -> Result<Message> {
        self.request_timeout(subject, payload, self.inner.options.request_timeout)
            .await
    }

    /// Send a request and wait for one reply, up to `timeout`.
    pub async fn request_timeout(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        let replies = self
            .send_request(Request::new(subject, payload).timeout(timeout))
            .await?;
        replies.into_iter().next().ok_or(NatsError::NoReplies)
    }

    /// Collect up to `count` replies within `timeout`.
    ///
    /// Returns whatever arrived in time, possibly nothing.
    pub async fn request_many(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        count: u64,
        timeout: Duration,
    ) -> Result<Vec<Message>> {
        self.send_request(
            Request::new(subject, payload)
                .replies(count)
                .timeout(timeout),
        )
        .await
    }

    /// Send a fully specified request.
    pub async fn send_request(&self, request: Request) -> Result<Vec<Message>> {
        request::send(&self.inner, request).await
    }

    /// A fresh inbox subject under the configured prefix.
    pub fn new_inbox(&self) -> String {
        request::new_inbox(&self.inner.options.inbox_prefix)
    }

    /// Answer requests on `subject` with the handler's return value.
    pub fn reply<F, Fut, R>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
        R: Into<Reply> + 'static,
    {
        self.subscribe_with(
            subject,
            SubscribeOptions::default(),
            Responder::new(Arc::downgrade(&self.inner), handler),
        )
    }

    /// Like [`reply`](Self::reply), as a member of a queue group.
    pub fn queue_reply<F, Fut, R>(
        &self,
        subject: &str,
        queue_group: &str,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
        R: Into<Reply> + 'static,
    {
        self.subscribe_with(
            subject,
            SubscribeOptions::new().queue_group(queue_group),
            Responder::new(Arc::downgrade(&self.inner), handler),
        )
    }

    /// Like [`reply`](Self::reply), with the request converted to `T` first.
    ///
    /// A request that fails to convert gets no reply and is reported like a
    /// handler error.
    pub fn reply_typed<T, F, Fut, R>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: TryFrom<Message> + Send + 'static,
        T::Error: Into<HandlerError>,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
        R: Into<Reply> + 'static,
    {
        let handler = Arc::new(handler);
        self.reply(subject, move |message: Message| {
            let handler = handler.clone();
            async move {
                let request = T::try_from(message).map_err(Into::<HandlerError>::into)?;
                handler(request).await
            }
        })
    }

    /// Wait until the server has processed everything queued so far.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.inner.flush(timeout).await
    }

    /// Stop gracefully.
    ///
    /// Unsubscribes everything, lets handlers finish the messages already
    /// buffered, then closes. New publishes and subscriptions fail with
    /// `Drained` from the moment this is called.
    pub async fn drain(&self) -> Result<()> {
        if self.inner.state.get() == ConnectionState::Closed {
            return Ok(());
        }
        let (ack, done) = oneshot::channel();
        if self.inner.commands.send(Command::Drain(ack)).await.is_ok() {
            if let Ok(result) = done.await {
                return result;
            }
        }
        // Closed concurrently.
        self.wait_closed().await;
        Ok(())
    }

    /// Close immediately. Buffered messages are discarded.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.wait_closed().await;
    }

    async fn wait_closed(&self) {
        let mut states = self.inner.state.subscribe();
        let _ = states
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The most recent INFO from the server.
    pub fn server_info(&self) -> Arc<ServerInfo> {
        self.inner.server_info()
    }

    /// Receive slow-consumer, handler-failure and connection events.
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.inner.diagnostics.subscribe()
    }

    /// Live subscriptions, request inboxes included.
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether the outbound buffer is full.
    pub fn is_backpressure_active(&self) -> bool {
        self.inner.writer.is_backpressure_active()
    }

    /// Frames queued but not yet written.
    pub fn pending_frames(&self) -> usize {
        self.inner.writer.pending_count()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("subscriptions", &self.subscription_count())
            .field("pending_frames", &self.pending_frames())
            .finish()
    }
}

/// Handler that publishes the wrapped handler's [`Reply`] to `reply_to`.
struct Responder<F, R> {
    inner: Weak<ConnectionInner>,
    handler: F,
    _reply: PhantomData<fn() -> R>,
}

impl<F, R> Responder<F, R> {
    fn new(inner: Weak<ConnectionInner>, handler: F) -> Self {
        Self {
            inner,
            handler,
            _reply: PhantomData,
        }
    }
}

impl<F, Fut, R> MessageHandler for Responder<F, R>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    R: Into<Reply> + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerResult> {
        let inner = self.inner.clone();
        let reply_to = message.reply_to.clone();
        let response = (self.handler)(message);

        Box::pin(async move {
            let reply: Reply = response.await?.into();
            let Some(reply_to) = reply_to else {
                tracing::debug!("Request without reply subject, reply discarded");
                return Ok(());
            };
            let inner = inner.upgrade().ok_or(NatsError::ConnectionClosed)?;
            inner.publish_message(&reply_to, None, reply.headers, reply.payload)?;
            Ok(())
        })
    }
}
