//! Connection supervisor: handshake, session loop, reconnect and drain.
//!
//! One supervisor task owns the lifecycle of a connection. For every socket
//! session it performs the INFO/CONNECT/PING handshake, replays the live
//! subscriptions, then runs a writer task and a reader task until the
//! session ends. Lost sessions are retried according to the
//! [`ReconnectPolicy`](crate::ReconnectPolicy); drain and close end the loop.
//!
//! ```text
//!             ┌──────────── reconnect ────────────┐
//!             ▼                                   │
//! handshake ─► serve ─► Lost ─► Reconnecting ─────┘
//!                │                    │
//!                ├─► Drain ─► Draining ─► Closed
//!                └─► Shutdown ─────────► Closed
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::connection::{Command, ConnectionInner};
use crate::diagnostics::Diagnostic;
use crate::error::{NatsError, Result};
use crate::protocol::{
    ConnectInfo, Frame, FrameBuffer, ServerInfo, Sub, Unsub, DEFAULT_MAX_PAYLOAD_SIZE,
};
use crate::reader::{reader_loop, InboundEvent};
use crate::state::ConnectionState;
use crate::transport::{BoxedStream, ServerAddr, Transport};
use crate::writer::{spawn_writer_task, OutboundFrame, OutboundQueue};

/// Read buffer used during the handshake.
const HANDSHAKE_READ_SIZE: usize = 8 * 1024;

/// Capacity of the reader → supervisor event channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Servers to connect to, tried round-robin.
#[derive(Debug)]
pub(crate) struct ServerPool {
    servers: Vec<ServerAddr>,
    next: usize,
}

impl ServerPool {
    /// `primary` is tried first; duplicates are dropped.
    pub(crate) fn new(primary: ServerAddr, others: impl IntoIterator<Item = ServerAddr>) -> Self {
        let mut pool = Self {
            servers: vec![primary],
            next: 0,
        };
        for addr in others {
            pool.add(addr);
        }
        pool
    }

    fn add(&mut self, addr: ServerAddr) -> bool {
        let known = self
            .servers
            .iter()
            .any(|s| s.host == addr.host && s.port == addr.port);
        if !known {
            self.servers.push(addr);
        }
        !known
    }

    /// Next server in rotation.
    pub(crate) fn next_server(&mut self) -> ServerAddr {
        let addr = self.servers[self.next % self.servers.len()].clone();
        self.next = (self.next + 1) % self.servers.len();
        addr
    }

    /// Add servers advertised in INFO `connect_urls`.
    pub(crate) fn merge(&mut self, urls: &[String]) {
        for url in urls {
            match url.parse::<ServerAddr>() {
                Ok(addr) => {
                    if self.add(addr) {
                        tracing::debug!(url = %url, "Discovered server");
                    }
                }
                Err(e) => tracing::debug!(url = %url, "Ignoring advertised server: {}", e),
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.servers.len()
    }
}

/// A socket that completed the handshake.
pub(crate) struct Session {
    stream: BoxedStream,
    /// Bytes read past the handshake PONG.
    buffer: FrameBuffer,
    server: ServerAddr,
    info: ServerInfo,
}

/// Why a session ended.
enum SessionEnd {
    Lost(String),
    Drained(Result<()>, oneshot::Sender<Result<()>>),
    Shutdown,
}

/// How a reconnect loop ended.
enum Reconnect {
    Session(Session),
    Drain(oneshot::Sender<Result<()>>),
    GaveUp,
    Shutdown,
}

pub(crate) struct Supervisor {
    inner: Arc<ConnectionInner>,
    transport: Arc<dyn Transport>,
    queue: OutboundQueue,
    pool: ServerPool,
    commands: mpsc::Receiver<Command>,
}

impl Supervisor {
    pub(crate) fn new(
        inner: Arc<ConnectionInner>,
        transport: Arc<dyn Transport>,
        queue: OutboundQueue,
        pool: ServerPool,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            inner,
            transport,
            queue,
            pool,
            commands,
        }
    }

    /// First connection: every server is tried once, without delay.
    ///
    /// On failure the connection is closed and the last error returned.
    pub(crate) async fn connect(&mut self) -> Result<Session> {
        self.inner.state.transition(ConnectionState::Connecting);

        let mut last_error = NatsError::ConnectionClosed;
        for _ in 0..self.pool.len() {
            let addr = self.pool.next_server();
            match handshake(&self.inner, self.transport.as_ref(), &addr).await {
                Ok(session) => {
                    self.apply_info(session.info.clone());
                    self.inner.state.transition(ConnectionState::Connected);
                    tracing::info!(server = %session.server, "Connected");
                    return Ok(session);
                }
                Err(e) => {
                    tracing::warn!(server = %addr, "Connect failed: {}", e);
                    last_error = e;
                }
            }
        }

        self.finish();
        Err(last_error)
    }

    /// Run sessions until the connection is drained, closed or given up on.
    pub(crate) async fn run(mut self, mut session: Session) {
        loop {
            match self.serve(session).await {
                SessionEnd::Lost(reason) => {
                    self.inner.pongs.fail_all();
                    if !self.inner.state.transition(ConnectionState::Reconnecting) {
                        break;
                    }
                    tracing::warn!(reason = %reason, "Connection lost, reconnecting");
                    self.inner
                        .diagnostics
                        .notice(Diagnostic::Disconnected { reason });

                    match self.reconnect().await {
                        Reconnect::Session(next) => {
                            self.apply_info(next.info.clone());
                            self.inner.state.transition(ConnectionState::Connected);
                            self.inner.diagnostics.notice(Diagnostic::Reconnected {
                                server: next.server.to_string(),
                            });
                            session = next;
                        }
                        Reconnect::Drain(ack) => {
                            // No socket: nothing to unsubscribe on the server.
                            self.inner.begin_drain();
                            let result = drain_workers(&self.inner).await;
                            self.finish();
                            let _ = ack.send(result);
                            return;
                        }
                        Reconnect::GaveUp => {
                            tracing::error!("Reconnect attempts exhausted, closing");
                            break;
                        }
                        Reconnect::Shutdown => break,
                    }
                }
                SessionEnd::Drained(result, ack) => {
                    self.finish();
                    let _ = ack.send(result);
                    return;
                }
                SessionEnd::Shutdown => break,
            }
        }
        self.finish();
    }

    /// Run one session's reader and writer until it ends.
    async fn serve(&mut self, session: Session) -> SessionEnd {
        let inner = self.inner.clone();
        let cancel = inner.shutdown.child_token();
        let (read_half, write_half) = tokio::io::split(session.stream);

        let mut writer_task = spawn_writer_task(
            self.queue.clone(),
            write_half,
            inner.writer.backpressure().clone(),
            inner.pongs.clone(),
            cancel.clone(),
        );
        let (events_tx, mut events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader_task = tokio::spawn(reader_loop(
            read_half,
            session.buffer,
            inner.clone(),
            events_tx,
            cancel.clone(),
        ));

        let period = inner.options.ping_interval.max(Duration::from_millis(1));
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_error: Option<String> = None;

        let end = loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break SessionEnd::Shutdown,
                event = events.recv() => match event {
                    Some(InboundEvent::ServerInfo(info)) => self.apply_info(*info),
                    Some(InboundEvent::ServerError(message)) => last_error = Some(message),
                    Some(InboundEvent::Closed(e)) => {
                        break SessionEnd::Lost(lost_reason(e.to_string(), last_error.take()));
                    }
                    None => break SessionEnd::Lost("reader stopped".to_string()),
                },
                result = &mut writer_task => {
                    let reason = match result {
                        Ok(Ok(())) => "writer stopped".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => e.to_string(),
                    };
                    break SessionEnd::Lost(lost_reason(reason, last_error.take()));
                }
                _ = keepalive.tick() => {
                    if inner.pongs.outstanding() >= inner.options.max_pings_outstanding {
                        break SessionEnd::Lost("stale connection".to_string());
                    }
                    let (_, epoch) = inner.pongs.register_keepalive();
                    if let Err(e) = send_ping(&inner, epoch).await {
                        break SessionEnd::Lost(e.to_string());
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Drain(ack)) => {
                        let result = drain_session(&inner).await;
                        break SessionEnd::Drained(result, ack);
                    }
                    None => break SessionEnd::Shutdown,
                },
            }
        };

        cancel.cancel();
        reader_task.abort();
        writer_task.abort();
        end
    }

    /// Retry the handshake until it succeeds or the policy runs out.
    async fn reconnect(&mut self) -> Reconnect {
        let mut schedule = self.inner.options.reconnect.schedule();
        let inner = &self.inner;
        let transport = self.transport.as_ref();
        let commands = &mut self.commands;
        let pool = &mut self.pool;

        loop {
            let Some(delay) = schedule.next() else {
                return Reconnect::GaveUp;
            };
            let addr = pool.next_server();
            let attempt = async {
                tokio::time::sleep(delay).await;
                handshake(inner, transport, &addr).await
            };

            tokio::select! {
                _ = inner.shutdown.cancelled() => return Reconnect::Shutdown,
                command = commands.recv() => match command {
                    Some(Command::Drain(ack)) => return Reconnect::Drain(ack),
                    None => return Reconnect::Shutdown,
                },
                result = attempt => match result {
                    Ok(session) => {
                        tracing::info!(server = %session.server, "Reconnected");
                        return Reconnect::Session(session);
                    }
                    Err(e) => tracing::warn!(server = %addr, "Reconnect attempt failed: {}", e),
                },
            }
        }
    }

    /// Publish new server info and act on what it announces.
    fn apply_info(&mut self, info: ServerInfo) {
        if let Some(urls) = &info.connect_urls {
            self.pool.merge(urls);
        }
        if info.is_lame_duck() {
            self.inner.diagnostics.notice(Diagnostic::LameDuckMode {
                server: info.server_id.clone(),
            });
        }
        self.inner.info.send_replace(Arc::new(info));
    }

    /// Tear down everything and enter the terminal state.
    fn finish(&self) {
        let inner = &self.inner;
        for worker in inner.registry.close_all(true) {
            worker.abort();
        }
        inner.pongs.fail_all();
        inner.state.transition(ConnectionState::Closed);
        inner.shutdown.cancel();
        tracing::debug!("Connection closed");
    }
}

fn lost_reason(reason: String, server_error: Option<String>) -> String {
    match server_error {
        Some(message) => format!("{} (server: {})", reason, message),
        None => reason,
    }
}

async fn send_ping(inner: &ConnectionInner, epoch: u64) -> Result<()> {
    inner.writer.send_control(OutboundFrame::ping(epoch)).await
}

/// Graceful stop of a live session, bounded by `drain_timeout`.
async fn drain_session(inner: &ConnectionInner) -> Result<()> {
    inner.begin_drain();
    tracing::debug!("Draining");

    let work = async {
        for sid in inner.registry.sids() {
            let unsub = Frame::Unsub(Unsub {
                sid,
                max_msgs: None,
            });
            inner
                .writer
                .send_control(OutboundFrame::encode(&unsub)?)
                .await?;
        }

        // The PONG proves the server processed every UNSUB before it.
        let (pong, epoch) = inner.pongs.register();
        send_ping(inner, epoch).await?;
        pong.await.map_err(|_| NatsError::ConnectionClosed)?;

        for worker in inner.registry.close_all(false) {
            let _ = worker.await;
        }
        Ok(())
    };

    tokio::select! {
        _ = inner.shutdown.cancelled() => Err(NatsError::ConnectionClosed),
        result = tokio::time::timeout(inner.options.drain_timeout, work) => {
            result.map_err(|_| NatsError::Timeout)?
        }
    }
}

/// Let workers finish buffered messages when there is no socket to drain.
async fn drain_workers(inner: &ConnectionInner) -> Result<()> {
    let workers = inner.registry.close_all(false);
    let wait = async {
        for worker in workers {
            let _ = worker.await;
        }
    };
    tokio::time::timeout(inner.options.drain_timeout, wait)
        .await
        .map_err(|_| NatsError::Timeout)
}

/// Connect, exchange INFO/CONNECT, confirm with PING/PONG and replay
/// subscriptions, all within `connect_timeout`.
async fn handshake(
    inner: &ConnectionInner,
    transport: &dyn Transport,
    addr: &ServerAddr,
) -> Result<Session> {
    tokio::time::timeout(
        inner.options.connect_timeout,
        handshake_steps(inner, transport, addr),
    )
    .await
    .map_err(|_| NatsError::Timeout)?
}

async fn handshake_steps(
    inner: &ConnectionInner,
    transport: &dyn Transport,
    addr: &ServerAddr,
) -> Result<Session> {
    let mut buffer =
        FrameBuffer::with_limits(DEFAULT_MAX_PAYLOAD_SIZE, inner.options.max_control_line);

    let mut stream = transport.connect(addr).await?;
    let mut info = match read_frame(&mut stream, &mut buffer).await? {
        Frame::Info(info) => *info,
        Frame::Err(message) => return Err(NatsError::Protocol(message)),
        other => {
            return Err(NatsError::Parse(format!(
                "expected INFO, got {}",
                other.verb().as_str()
            )))
        }
    };
    let mut stream = transport.upgrade(stream, addr, &info).await?;

    let mut out = BytesMut::with_capacity(256);
    Frame::Connect(Box::new(connect_info(inner, addr, &info))).encode_head(&mut out)?;
    Frame::Ping.encode_head(&mut out)?;
    stream.write_all(&out).await?;
    stream.flush().await?;

    loop {
        match read_frame(&mut stream, &mut buffer).await? {
            Frame::Pong => break,
            Frame::Ok => {}
            Frame::Info(update) => info = *update,
            Frame::Ping => {
                stream.write_all(&Frame::Pong.encode()?).await?;
            }
            Frame::Err(message) => return Err(NatsError::Protocol(message)),
            other => {
                return Err(NatsError::Parse(format!(
                    "unexpected {} during handshake",
                    other.verb().as_str()
                )))
            }
        }
    }

    // Subscriptions go out before any queued frame.
    let subs = inner.registry.snapshot();
    if !subs.is_empty() {
        out.clear();
        for sub in &subs {
            Frame::Sub(Sub {
                subject: sub.subject.clone(),
                queue_group: sub.queue_group.clone(),
                sid: sub.sid.clone(),
            })
            .encode_head(&mut out)?;
            if let Some(remaining) = sub.remaining {
                Frame::Unsub(Unsub {
                    sid: sub.sid.clone(),
                    max_msgs: Some(remaining),
                })
                .encode_head(&mut out)?;
            }
        }
        stream.write_all(&out).await?;
        stream.flush().await?;
        tracing::debug!(count = subs.len(), "Subscriptions replayed");
    }

    Ok(Session {
        stream,
        buffer,
        server: addr.clone(),
        info,
    })
}

/// Read until one complete frame is buffered.
async fn read_frame(stream: &mut BoxedStream, buffer: &mut FrameBuffer) -> Result<Frame> {
    let mut chunk = vec![0u8; HANDSHAKE_READ_SIZE];
    loop {
        if let Some(frame) = buffer.try_next()? {
            return Ok(frame);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(NatsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection during handshake",
            )));
        }
        buffer.extend(&chunk[..n]);
    }
}

/// CONNECT options for one server. Credentials in the address win.
fn connect_info(inner: &ConnectionInner, addr: &ServerAddr, info: &ServerInfo) -> ConnectInfo {
    let options = &inner.options;
    let (user, pass) = if addr.user.is_some() {
        (addr.user.clone(), addr.pass.clone())
    } else {
        (options.user.clone(), options.pass.clone())
    };

    ConnectInfo {
        verbose: options.verbose,
        pedantic: options.pedantic,
        tls_required: options.tls_required || addr.tls,
        auth_token: addr.token.clone().or_else(|| options.token.clone()),
        user,
        pass,
        name: options.name.clone(),
        echo: Some(options.echo),
        jwt: options.jwt.clone(),
        headers: Some(options.headers),
        no_responders: Some(options.headers && options.no_responders && info.headers),
        ..ConnectInfo::default()
    }
}
