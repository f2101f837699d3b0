//! State shared by a client handle and its background tasks.
//!
//! Every `Client` clone, the reader, the supervisor and reply handlers hold
//! the same [`ConnectionInner`]. The caller-facing checks (validation,
//! lifecycle, payload limits, header support) all happen here, before a
//! frame is queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::diagnostics::Diagnostics;
use crate::error::{NatsError, Result};
use crate::handler::dispatch::spawn_worker;
use crate::handler::registry::{Entry, MaxOutcome, SubscriptionControl, SubscriptionRegistry};
use crate::handler::MessageHandler;
use crate::keepalive::PongTracker;
use crate::message::Message;
use crate::options::{Options, SubscribeOptions};
use crate::protocol::{Frame, HPub, Headers, Pub, ServerInfo, Sub, Unsub};
use crate::state::{ConnectionState, StateCell};
use crate::subject;
use crate::writer::{outbound_queue, OutboundFrame, OutboundQueue, WriterHandle};

/// Requests from client handles to the supervisor.
pub(crate) enum Command {
    Drain(oneshot::Sender<Result<()>>),
}

pub(crate) struct ConnectionInner {
    pub(crate) options: Options,
    pub(crate) state: StateCell,
    pub(crate) info: watch::Sender<Arc<ServerInfo>>,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) writer: WriterHandle,
    pub(crate) pongs: Arc<PongTracker>,
    pub(crate) diagnostics: Arc<Diagnostics>,
    pub(crate) commands: mpsc::Sender<Command>,
    /// Cancelled exactly once, when the connection closes for good.
    pub(crate) shutdown: CancellationToken,
    /// Set once a drain starts; a drained connection keeps refusing with
    /// `Drained` after it closes.
    drained: AtomicBool,
    next_sid: AtomicU64,
}

impl ConnectionInner {
    /// Create the shared state plus the supervisor's ends of the channels.
    pub(crate) fn new(
        options: Options,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Command>, OutboundQueue) {
        let (writer, queue) = outbound_queue(options.max_pending_frames);
        let (commands, commands_rx) = mpsc::channel(4);
        let (info, _) = watch::channel(Arc::new(ServerInfo::default()));
        let diagnostics = Arc::new(Diagnostics::new(options.diagnostics_interval));

        let inner = Arc::new(Self {
            options,
            state: StateCell::new(),
            info,
            registry: SubscriptionRegistry::new(),
            writer,
            pongs: Arc::new(PongTracker::new()),
            diagnostics,
            commands,
            shutdown,
            drained: AtomicBool::new(false),
            next_sid: AtomicU64::new(1),
        });
        (inner, commands_rx, queue)
    }

    pub(crate) fn server_info(&self) -> Arc<ServerInfo> {
        self.info.borrow().clone()
    }

    fn next_sid(&self) -> String {
        self.next_sid.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Enter `Draining` and remember that this connection was drained.
    pub(crate) fn begin_drain(&self) -> bool {
        self.drained.store(true, Ordering::Release);
        self.state.transition(ConnectionState::Draining)
    }

    /// Refuse new work once draining or closed.
    fn check_accepting(&self) -> Result<()> {
        match self.state.get() {
            ConnectionState::Draining => Err(NatsError::Drained),
            state if state.is_accepting() => Ok(()),
            _ if self.drained.load(Ordering::Acquire) => Err(NatsError::Drained),
            _ => Err(NatsError::ConnectionClosed),
        }
    }

    pub(crate) fn publish_message(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        headers: Option<Headers>,
        payload: Bytes,
    ) -> Result<()> {
        self.check_accepting()?;
        subject::validate_subject(subject)?;
        if let Some(reply_to) = reply_to {
            subject::validate_subject(reply_to)?;
        }

        let info = self.server_info();
        if let Some(headers) = &headers {
            if !self.options.headers || !info.headers {
                return Err(NatsError::HeadersNotSupported);
            }
            headers.validate()?;
        }
        let size = payload.len() + headers.as_ref().map_or(0, Headers::encoded_len);
        if info.max_payload > 0 && size > info.max_payload {
            return Err(NatsError::PayloadTooLarge {
                size,
                max: info.max_payload,
            });
        }

        let frame = match headers {
            Some(headers) => Frame::HPub(HPub {
                subject: subject.to_string(),
                reply_to: reply_to.map(str::to_string),
                headers,
                payload,
            }),
            None => Frame::Pub(Pub {
                subject: subject.to_string(),
                reply_to: reply_to.map(str::to_string),
                payload,
            }),
        };
        self.writer.try_send(OutboundFrame::encode(&frame)?)
    }

    /// Subscribe with a handler worker. Returns the sid.
    pub(crate) fn subscribe_with_handler(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<String> {
        self.check_subscription(subject, options.queue_group.as_deref())?;

        let sid = self.next_sid();
        let capacity = options
            .capacity
            .unwrap_or(self.options.subscription_capacity)
            .max(1);
        let mode = options.dispatch.unwrap_or(self.options.dispatch_mode);
        let (tx, rx) = mpsc::channel(capacity);
        let control = Arc::new(SubscriptionControl::default());
        let worker = spawn_worker(
            sid.clone(),
            rx,
            handler,
            mode,
            control.clone(),
            self.diagnostics.clone(),
        );

        let entry = Entry::new(
            subject.to_string(),
            options.queue_group.clone(),
            tx,
            control,
            options.max_msgs,
            Some(worker),
        );
        self.start_subscription(&sid, entry, options.max_msgs)?;
        tracing::debug!(sid = %sid, subject, "Subscribed");
        Ok(sid)
    }

    /// Subscribe a request inbox read directly by the caller.
    pub(crate) fn subscribe_inbox(
        &self,
        inbox: &str,
        max_msgs: u64,
    ) -> Result<(String, mpsc::Receiver<Message>)> {
        self.check_subscription(inbox, None)?;

        let sid = self.next_sid();
        let capacity = usize::try_from(max_msgs)
            .unwrap_or(usize::MAX)
            .clamp(1, self.options.subscription_capacity.max(1));
        let (tx, rx) = mpsc::channel(capacity);
        let entry = Entry::new(
            inbox.to_string(),
            None,
            tx,
            Arc::new(SubscriptionControl::default()),
            Some(max_msgs),
            None,
        );
        self.start_subscription(&sid, entry, Some(max_msgs))?;
        Ok((sid, rx))
    }

    fn check_subscription(&self, subject: &str, queue_group: Option<&str>) -> Result<()> {
        self.check_accepting()?;
        subject::validate_pattern(subject)?;
        if let Some(group) = queue_group {
            subject::validate_queue_group(group)?;
        }
        Ok(())
    }

    /// Register the entry, then queue SUB and the optional UNSUB budget.
    fn start_subscription(&self, sid: &str, entry: Entry, max_msgs: Option<u64>) -> Result<()> {
        let sub = Frame::Sub(Sub {
            subject: entry.subject.clone(),
            queue_group: entry.queue_group.clone(),
            sid: sid.to_string(),
        });
        self.registry.insert(sid.to_string(), entry)?;

        let queued = OutboundFrame::encode(&sub).and_then(|f| self.writer.try_send(f));
        let queued = queued.and_then(|()| match max_msgs {
            Some(max) => self.queue_unsub(sid, Some(max)),
            None => Ok(()),
        });
        if let Err(e) = queued {
            self.registry.unsubscribe(sid);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a subscription now, or after `max_msgs` deliveries in total.
    pub(crate) async fn unsubscribe(&self, sid: &str, max_msgs: Option<u64>) -> Result<()> {
        let limit = match max_msgs {
            Some(max) if max > 0 => match self.registry.set_max(sid, max)? {
                MaxOutcome::Limited => Some(max),
                MaxOutcome::Removed => None,
            },
            _ => {
                self.registry
                    .unsubscribe(sid)
                    .ok_or_else(|| NatsError::SubscriptionNotFound(sid.to_string()))?;
                None
            }
        };
        if limit.is_none() {
            self.diagnostics.forget(sid);
        }

        if !self.state.get().is_accepting() {
            // Drain already unsubscribed everything on the server.
            return Ok(());
        }
        let frame = OutboundFrame::encode(&Frame::Unsub(Unsub {
            sid: sid.to_string(),
            max_msgs: limit,
        }))?;
        self.writer.send_control(frame).await
    }

    /// Queue an UNSUB without waiting. Used where awaiting is impossible.
    pub(crate) fn queue_unsub(&self, sid: &str, max_msgs: Option<u64>) -> Result<()> {
        let frame = OutboundFrame::encode(&Frame::Unsub(Unsub {
            sid: sid.to_string(),
            max_msgs,
        }))?;
        self.writer.try_send(frame)
    }

    /// PING the server and wait for its PONG.
    pub(crate) async fn flush(&self, timeout: Duration) -> Result<()> {
        match self.state.get() {
            ConnectionState::Closed => return Err(NatsError::ConnectionClosed),
            ConnectionState::Disconnected => return Err(NatsError::ConnectionClosed),
            _ => {}
        }
        let (pong, epoch) = self.pongs.register();
        self.writer.send_control(OutboundFrame::ping(epoch)).await?;
        match tokio::time::timeout(timeout, pong).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(NatsError::ConnectionClosed),
            Err(_) => Err(NatsError::Timeout),
        }
    }
}
