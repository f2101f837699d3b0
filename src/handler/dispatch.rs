//! Per-subscription workers that run handlers.
//!
//! Every subscription with a handler gets one worker task reading its
//! bounded channel. Each handler call runs in its own task so a panic is
//! caught at the join and reported; the worker keeps going.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};

use super::callback::{HandlerResult, MessageHandler};
use super::registry::SubscriptionControl;
use crate::diagnostics::Diagnostics;
use crate::message::Message;

/// Default number of concurrent handler calls in [`DispatchMode::Concurrent`].
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// How a subscription's handler is scheduled.
///
/// `Sequential` keeps strict per-subscription FIFO order: a slow handler
/// delays the messages behind it and, once the subscription buffer fills,
/// further messages are dropped as a slow consumer.
///
/// `Concurrent` runs up to `max_in_flight` calls at once. Throughput no longer
/// depends on a single slow call, but handlers may complete in any order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Sequential,
    Concurrent { max_in_flight: usize },
}

impl DispatchMode {
    /// Concurrent dispatch with the default in-flight limit.
    pub fn concurrent() -> Self {
        DispatchMode::Concurrent {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// Spawn the worker for one subscription.
///
/// The worker ends when the channel is closed and drained, or as soon as
/// the subscription is cancelled.
pub(crate) fn spawn_worker(
    sid: String,
    rx: mpsc::Receiver<Message>,
    handler: Arc<dyn MessageHandler>,
    mode: DispatchMode,
    control: Arc<SubscriptionControl>,
    diagnostics: Arc<Diagnostics>,
) -> JoinHandle<()> {
    let worker = Worker {
        sid,
        handler,
        control,
        diagnostics,
    };
    match mode {
        DispatchMode::Sequential => tokio::spawn(worker.run_sequential(rx)),
        DispatchMode::Concurrent { max_in_flight } => {
            tokio::spawn(worker.run_concurrent(rx, max_in_flight.max(1)))
        }
    }
}

struct Worker {
    sid: String,
    handler: Arc<dyn MessageHandler>,
    control: Arc<SubscriptionControl>,
    diagnostics: Arc<Diagnostics>,
}

impl Worker {
    async fn run_sequential(self, mut rx: mpsc::Receiver<Message>) {
        while let Some(message) = rx.recv().await {
            if self.control.is_cancelled() {
                break;
            }
            let handler = self.handler.clone();
            let result = tokio::spawn(async move { handler.handle(message).await }).await;
            self.report(result);
        }
        tracing::debug!(sid = %self.sid, "Subscription worker finished");
    }

    async fn run_concurrent(self, mut rx: mpsc::Receiver<Message>, max_in_flight: usize) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.report(done);
                }
                message = rx.recv(), if in_flight.len() < max_in_flight => {
                    let Some(message) = message else { break };
                    if self.control.is_cancelled() {
                        break;
                    }
                    let handler = self.handler.clone();
                    in_flight.spawn(async move { handler.handle(message).await });
                }
            }
        }

        while let Some(done) = in_flight.join_next().await {
            self.report(done);
        }
        tracing::debug!(sid = %self.sid, "Subscription worker finished");
    }

    fn report(&self, result: Result<HandlerResult, JoinError>) {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.diagnostics.handler_failed(&self.sid, &e),
            Err(e) if e.is_panic() => self.diagnostics.handler_panicked(&self.sid),
            Err(_) => {}
        }
    }
}
