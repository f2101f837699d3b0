//! Subscription registry: sid → delivery sink.
//!
//! The reader routes every MSG/HMSG through [`SubscriptionRegistry::route`].
//! Routing never blocks: each subscription owns a bounded channel and a
//! message that does not fit is dropped and reported as a slow consumer.
//!
//! All mutations take the same lock as routing, so subscribe, unsubscribe
//! and max-message exhaustion are totally ordered with deliveries to the
//! same sid.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::error::{NatsError, Result};
use crate::message::Message;

/// Cancellation flag shared between a registry entry and its worker.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionControl {
    cancelled: AtomicBool,
}

impl SubscriptionControl {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A live subscription.
pub(crate) struct Entry {
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    sender: mpsc::Sender<Message>,
    control: Arc<SubscriptionControl>,
    /// Auto-unsubscribe after this many routed messages.
    max_msgs: Option<u64>,
    /// Messages routed so far, dropped ones included.
    routed: u64,
    /// Handler worker; `None` for request inboxes read directly by the caller.
    worker: Option<JoinHandle<()>>,
}

impl Entry {
    pub(crate) fn new(
        subject: String,
        queue_group: Option<String>,
        sender: mpsc::Sender<Message>,
        control: Arc<SubscriptionControl>,
        max_msgs: Option<u64>,
        worker: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            subject,
            queue_group,
            sender,
            control,
            max_msgs,
            routed: 0,
            worker,
        }
    }
}

/// Result of routing one message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    /// Queued for the subscription.
    Delivered,
    /// Subscription buffer full; the message was discarded.
    Dropped { sid: String, subject: String },
    /// No subscription with this sid (already removed).
    Unknown,
}

/// What `set_max` did.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MaxOutcome {
    /// Limit recorded; the server should be told `UNSUB sid max`.
    Limited,
    /// The subscription had already reached the limit and was removed.
    Removed,
}

/// State needed to replay a subscription on a new socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resubscribe {
    pub(crate) sid: String,
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    /// Messages still allowed under max_msgs.
    pub(crate) remaining: Option<u64>,
}

/// Concurrency-safe map of live subscriptions.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Sids must be unique.
    pub(crate) fn insert(&self, sid: String, entry: Entry) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&sid) {
            return Err(NatsError::Validation(format!("duplicate sid {}", sid)));
        }
        entries.insert(sid, entry);
        Ok(())
    }

    /// Route a message to its subscription without blocking.
    pub(crate) fn route(&self, message: Message) -> RouteOutcome {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&message.sid) else {
            return RouteOutcome::Unknown;
        };

        entry.routed += 1;
        let exhausted = entry.max_msgs.is_some_and(|max| entry.routed >= max);
        let sid = exhausted.then(|| message.sid.clone());

        let outcome = match entry.sender.try_send(message) {
            Ok(()) => RouteOutcome::Delivered,
            Err(TrySendError::Full(message)) => RouteOutcome::Dropped {
                sid: message.sid,
                subject: entry.subject.clone(),
            },
            Err(TrySendError::Closed(_)) => RouteOutcome::Unknown,
        };

        // Dropping the sender lets the worker finish what is buffered.
        if let Some(sid) = sid {
            entries.remove(&sid);
        }
        outcome
    }

    /// Remove a subscription and stop its handler.
    ///
    /// Buffered messages are discarded: no handler runs after this returns.
    pub(crate) fn unsubscribe(&self, sid: &str) -> Option<Entry> {
        let entry = self.entries.lock().remove(sid)?;
        entry.control.cancel();
        Some(entry)
    }

    /// Remove a subscription but let its worker finish buffered messages.
    pub(crate) fn remove(&self, sid: &str) -> Option<Entry> {
        self.entries.lock().remove(sid)
    }

    /// Set an absolute max_msgs limit on a subscription.
    pub(crate) fn set_max(&self, sid: &str, max: u64) -> Result<MaxOutcome> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(sid)
            .ok_or_else(|| NatsError::SubscriptionNotFound(sid.to_string()))?;

        if entry.routed >= max {
            entries.remove(sid);
            return Ok(MaxOutcome::Removed);
        }
        entry.max_msgs = Some(max);
        Ok(MaxOutcome::Limited)
    }

    /// Snapshot of every live subscription, in sid order.
    pub(crate) fn snapshot(&self) -> Vec<Resubscribe> {
        let entries = self.entries.lock();
        let mut subs: Vec<Resubscribe> = entries
            .iter()
            .map(|(sid, entry)| Resubscribe {
                sid: sid.clone(),
                subject: entry.subject.clone(),
                queue_group: entry.queue_group.clone(),
                remaining: entry.max_msgs.map(|max| max.saturating_sub(entry.routed)),
            })
            .collect();
        subs.sort_by(|a, b| sid_order(&a.sid, &b.sid));
        subs
    }

    /// Sids of every live subscription.
    pub(crate) fn sids(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|s| s.sid).collect()
    }

    /// Remove every subscription.
    ///
    /// With `cancel` set, pending handler invocations are skipped; otherwise
    /// workers drain their buffers first. Returns the worker handles.
    pub(crate) fn close_all(&self, cancel: bool) -> Vec<JoinHandle<()>> {
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        drained
            .into_iter()
            .filter_map(|entry| {
                if cancel {
                    entry.control.cancel();
                }
                entry.worker
            })
            .collect()
    }

    pub(crate) fn contains(&self, sid: &str) -> bool {
        self.entries.lock().contains_key(sid)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Numeric sids sort numerically; anything else falls back to string order.
fn sid_order(a: &str, b: &str) -> std::cmp::Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
