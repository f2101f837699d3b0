//! Request/reply over transient inbox subscriptions.
//!
//! A request subscribes a fresh inbox with a reply budget (`SUB` then
//! `UNSUB sid n`), publishes with `reply_to` set to the inbox and collects
//! replies until the budget or the deadline is reached. The registry entry
//! is the pending-request record: whoever removes it first decides the
//! outcome, so a reply racing the deadline is either collected or dropped,
//! never both.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::time::Instant;

use crate::connection::ConnectionInner;
use crate::error::{NatsError, Result};
use crate::message::Message;
use crate::protocol::Headers;

/// Length of the random inbox token.
const INBOX_TOKEN_LEN: usize = 22;

/// A fresh, process-unique inbox subject under `prefix`.
pub fn new_inbox(prefix: &str) -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INBOX_TOKEN_LEN)
        .map(char::from)
        .collect();
    format!("{}.{}", prefix, token)
}

/// A request with every option spelled out.
///
/// ```
/// use std::time::Duration;
/// use natswire_client::{Headers, Request};
///
/// let request = Request::new("inventory.lookup", "sku-42")
///     .headers(Headers::new().with("Trace-Id", "abc"))
///     .timeout(Duration::from_millis(250))
///     .replies(3);
/// assert_eq!(request.reply_count(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    subject: String,
    payload: Bytes,
    headers: Option<Headers>,
    timeout: Option<Duration>,
    replies: u64,
}

impl Request {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: None,
            timeout: None,
            replies: 1,
        }
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Deadline for the whole request. Defaults to `Options::request_timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of replies to wait for. Values below 1 are treated as 1.
    pub fn replies(mut self, count: u64) -> Self {
        self.replies = count.max(1);
        self
    }

    pub fn reply_count(&self) -> u64 {
        self.replies
    }
}

/// Removes the inbox subscription on every exit path.
struct PendingRequest<'a> {
    inner: &'a ConnectionInner,
    sid: String,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        // Absent means the budget was reached; the server already forgot it.
        if self.inner.registry.remove(&self.sid).is_some() {
            let _ = self.inner.queue_unsub(&self.sid, None);
        }
    }
}

/// Send `request` and collect its replies.
pub(crate) async fn send(inner: &Arc<ConnectionInner>, request: Request) -> Result<Vec<Message>> {
    let timeout = request.timeout.unwrap_or(inner.options.request_timeout);
    let deadline = Instant::now() + timeout;
    let wanted = request.replies;

    let inbox = new_inbox(&inner.options.inbox_prefix);
    let (sid, mut rx) = inner.subscribe_inbox(&inbox, wanted)?;
    let guard = PendingRequest {
        inner: inner.as_ref(),
        sid,
    };

    inner.publish_message(
        &request.subject,
        Some(&inbox),
        request.headers,
        request.payload,
    )?;

    let mut replies = Vec::new();
    let mut no_responders = false;
    let mut closed = false;

    while (replies.len() as u64) < wanted {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(message)) if message.is_no_responders() => {
                no_responders = true;
                break;
            }
            Ok(Some(message)) => replies.push(message),
            Ok(None) => {
                // Entry removed: budget exhausted, or the connection went away.
                closed = (replies.len() as u64) < wanted;
                break;
            }
            Err(_) => break,
        }
    }

    drop(guard);
    // Replies routed before the entry was removed still count.
    while (replies.len() as u64) < wanted {
        match rx.try_recv() {
            Ok(message) if message.is_no_responders() => no_responders = true,
            Ok(message) => replies.push(message),
            Err(_) => break,
        }
    }

    if closed && (replies.len() as u64) < wanted && !inner.state.get().is_accepting() {
        return Err(NatsError::ConnectionClosed);
    }
    if wanted == 1 {
        return match replies.pop() {
            Some(reply) => Ok(vec![reply]),
            None if no_responders => Err(NatsError::NoResponders),
            None => Err(NatsError::NoReplies),
        };
    }
    Ok(replies)
}
