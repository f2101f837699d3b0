//! Handle to a live subscription.

use std::sync::Weak;

use crate::connection::ConnectionInner;
use crate::error::{NatsError, Result};

/// A subscription created by [`Client::subscribe`](crate::Client::subscribe)
/// and friends.
///
/// Dropping the handle does not unsubscribe; the handler keeps running until
/// [`unsubscribe`](Self::unsubscribe) is called, its message budget is used
/// up, or the connection closes. The handle does not keep the connection
/// alive.
#[derive(Debug, Clone)]
pub struct Subscription {
    sid: String,
    subject: String,
    queue_group: Option<String>,
    inner: Weak<ConnectionInner>,
}

impl Subscription {
    pub(crate) fn new(
        sid: String,
        subject: &str,
        queue_group: Option<String>,
        inner: Weak<ConnectionInner>,
    ) -> Self {
        Self {
            sid,
            subject: subject.to_string(),
            queue_group,
            inner,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Whether messages can still be routed to this subscription.
    pub fn is_active(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.registry.contains(&self.sid))
    }

    /// Stop now. No handler runs after this returns.
    pub async fn unsubscribe(&self) -> Result<()> {
        self.connection()?.unsubscribe(&self.sid, None).await
    }

    /// Stop after `max_msgs` messages in total have been delivered.
    pub async fn unsubscribe_after(&self, max_msgs: u64) -> Result<()> {
        self.connection()?
            .unsubscribe(&self.sid, Some(max_msgs))
            .await
    }

    fn connection(&self) -> Result<std::sync::Arc<ConnectionInner>> {
        self.inner.upgrade().ok_or(NatsError::ConnectionClosed)
    }
}
