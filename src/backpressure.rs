//! Backpressure accounting for the outbound buffer.
//!
//! Every frame queued for the writer task holds one slot until the writer
//! dequeues it. Publish-family calls reserve with [`BackpressureController::try_reserve`]
//! and fail fast with `NatsError::Capacity` when the buffer is full; they never
//! wait. Protocol control frames (PONG, keepalive PING, drain UNSUBs) are
//! counted with [`BackpressureController::reserve_control`], which ignores the
//! limit so a full user buffer can never starve the connection's own
//! housekeeping.
//!
//! Slots survive reconnects: frames queued while the socket is down keep
//! their slots until a later writer task picks them up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{NatsError, Result};

/// Default maximum pending frames before publishes are refused.
pub const DEFAULT_MAX_PENDING: usize = 8192;

/// Lock-free pending-frame counter shared by every handle and the writer task.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    /// Current pending frame count.
    pending: Arc<AtomicUsize>,
    /// Maximum pending frames accepted from callers.
    max_pending: usize,
}

impl BackpressureController {
    /// Create a new controller with the given limit.
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
        }
    }

    /// Check if the buffer is currently full for callers.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Reserve a slot without waiting.
    ///
    /// Returns `Err(Capacity)` if the buffer is full.
    pub fn try_reserve(&self) -> Result<()> {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_pending).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|_| NatsError::Capacity)
    }

    /// Reserve a slot for a control frame, ignoring the limit.
    #[inline]
    pub fn reserve_control(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a slot (frame dequeued, or enqueue failed).
    #[inline]
    pub fn release(&self) {
        self.release_many(1);
    }

    /// Release multiple slots at once (for batch writes).
    #[inline]
    pub fn release_many(&self, count: usize) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(count))
            });
    }
}
