//! PING/PONG bookkeeping.
//!
//! The server answers PINGs in order, so every PONG resolves the oldest
//! outstanding PING. Keepalive PINGs have no waiter; flush PINGs carry a
//! oneshot that fires when their PONG arrives.
//!
//! Every PING is registered under the current session epoch. Losing the
//! socket bumps the epoch, and the writer skips PINGs from an older epoch
//! still sitting in the outbound queue: their waiters are gone, so a PONG
//! for them on the next socket would resolve someone else's flush.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct Pending {
    waiters: VecDeque<Option<oneshot::Sender<()>>>,
    epoch: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PongTracker {
    pending: Mutex<Pending>,
}

impl PongTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a PING whose PONG someone waits for. Returns the waiter and
    /// the epoch to tag the PING with.
    ///
    /// Call this before the PING is queued so the PONG cannot overtake it.
    pub(crate) fn register(&self) -> (oneshot::Receiver<()>, u64) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        pending.waiters.push_back(Some(tx));
        (rx, pending.epoch)
    }

    /// Record a keepalive PING. Returns how many PINGs are now unanswered
    /// and the epoch to tag the PING with.
    pub(crate) fn register_keepalive(&self) -> (usize, u64) {
        let mut pending = self.pending.lock();
        pending.waiters.push_back(None);
        (pending.waiters.len(), pending.epoch)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.pending.lock().waiters.len()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.pending.lock().epoch
    }

    /// A PONG arrived.
    pub(crate) fn resolve_next(&self) {
        match self.pending.lock().waiters.pop_front() {
            Some(Some(waiter)) => {
                let _ = waiter.send(());
            }
            Some(None) => {}
            None => tracing::trace!("Unsolicited PONG"),
        }
    }

    /// Forget every outstanding PING and start a new epoch. Waiters see
    /// their sender dropped.
    pub(crate) fn fail_all(&self) {
        let mut pending = self.pending.lock();
        pending.waiters.clear();
        pending.epoch += 1;
    }
}
