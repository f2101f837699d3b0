//! Rate-limited diagnostics for conditions that are not call errors.
//!
//! Slow consumers, failing handlers and asynchronous server errors happen on
//! background tasks, so there is no caller to return them to. They are logged
//! with `tracing` and broadcast as [`Diagnostic`] events. Each
//! `(kind, sid)` key emits at most one event per window; occurrences inside
//! the window are folded into the next emitted event's `occurrences` count.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Default rate-limit window.
pub const DEFAULT_DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the broadcast channel.
const CHANNEL_CAPACITY: usize = 256;

/// A background condition worth surfacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Messages were dropped because a subscription's buffer was full.
    SlowConsumer {
        sid: String,
        subject: String,
        occurrences: u64,
    },
    /// A handler returned an error.
    HandlerFailed {
        sid: String,
        error: String,
        occurrences: u64,
    },
    /// A handler panicked. The worker keeps running.
    HandlerPanicked { sid: String, occurrences: u64 },
    /// The server sent `-ERR` outside of a handshake.
    ServerError { message: String, occurrences: u64 },
    /// The server announced lame duck mode.
    LameDuckMode { server: String },
    /// The socket session ended and reconnection started.
    Disconnected { reason: String },
    /// A new session was established after a disconnect.
    Reconnected { server: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    SlowConsumer,
    HandlerFailed,
    HandlerPanicked,
    ServerError,
}

#[derive(Debug)]
struct Window {
    last_emit: Instant,
    suppressed: u64,
}

/// Emits diagnostics with per-key rate limiting.
#[derive(Debug)]
pub(crate) struct Diagnostics {
    tx: broadcast::Sender<Diagnostic>,
    windows: Mutex<HashMap<(Kind, String), Window>>,
    interval: Duration,
}

impl Diagnostics {
    pub(crate) fn new(interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            windows: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Subscribe to diagnostic events.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.tx.subscribe()
    }

    pub(crate) fn slow_consumer(&self, sid: &str, subject: &str) {
        if let Some(occurrences) = self.admit(Kind::SlowConsumer, sid) {
            tracing::warn!(
                sid,
                subject,
                occurrences,
                "Slow consumer, dropping messages"
            );
            self.emit(Diagnostic::SlowConsumer {
                sid: sid.to_string(),
                subject: subject.to_string(),
                occurrences,
            });
        }
    }

    pub(crate) fn handler_failed(&self, sid: &str, error: &dyn std::fmt::Display) {
        if let Some(occurrences) = self.admit(Kind::HandlerFailed, sid) {
            tracing::error!(sid, occurrences, "Handler error: {}", error);
            self.emit(Diagnostic::HandlerFailed {
                sid: sid.to_string(),
                error: error.to_string(),
                occurrences,
            });
        }
    }

    pub(crate) fn handler_panicked(&self, sid: &str) {
        if let Some(occurrences) = self.admit(Kind::HandlerPanicked, sid) {
            tracing::error!(sid, occurrences, "Handler panicked");
            self.emit(Diagnostic::HandlerPanicked {
                sid: sid.to_string(),
                occurrences,
            });
        }
    }

    pub(crate) fn server_error(&self, message: &str) {
        if let Some(occurrences) = self.admit(Kind::ServerError, "") {
            tracing::warn!(occurrences, "Server error: {}", message);
            self.emit(Diagnostic::ServerError {
                message: message.to_string(),
                occurrences,
            });
        }
    }

    /// Emit an event that is rare by nature, without rate limiting.
    pub(crate) fn notice(&self, diagnostic: Diagnostic) {
        tracing::info!(?diagnostic, "Connection event");
        self.emit(diagnostic);
    }

    /// Forget the windows of a subscription that went away.
    pub(crate) fn forget(&self, sid: &str) {
        self.windows.lock().retain(|(_, key), _| key != sid);
    }

    /// Decide whether an occurrence is emitted now.
    ///
    /// Returns the number of occurrences the event stands for.
    fn admit(&self, kind: Kind, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        match windows.get_mut(&(kind, key.to_string())) {
            Some(window) if now.duration_since(window.last_emit) < self.interval => {
                window.suppressed += 1;
                None
            }
            Some(window) => {
                let occurrences = window.suppressed + 1;
                window.last_emit = now;
                window.suppressed = 0;
                Some(occurrences)
            }
            None => {
                windows.insert(
                    (kind, key.to_string()),
                    Window {
                        last_emit: now,
                        suppressed: 0,
                    },
                );
                Some(1)
            }
        }
    }

    fn emit(&self, diagnostic: Diagnostic) {
        // No receivers is fine.
        let _ = self.tx.send(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_folds_occurrences() {
        let diagnostics = Diagnostics::new(Duration::from_secs(1));
        let mut rx = diagnostics.subscribe();

        for _ in 0..5 {
            diagnostics.slow_consumer("1", "foo");
        }
        assert_eq!(
            rx.try_recv().unwrap(),
            Diagnostic::SlowConsumer {
                sid: "1".into(),
                subject: "foo".into(),
                occurrences: 1,
            }
        );
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(1100)).await;
        diagnostics.slow_consumer("1", "foo");
        assert_eq!(
            rx.try_recv().unwrap(),
            Diagnostic::SlowConsumer {
                sid: "1".into(),
                subject: "foo".into(),
                occurrences: 5,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let diagnostics = Diagnostics::new(Duration::from_secs(1));
        let mut rx = diagnostics.subscribe();

        diagnostics.slow_consumer("1", "foo");
        diagnostics.slow_consumer("2", "bar");
        diagnostics.handler_panicked("1");

        assert!(matches!(rx.try_recv().unwrap(), Diagnostic::SlowConsumer { .. }));
        assert!(matches!(rx.try_recv().unwrap(), Diagnostic::SlowConsumer { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Diagnostic::HandlerPanicked { .. }
        ));
    }

    #[tokio::test]
    async fn test_notice_is_not_limited() {
        let diagnostics = Diagnostics::new(Duration::from_secs(60));
        let mut rx = diagnostics.subscribe();
        for _ in 0..3 {
            diagnostics.notice(Diagnostic::LameDuckMode {
                server: "n1".into(),
            });
        }
        for _ in 0..3 {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[test]
    fn test_emit_without_receivers() {
        let diagnostics = Diagnostics::new(DEFAULT_DIAGNOSTICS_INTERVAL);
        diagnostics.server_error("Permissions Violation");
        diagnostics.forget("1");
    }
}
