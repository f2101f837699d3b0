//! Connection lifecycle state machine.

use std::fmt;

use tokio::sync::watch;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Draining,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Closed)
                | (Connecting, Connected)
                | (Connecting, Closed)
                | (Connected, Reconnecting)
                | (Connected, Draining)
                | (Connected, Closed)
                | (Reconnecting, Connected)
                | (Reconnecting, Draining)
                | (Reconnecting, Closed)
                | (Draining, Closed)
        )
    }

    /// Whether publishes and subscriptions are still accepted.
    pub fn is_accepting(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Draining => "DRAINING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Current state, observable through a watch channel.
///
/// Transitions outside the table are ignored and logged.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Returns whether the transition happened.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let mut from = next;
        let changed = self.tx.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(%from, to = %next, "Connection state changed");
        } else if from != next {
            tracing::trace!(%from, to = %next, "Ignored state transition");
        }
        changed
    }
}
