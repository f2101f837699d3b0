//! Connection options.
//!
//! [`Options`] carries every knob with a sensible default; [`ClientBuilder`]
//! is the fluent way to fill it in.
//!
//! [`ClientBuilder`]: crate::ClientBuilder

use std::time::Duration;

use crate::backpressure::DEFAULT_MAX_PENDING;
use crate::diagnostics::DEFAULT_DIAGNOSTICS_INTERVAL;
use crate::handler::DispatchMode;
use crate::protocol::DEFAULT_MAX_CONTROL_LINE;
use crate::transport::ServerAddr;

/// Default capacity of each subscription's message buffer.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 512;

/// Default inbox prefix for request replies.
pub const DEFAULT_INBOX_PREFIX: &str = "_INBOX";

/// How the delay sequence of a [`ReconnectPolicy`] is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectMode {
    /// Try once per delay, then give up and close.
    #[default]
    Exhaust,
    /// Start over at the first delay when the sequence runs out.
    Cycle,
}

/// Delays between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delays: Vec<Duration>,
    pub mode: ReconnectMode,
}

impl ReconnectPolicy {
    /// Never reconnect; the first lost session closes the client.
    pub fn disabled() -> Self {
        Self {
            delays: Vec::new(),
            mode: ReconnectMode::Exhaust,
        }
    }

    /// `attempts` tries, the same delay before each.
    pub fn fixed(delay: Duration, attempts: usize) -> Self {
        Self {
            delays: vec![delay; attempts],
            mode: ReconnectMode::Exhaust,
        }
    }

    /// `attempts` tries with the delay doubling from `initial` up to `max`.
    pub fn exponential(initial: Duration, max: Duration, attempts: usize) -> Self {
        let mut delays = Vec::with_capacity(attempts);
        let mut delay = initial;
        for _ in 0..attempts {
            delays.push(delay.min(max));
            delay = delay.saturating_mul(2);
        }
        Self {
            delays,
            mode: ReconnectMode::Exhaust,
        }
    }

    /// Keep retrying forever, cycling through the delays.
    pub fn forever(mut self) -> Self {
        self.mode = ReconnectMode::Cycle;
        self
    }

    /// The delays to sleep, in order, for one outage.
    pub(crate) fn schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let delays = self.delays.clone().into_iter();
        match self.mode {
            ReconnectMode::Exhaust => Box::new(delays),
            ReconnectMode::Cycle => Box::new(delays.cycle()),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100), Duration::from_secs(5), 60)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Client name reported in CONNECT.
    pub name: Option<String>,
    /// Ask the server to acknowledge every frame with `+OK`.
    pub verbose: bool,
    pub pedantic: bool,
    /// Receive messages this connection published itself.
    pub echo: bool,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,
    pub jwt: Option<String>,
    pub tls_required: bool,
    /// Advertise header support (needed for HPUB/HMSG).
    pub headers: bool,
    /// Ask for 503 status replies when a request has no responders.
    pub no_responders: bool,
    /// Bound on the whole handshake, per server.
    pub connect_timeout: Duration,
    /// Default deadline for `request`.
    pub request_timeout: Duration,
    pub ping_interval: Duration,
    /// Unanswered keepalive PINGs before the session is considered stale.
    pub max_pings_outstanding: usize,
    pub reconnect: ReconnectPolicy,
    /// Outbound frames queued before publishes fail with `Capacity`.
    pub max_pending_frames: usize,
    /// Default per-subscription buffer size.
    pub subscription_capacity: usize,
    /// Default handler scheduling for new subscriptions.
    pub dispatch_mode: DispatchMode,
    pub inbox_prefix: String,
    /// Bound on a graceful drain.
    pub drain_timeout: Duration,
    /// Rate-limit window of the diagnostics channel.
    pub diagnostics_interval: Duration,
    pub max_control_line: usize,
    /// Extra servers to fail over to, after the one passed to `connect`.
    pub servers: Vec<ServerAddr>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: None,
            verbose: false,
            pedantic: false,
            echo: true,
            user: None,
            pass: None,
            token: None,
            jwt: None,
            tls_required: false,
            headers: true,
            no_responders: true,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(120),
            max_pings_outstanding: 2,
            reconnect: ReconnectPolicy::default(),
            max_pending_frames: DEFAULT_MAX_PENDING,
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            dispatch_mode: DispatchMode::default(),
            inbox_prefix: DEFAULT_INBOX_PREFIX.to_string(),
            drain_timeout: Duration::from_secs(30),
            diagnostics_interval: DEFAULT_DIAGNOSTICS_INTERVAL,
            max_control_line: DEFAULT_MAX_CONTROL_LINE,
            servers: Vec::new(),
        }
    }
}

/// Per-subscription settings.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Join this queue group.
    pub queue_group: Option<String>,
    /// Buffer size; defaults to `Options::subscription_capacity`.
    pub capacity: Option<usize>,
    /// Handler scheduling; defaults to `Options::dispatch_mode`.
    pub dispatch: Option<DispatchMode>,
    /// Auto-unsubscribe after this many messages.
    pub max_msgs: Option<u64>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = Some(mode);
        self
    }

    pub fn max_msgs(mut self, max: u64) -> Self {
        self.max_msgs = Some(max);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_caps_delay() {
        let policy =
            ReconnectPolicy::exponential(Duration::from_millis(100), Duration::from_millis(350), 4);
        assert_eq!(
            policy.delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
    }

    #[test]
    fn test_exhaust_schedule_ends() {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(10), 3);
        assert_eq!(policy.schedule().count(), 3);
        assert_eq!(ReconnectPolicy::disabled().schedule().count(), 0);
    }

    #[test]
    fn test_cycle_schedule_repeats() {
        let policy = ReconnectPolicy {
            delays: vec![Duration::from_millis(1), Duration::from_millis(2)],
            mode: ReconnectMode::Cycle,
        };
        let first: Vec<_> = policy.schedule().take(5).collect();
        assert_eq!(
            first,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(1),
            ]
        );
    }

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert!(options.echo);
        assert!(options.headers);
        assert!(!options.verbose);
        assert_eq!(options.inbox_prefix, "_INBOX");
        assert_eq!(options.max_pings_outstanding, 2);
        assert_eq!(options.dispatch_mode, DispatchMode::Sequential);
    }

    #[test]
    fn test_subscribe_options_builder() {
        let options = SubscribeOptions::new()
            .queue_group("workers")
            .capacity(4)
            .max_msgs(10);
        assert_eq!(options.queue_group.as_deref(), Some("workers"));
        assert_eq!(options.capacity, Some(4));
        assert_eq!(options.max_msgs, Some(10));
        assert_eq!(options.dispatch, None);
    }
}
