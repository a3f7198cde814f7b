//! Construction options for clients and subscribers.

use std::time::Duration;

use crate::endpoint::Members;
use crate::handshake::Handshake;
use crate::stream::TlsConfig;

/// What happens to pending requests when the connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Pending requests are answered with a nil reply on every disconnect.
    NoRetries,
    /// Pending requests survive reconnects until this much time has passed
    /// since the last healthy connection. The timeout is per-connection,
    /// not per-request.
    WithTimeout(Duration),
    /// Pending requests are never dropped; callers hang for as long as the
    /// backend stays unreachable.
    InfiniteRetries,
}

impl RetryStrategy {
    pub fn active(&self) -> bool {
        !matches!(self, RetryStrategy::NoRetries)
    }
}

/// Bound on the number of in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStrategy {
    Unlimited,
    /// Callers staging a request block once this many are pending.
    PendingLimit(usize),
}

impl Default for BackpressureStrategy {
    fn default() -> Self {
        BackpressureStrategy::PendingLimit(32768)
    }
}

/// Reconnect backoff: starts at `base`, doubles up to `cap`, and resets
/// after any successful post-handshake connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2048),
        }
    }
}

/// Options for constructing a [`Client`](crate::Client).
pub struct ClientOptions {
    pub members: Members,
    /// Follow `MOVED` errors to the node they point at.
    pub transparent_redirects: bool,
    pub retry_strategy: RetryStrategy,
    pub backpressure: BackpressureStrategy,
    pub tls: TlsConfig,
    /// First exchange to run on every new connection, before user traffic.
    pub handshake: Option<Box<dyn Handshake>>,
    pub backoff: BackoffPolicy,
}

impl ClientOptions {
    pub fn new(members: Members) -> ClientOptions {
        ClientOptions {
            members,
            transparent_redirects: false,
            retry_strategy: RetryStrategy::NoRetries,
            backpressure: BackpressureStrategy::default(),
            tls: TlsConfig::Off,
            handshake: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Options for constructing a subscriber connection.
#[derive(Default)]
pub struct SubscriptionOptions {
    /// Channels subscribed as soon as a connection is ready.
    pub channels: Vec<String>,
    /// Patterns subscribed as soon as a connection is ready.
    pub patterns: Vec<String>,
    pub tls: TlsConfig,
    pub handshake: Option<Box<dyn Handshake>>,
    pub backoff: BackoffPolicy,
}

impl SubscriptionOptions {
    pub fn new() -> SubscriptionOptions {
        SubscriptionOptions::default()
    }
}
