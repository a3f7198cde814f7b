//! The connection engine: one long-lived logical connection that rotates
//! through cluster members, runs the handshake, reads and routes replies,
//! follows redirects, and reconnects with backoff.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::endpoint::{Endpoint, Members};
use crate::handshake::{Handshake, HandshakeStatus};
use crate::intercept;
use crate::listener::{Disconnect, ListenerRegistry};
use crate::options::{BackoffPolicy, BackpressureStrategy, RetryStrategy};
use crate::pubsub::{Message, MessageListener, SubscriptionSet};
use crate::resp::{EncodedRequest, ResponseReader, Value};
use crate::stager::RequestStager;
use crate::stream::{Interrupter, NetworkStream, ReadHalf, TlsConfig};

const RECV_BUFFER_SIZE: usize = 2048;

/// What happens to replies once the handshake is out of the way.
pub(crate) enum ReplyRouting {
    /// Pair each reply with the oldest pending request.
    Pairing,
    /// Forward every frame to a listener; nothing is paired.
    Subscription(Arc<dyn MessageListener>),
}

pub(crate) struct EngineConfig {
    pub members: Members,
    pub transparent_redirects: bool,
    pub retry_strategy: RetryStrategy,
    pub backpressure: BackpressureStrategy,
    pub tls: TlsConfig,
    pub handshake: Option<Box<dyn Handshake>>,
    pub backoff: BackoffPolicy,
    pub routing: ReplyRouting,
    /// The live subscription set re-established as soon as a connection is
    /// ready; `None` on command connections.
    pub subscriptions: Option<Arc<SubscriptionSet>>,
}

/// State shared between the engine thread and the owning facade.
pub(crate) struct EngineShared {
    pub(crate) stager: Arc<RequestStager>,
    pub(crate) listeners: ListenerRegistry,
    shutdown: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    interrupter: Mutex<Option<Interrupter>>,
    epoch: AtomicU64,
}

impl EngineShared {
    fn new(stager: Arc<RequestStager>) -> EngineShared {
        let (wake_tx, wake_rx) = unbounded();
        EngineShared {
            stager,
            listeners: ListenerRegistry::default(),
            shutdown: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            interrupter: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.wake_tx.send(());
        self.stager.begin_shutdown();
        if let Some(interrupter) = self.take_interrupter() {
            interrupter.interrupt();
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn set_interrupter(&self, interrupter: Interrupter) {
        let mut slot = self.interrupter.lock().expect("interrupter lock poisoned");
        *slot = Some(interrupter);
    }

    fn take_interrupter(&self) -> Option<Interrupter> {
        self.interrupter
            .lock()
            .expect("interrupter lock poisoned")
            .take()
    }

    /// Sleep that returns early on shutdown.
    fn sleep(&self, duration: Duration) {
        let _ = self.wake_rx.recv_timeout(duration);
    }
}

/// Owns the engine and writer threads; dropping it shuts both down and
/// settles pending requests per the retry policy.
pub(crate) struct ConnectionHandle {
    shared: Arc<EngineShared>,
    engine: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub(crate) fn start(config: EngineConfig) -> ConnectionHandle {
        let pairs_replies = matches!(config.routing, ReplyRouting::Pairing);
        let stager = Arc::new(RequestStager::new(config.backpressure, pairs_replies));
        let shared = Arc::new(EngineShared::new(Arc::clone(&stager)));

        let writer = {
            let stager = Arc::clone(&stager);
            thread::spawn(move || stager.writer_loop())
        };
        let engine = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || ConnectionEngine::new(config, shared).run())
        };

        ConnectionHandle {
            shared,
            engine: Some(engine),
            writer: Some(writer),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.shared.begin_shutdown();
        if let Some(engine) = self.engine.take() {
            let _ = engine.join();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

struct ConnectionEngine {
    members: Members,
    next_member: usize,
    redirected: Option<Endpoint>,
    redirection_active: bool,
    transparent_redirects: bool,
    retry_strategy: RetryStrategy,
    tls: TlsConfig,
    handshake: Option<Box<dyn Handshake>>,
    handshake_pending: bool,
    routing: ReplyRouting,
    subscriptions: Option<Arc<SubscriptionSet>>,
    backoff: Backoff,
    last_available: Instant,
    connected: bool,
    shared: Arc<EngineShared>,
}

impl ConnectionEngine {
    fn new(config: EngineConfig, shared: Arc<EngineShared>) -> ConnectionEngine {
        ConnectionEngine {
            members: config.members,
            next_member: 0,
            redirected: None,
            redirection_active: false,
            transparent_redirects: config.transparent_redirects,
            retry_strategy: config.retry_strategy,
            tls: config.tls,
            handshake: config.handshake,
            handshake_pending: false,
            routing: config.routing,
            subscriptions: config.subscriptions,
            backoff: Backoff::new(config.backoff),
            last_available: Instant::now(),
            connected: false,
            shared,
        }
    }

    fn run(mut self) {
        while !self.shared.is_shutdown() {
            match self.establish() {
                Ok((read, reader)) => {
                    let reason = self.read_loop(read, reader);
                    self.teardown(reason);
                }
                Err(reason) => self.teardown(reason),
            }
            if self.shared.is_shutdown() {
                break;
            }
            self.shared.sleep(self.backoff.next_delay());
        }

        self.shared.stager.deactivate();
        self.shared.stager.clear_pending();
    }

    /// Pick the next endpoint, open a stream, and arm the handshake. The
    /// read loop only ever runs against a live stream.
    fn establish(&mut self) -> Result<(ReadHalf, ResponseReader), Disconnect> {
        let target = self.select_endpoint();
        let stream = NetworkStream::connect(&target, &self.tls).map_err(|err| {
            tracing::debug!(endpoint = %target, "connect failed: {err}");
            Disconnect::Transport(err.to_string())
        })?;
        self.shared.set_interrupter(stream.interrupter());
        let (read, write) = stream.split();

        let gated = self.handshake.is_some();
        self.shared.stager.activate(write, gated);

        if let Some(handshake) = self.handshake.as_mut() {
            handshake.restart();
            self.handshake_pending = true;
            for frame in handshake.provide() {
                self.shared
                    .stager
                    .stage_preamble(EncodedRequest::encode(&frame));
            }
        } else {
            self.handshake_pending = false;
            self.on_ready();
        }

        Ok((read, ResponseReader::new()))
    }

    fn select_endpoint(&mut self) -> Endpoint {
        let mut target = self.members.at(self.next_member).clone();
        self.next_member = (self.next_member + 1) % self.members.len();

        if let Some(redirect) = self.redirected.take() {
            tracing::info!(endpoint = %redirect, "following redirect");
            self.redirection_active = true;
            target = redirect;
        } else if self.redirection_active {
            tracing::info!("leaving redirection mode, back to configured members");
            self.redirection_active = false;
        }

        intercept::translate(&target)
    }

    fn read_loop(&mut self, mut read: ReadHalf, mut reader: ResponseReader) -> Disconnect {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let status = read.recv(&mut buf);
            if self.shared.is_shutdown() {
                return Disconnect::Shutdown;
            }
            if !status.alive {
                return Disconnect::Transport("connection closed".to_string());
            }
            if status.bytes_read == 0 {
                continue;
            }
            reader.feed(&buf[..status.bytes_read]);
            loop {
                match reader.next_response() {
                    Ok(Some(reply)) => {
                        if let Err(reason) = self.route(reply) {
                            return reason;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => return Disconnect::Protocol(err.to_string()),
                }
            }
        }
    }

    /// Dispatch one parsed reply: handshake first, then redirects, then
    /// pairing or subscription delivery.
    fn route(&mut self, reply: Value) -> Result<(), Disconnect> {
        if self.handshake_pending {
            let mut completed = false;
            if let Some(handshake) = self.handshake.as_mut() {
                match handshake.validate(&reply) {
                    HandshakeStatus::Invalid => {
                        tracing::warn!(reply = %reply.describe(), "handshake rejected reply");
                        return Err(Disconnect::HandshakeRejected);
                    }
                    HandshakeStatus::ValidIncomplete => {
                        for frame in handshake.provide() {
                            self.shared
                                .stager
                                .stage_preamble(EncodedRequest::encode(&frame));
                        }
                        return Ok(());
                    }
                    HandshakeStatus::ValidComplete => completed = true,
                }
            }
            if completed {
                self.handshake_pending = false;
                self.on_ready();
                self.shared.stager.open_gate();
            }
            return Ok(());
        }

        if self.transparent_redirects {
            if let Some(endpoint) = parse_moved(&reply) {
                return Err(Disconnect::Redirected(endpoint));
            }
        }

        match &self.routing {
            ReplyRouting::Pairing => self
                .shared
                .stager
                .satisfy(reply)
                .map_err(|err| Disconnect::Protocol(err.to_string())),
            ReplyRouting::Subscription(listener) => {
                match Message::parse(&reply) {
                    Some(message) => listener.on_message(message),
                    None => {
                        tracing::debug!(reply = %reply.describe(), "ignoring unrecognized pub/sub frame")
                    }
                }
                Ok(())
            }
        }
    }

    /// Runs once per successful post-handshake connection.
    fn on_ready(&mut self) {
        let epoch = self.shared.next_epoch();
        self.backoff.reset();
        self.last_available = Instant::now();
        self.connected = true;

        if let Some(subscriptions) = &self.subscriptions {
            for frame in subscriptions.subscribe_frames() {
                self.shared
                    .stager
                    .stage_preamble(EncodedRequest::encode(&frame));
            }
        }

        tracing::debug!(epoch, "connection established");
        self.shared.listeners.notify_established(epoch);
    }

    fn teardown(&mut self, reason: Disconnect) {
        self.shared.stager.deactivate();
        // Kill the old socket outright; a writer mid-send must not hang on
        // a peer that stopped reading.
        if let Some(interrupter) = self.shared.take_interrupter() {
            interrupter.interrupt();
        }

        if let Disconnect::Redirected(endpoint) = &reason {
            self.redirected = Some(endpoint.clone());
        }

        if self.connected {
            self.connected = false;
            let epoch = self.shared.epoch();
            tracing::debug!(epoch, reason = %reason, "connection lost");
            self.shared.listeners.notify_lost(epoch, &reason);
        }

        if matches!(reason, Disconnect::Shutdown) {
            return;
        }
        if self.should_purge() {
            self.shared.stager.clear_pending();
        }
    }

    fn should_purge(&self) -> bool {
        match self.retry_strategy {
            RetryStrategy::NoRetries => true,
            RetryStrategy::InfiniteRetries => false,
            RetryStrategy::WithTimeout(timeout) => self.last_available.elapsed() > timeout,
        }
    }
}

/// Extract the target of a `MOVED <slot> <host>:<port>` error. The slot
/// field is ignored.
fn parse_moved(reply: &Value) -> Option<Endpoint> {
    let Value::Error(message) = reply else {
        return None;
    };
    let mut parts = message.split_whitespace();
    if parts.next()? != "MOVED" {
        return None;
    }
    let _slot = parts.next()?;
    let target = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Endpoint::parse(target)
}

struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    fn new(policy: BackoffPolicy) -> Backoff {
        Backoff {
            policy,
            current: policy.base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.policy.cap);
        self.current = next.min(self.policy.cap);
        delay
    }

    fn reset(&mut self) {
        self.current = self.policy.base;
    }
}
