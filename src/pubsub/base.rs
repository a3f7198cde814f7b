use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::connection::{ConnectionHandle, EngineConfig, ReplyRouting};
use crate::endpoint::Members;
use crate::options::{BackpressureStrategy, RetryStrategy, SubscriptionOptions};
use crate::pubsub::MessageListener;
use crate::resp::EncodedRequest;
use crate::stager::RequestStager;

/// A connection held in subscription mode.
///
/// This models a raw pub/sub connection: every incoming frame, including
/// subscribe/unsubscribe acknowledgements, goes to the single listener.
/// No per-channel filtering happens here; that's [`Subscriber`]'s job.
///
/// The connection reconnects forever. The subscriber tracks its live
/// channel and pattern set; each reconnect re-establishes exactly that
/// set, not the history of subscribe/unsubscribe calls that produced it.
///
/// [`Subscriber`]: crate::pubsub::Subscriber
pub struct BaseSubscriber {
    handle: ConnectionHandle,
    subscriptions: Arc<SubscriptionSet>,
}

impl BaseSubscriber {
    pub fn new(
        members: Members,
        listener: Arc<dyn MessageListener>,
        options: SubscriptionOptions,
    ) -> BaseSubscriber {
        let SubscriptionOptions {
            channels,
            patterns,
            tls,
            handshake,
            backoff,
        } = options;
        let subscriptions = Arc::new(SubscriptionSet::seeded(channels, patterns));
        let config = EngineConfig {
            members,
            transparent_redirects: true,
            retry_strategy: RetryStrategy::InfiniteRetries,
            backpressure: BackpressureStrategy::Unlimited,
            tls,
            handshake,
            backoff,
            routing: ReplyRouting::Subscription(listener),
            subscriptions: Some(Arc::clone(&subscriptions)),
        };
        BaseSubscriber {
            handle: ConnectionHandle::start(config),
            subscriptions,
        }
    }

    /// Subscribe to more channels at runtime. The acknowledgement arrives
    /// through the listener like any other frame, and the channels stay
    /// subscribed across reconnects until unsubscribed.
    pub fn subscribe(&self, channels: &[&str]) {
        self.subscriptions.add_channels(channels);
        self.send_command("SUBSCRIBE", channels);
    }

    pub fn unsubscribe(&self, channels: &[&str]) {
        self.subscriptions.remove_channels(channels);
        self.send_command("UNSUBSCRIBE", channels);
    }

    pub fn psubscribe(&self, patterns: &[&str]) {
        self.subscriptions.add_patterns(patterns);
        self.send_command("PSUBSCRIBE", patterns);
    }

    pub fn punsubscribe(&self, patterns: &[&str]) {
        self.subscriptions.remove_patterns(patterns);
        self.send_command("PUNSUBSCRIBE", patterns);
    }

    fn send_command(&self, command: &str, names: &[&str]) {
        if names.is_empty() {
            return;
        }
        let mut frame = vec![command];
        frame.extend_from_slice(names);
        // No pairing in subscription mode; the request is retired once
        // written and the future only ever resolves to nil.
        let _ = self.stager().stage(EncodedRequest::encode(&frame));
    }

    pub(crate) fn stager(&self) -> &Arc<RequestStager> {
        &self.handle.shared().stager
    }

    pub(crate) fn subscription_set(&self) -> &Arc<SubscriptionSet> {
        &self.subscriptions
    }
}

/// The live channel and pattern set of a subscription connection. The
/// engine regenerates `SUBSCRIBE`/`PSUBSCRIBE` frames from it on every
/// reconnect.
#[derive(Default)]
pub(crate) struct SubscriptionSet {
    inner: Mutex<SetState>,
}

#[derive(Default)]
struct SetState {
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
}

impl SubscriptionSet {
    fn seeded(channels: Vec<String>, patterns: Vec<String>) -> SubscriptionSet {
        SubscriptionSet {
            inner: Mutex::new(SetState {
                channels: channels.into_iter().collect(),
                patterns: patterns.into_iter().collect(),
            }),
        }
    }

    pub(crate) fn add_channels(&self, names: &[&str]) {
        let mut state = self.lock();
        for name in names {
            state.channels.insert((*name).to_string());
        }
    }

    pub(crate) fn remove_channels(&self, names: &[&str]) {
        let mut state = self.lock();
        for name in names {
            state.channels.remove(*name);
        }
    }

    pub(crate) fn add_patterns(&self, names: &[&str]) {
        let mut state = self.lock();
        for name in names {
            state.patterns.insert((*name).to_string());
        }
    }

    pub(crate) fn remove_patterns(&self, names: &[&str]) {
        let mut state = self.lock();
        for name in names {
            state.patterns.remove(*name);
        }
    }

    /// The frames that re-establish the current set on a fresh connection.
    pub(crate) fn subscribe_frames(&self) -> Vec<Vec<String>> {
        let state = self.lock();
        let mut frames = Vec::new();
        if !state.channels.is_empty() {
            let mut frame = vec!["SUBSCRIBE".to_string()];
            frame.extend(state.channels.iter().cloned());
            frames.push(frame);
        }
        if !state.patterns.is_empty() {
            let mut frame = vec!["PSUBSCRIBE".to_string()];
            frame.extend(state.patterns.iter().cloned());
            frames.push(frame);
        }
        frames
    }

    fn lock(&self) -> MutexGuard<'_, SetState> {
        self.inner.lock().expect("subscription set lock poisoned")
    }
}
