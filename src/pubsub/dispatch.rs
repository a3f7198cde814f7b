use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::endpoint::Members;
use crate::options::SubscriptionOptions;
use crate::pubsub::{BaseSubscriber, Message, MessageListener, SubscriptionSet};
use crate::resp::EncodedRequest;
use crate::stager::RequestStager;

type MessageCallback = Box<dyn Fn(&Message) + Send + Sync>;

/// Per-channel dispatch over a [`BaseSubscriber`].
///
/// Where the base connection funnels everything into one listener, this
/// layer routes published messages to the [`Subscription`] handles
/// interested in their channel.
pub struct Subscriber {
    base: BaseSubscriber,
    dispatch: Arc<Dispatch>,
}

impl Subscriber {
    pub fn new(members: Members, options: SubscriptionOptions) -> Subscriber {
        let dispatch = Arc::new(Dispatch::default());
        let listener: Arc<dyn MessageListener> = dispatch.clone() as Arc<dyn MessageListener>;
        Subscriber {
            base: BaseSubscriber::new(members, listener, options),
            dispatch,
        }
    }

    /// Subscribe to a channel. Messages flow once a callback is attached
    /// to the returned handle; dropping the handle unsubscribes.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let state = Arc::new(SubscriptionState::default());
        let id = self.dispatch.next_id.fetch_add(1, Ordering::Relaxed);
        let first_for_channel = {
            let mut channels = self.dispatch.lock_channels();
            let entries = channels.entry(channel.to_string()).or_default();
            let first = entries.is_empty();
            entries.push(Entry {
                id,
                state: Arc::downgrade(&state),
            });
            first
        };
        if first_for_channel {
            self.base.subscribe(&[channel]);
        }
        Subscription {
            channel: channel.to_string(),
            id,
            state,
            dispatch: Arc::clone(&self.dispatch),
            subscriptions: Arc::downgrade(self.base.subscription_set()),
            stager: Arc::downgrade(self.base.stager()),
        }
    }

    /// The underlying raw connection.
    pub fn base(&self) -> &BaseSubscriber {
        &self.base
    }
}

struct Entry {
    id: u64,
    state: Weak<SubscriptionState>,
}

#[derive(Default)]
struct Dispatch {
    channels: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl Dispatch {
    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Entry>>> {
        self.channels.lock().expect("subscriber dispatch lock poisoned")
    }

    /// Remove one subscription; true if its channel has no takers left.
    fn detach(&self, channel: &str, id: u64) -> bool {
        let mut channels = self.lock_channels();
        let Some(entries) = channels.get_mut(channel) else {
            return false;
        };
        entries.retain(|entry| entry.id != id);
        if entries.is_empty() {
            channels.remove(channel);
            return true;
        }
        false
    }
}

impl MessageListener for Dispatch {
    fn on_message(&self, message: Message) {
        if !matches!(
            message,
            Message::Message { .. } | Message::PatternMessage { .. }
        ) {
            return;
        }
        let targets: Vec<Arc<SubscriptionState>> = {
            let mut channels = self.lock_channels();
            let Some(entries) = channels.get_mut(message.channel()) else {
                return;
            };
            entries.retain(|entry| entry.state.strong_count() > 0);
            entries.iter().filter_map(|entry| entry.state.upgrade()).collect()
        };
        for target in targets {
            target.deliver(&message);
        }
    }
}

#[derive(Default)]
struct SubscriptionState {
    callback: Mutex<Option<MessageCallback>>,
}

impl SubscriptionState {
    fn deliver(&self, message: &Message) {
        let callback = self.callback.lock().expect("subscription callback lock poisoned");
        if let Some(callback) = callback.as_ref() {
            callback(message);
        }
    }
}

/// A live interest in one channel. Messages arriving before a callback is
/// attached are dropped.
pub struct Subscription {
    channel: String,
    id: u64,
    state: Arc<SubscriptionState>,
    dispatch: Arc<Dispatch>,
    subscriptions: Weak<SubscriptionSet>,
    stager: Weak<RequestStager>,
}

impl Subscription {
    pub fn attach_callback(&self, callback: impl Fn(&Message) + Send + Sync + 'static) {
        let mut slot = self
            .state
            .callback
            .lock()
            .expect("subscription callback lock poisoned");
        *slot = Some(Box::new(callback));
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.dispatch.detach(&self.channel, self.id) {
            // Last interest in the channel: drop it from the live set so a
            // reconnect does not restore it, and tell the server.
            if let Some(subscriptions) = self.subscriptions.upgrade() {
                subscriptions.remove_channels(&[self.channel.as_str()]);
            }
            if let Some(stager) = self.stager.upgrade() {
                let _ = stager.stage(EncodedRequest::encode(&["UNSUBSCRIBE", &self.channel]));
            }
        }
    }
}
