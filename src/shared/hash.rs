//! A client-local replica of a server-side versioned hash.
//!
//! The server assigns each hash a monotonically increasing, contiguous
//! revision number. A replica stays current through two mechanisms: a
//! snapshot fetched with `VHGETALL` (resilvering), and per-revision
//! updates delivered over the `__vhash@<key>` pub/sub channel. Any gap or
//! rollback in the revision stream means messages were missed, and the
//! replica refetches the snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::client::Client;
use crate::listener::{ConnectionListener, Disconnect};
use crate::pubsub::{Subscriber, Subscription};
use crate::resp::{EncodedRequest, Value};
use crate::stager::ReplyFuture;

struct HashState {
    version: u64,
    contents: HashMap<String, String>,
}

/// A replicated key-value map, eventually consistent with the server.
///
/// Reads are served locally. Writes go to the server and come back as
/// revision updates or through the next snapshot; they are fire-and-forget
/// and carry no delivery guarantee under network instability.
pub struct SharedHash {
    key: String,
    client: Arc<Client>,
    state: RwLock<HashState>,
    /// Snapshot request in flight, polled opportunistically from every
    /// externally visible operation and every incoming message.
    snapshot: Mutex<Option<ReplyFuture>>,
    subscription: Mutex<Option<Subscription>>,
}

impl SharedHash {
    /// Build a replica of the hash at `key`. The hash registers itself for
    /// connection events on `client` and subscribes to the hash's update
    /// channel on `subscriber`; an initial resilver starts immediately.
    pub fn new(client: Arc<Client>, subscriber: &Subscriber, key: impl Into<String>) -> Arc<SharedHash> {
        let key = key.into();
        let hash = Arc::new(SharedHash {
            key: key.clone(),
            client,
            state: RwLock::new(HashState {
                version: 0,
                contents: HashMap::new(),
            }),
            snapshot: Mutex::new(None),
            subscription: Mutex::new(None),
        });

        let listener: Arc<dyn ConnectionListener> = hash.clone();
        hash.client.attach_listener(&listener);

        let subscription = subscriber.subscribe(&format!("__vhash@{key}"));
        let weak: Weak<SharedHash> = Arc::downgrade(&hash);
        subscription.attach_callback(move |_message| {
            if let Some(hash) = weak.upgrade() {
                hash.check_pending_snapshot();
            }
        });
        *hash.subscription.lock().expect("subscription slot lock poisoned") = Some(subscription);

        hash.trigger_resilver();
        hash
    }

    /// Read one field. Eventually consistent: another client may have set
    /// a newer value, acknowledged and all, that simply hasn't reached
    /// this replica yet.
    pub fn get(&self, field: &str) -> Option<String> {
        self.check_pending_snapshot();
        let state = self.state.read().expect("hash state lock poisoned");
        state.contents.get(field).cloned()
    }

    /// Set one field. An empty value is a deletion.
    pub fn set(&self, field: impl Into<String>, value: impl Into<String>) {
        let mut batch = HashMap::new();
        batch.insert(field.into(), value.into());
        self.set_batch(&batch);
    }

    /// Set a batch of fields in a single pipelined `MULTI` block.
    pub fn set_batch(&self, batch: &HashMap<String, String>) {
        if batch.is_empty() {
            return;
        }
        let commands: Vec<Vec<String>> = batch
            .iter()
            .map(|(field, value)| {
                if value.is_empty() {
                    vec!["VHDEL".to_string(), self.key.clone(), field.clone()]
                } else {
                    vec![
                        "VHSET".to_string(),
                        self.key.clone(),
                        field.clone(),
                        value.clone(),
                    ]
                }
            })
            .collect();
        let _ = self.client.execute_encoded(EncodedRequest::multi(&commands));
    }

    /// Delete one field.
    pub fn del(&self, field: impl Into<String>) {
        self.set(field, "");
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn current_version(&self) -> u64 {
        self.check_pending_snapshot();
        let state = self.state.read().expect("hash state lock poisoned");
        state.version
    }

    /// Apply one revision from the update stream.
    ///
    /// Returns true if the revision was contiguous and applied. A revision
    /// at or below the current version, or two or more ahead of it, is not
    /// applied; the replica is out of sync and a resilver is triggered.
    pub fn feed_revision(&self, revision: u64, updates: &[(String, String)]) -> bool {
        {
            let mut state = self.state.write().expect("hash state lock poisoned");
            if revision <= state.version {
                tracing::error!(
                    key = %self.key,
                    revision,
                    version = state.version,
                    "hash has a newer version than the incoming revision, resilvering"
                );
            } else if revision >= state.version + 2 {
                tracing::warn!(
                    key = %self.key,
                    revision,
                    version = state.version,
                    "revision stream has a gap, resilvering"
                );
            } else {
                for (field, value) in updates {
                    if value.is_empty() {
                        state.contents.remove(field);
                    } else {
                        state.contents.insert(field.clone(), value.clone());
                    }
                }
                state.version = revision;
                return true;
            }
        }
        self.trigger_resilver();
        false
    }

    /// Replace the whole contents with a freshly fetched snapshot.
    /// Snapshots are authoritative: one older than the current version
    /// still wins, which the log line makes visible.
    pub fn resilver(&self, revision: u64, contents: HashMap<String, String>) {
        let mut state = self.state.write().expect("hash state lock poisoned");
        tracing::warn!(
            key = %self.key,
            from = state.version,
            to = revision,
            "resilvering hash contents"
        );
        state.version = revision;
        state.contents = contents;
    }

    /// Detach from the client. Also happens implicitly when the last
    /// reference drops, but an explicit close makes the timing clear.
    pub fn close(self: &Arc<Self>) {
        let listener: Arc<dyn ConnectionListener> = self.clone();
        self.client.detach_listener(&listener);
        *self.subscription.lock().expect("subscription slot lock poisoned") = None;
        *self.snapshot.lock().expect("snapshot slot lock poisoned") = None;
    }

    fn trigger_resilver(&self) {
        let future = self.client.execute(&["VHGETALL", &self.key]);
        let mut slot = self.snapshot.lock().expect("snapshot slot lock poisoned");
        *slot = Some(future);
    }

    /// Non-blocking poll of the snapshot slot; applies the reply if it
    /// landed.
    fn check_pending_snapshot(&self) {
        let ready = {
            let mut slot = self.snapshot.lock().expect("snapshot slot lock poisoned");
            match slot.as_ref().map(ReplyFuture::try_get) {
                Some(Ok(Some(reply))) => {
                    *slot = None;
                    Some(reply)
                }
                Some(Ok(None)) => None,
                Some(Err(_)) => {
                    // Client shut down; the snapshot will never arrive.
                    *slot = None;
                    None
                }
                None => None,
            }
        };
        if let Some(reply) = ready {
            self.apply_snapshot(reply);
        }
    }

    fn apply_snapshot(&self, reply: Value) {
        match parse_snapshot(&reply) {
            Some((revision, contents)) => self.resilver(revision, contents),
            None => {
                tracing::warn!(
                    key = %self.key,
                    reply = %reply.describe(),
                    "could not parse hash snapshot"
                );
            }
        }
    }
}

impl ConnectionListener for SharedHash {
    fn connection_established(&self, _epoch: u64) {
        self.trigger_resilver();
        self.check_pending_snapshot();
    }

    fn connection_lost(&self, _epoch: u64, _reason: &Disconnect) {}
}

/// Snapshot replies have the shape `[integer revision, [k1, v1, k2, v2, …]]`.
fn parse_snapshot(reply: &Value) -> Option<(u64, HashMap<String, String>)> {
    let items = reply.as_array()?;
    let [revision, contents] = items else {
        return None;
    };
    let revision = u64::try_from(revision.as_integer()?).ok()?;
    let pairs = contents.as_array()?;
    if pairs.len() % 2 != 0 {
        return None;
    }
    let mut map = HashMap::with_capacity(pairs.len() / 2);
    for pair in pairs.chunks_exact(2) {
        let field = bulk_string(&pair[0])?;
        let value = bulk_string(&pair[1])?;
        map.insert(field, value);
    }
    Some((revision, map))
}

fn bulk_string(value: &Value) -> Option<String> {
    match value {
        Value::Bulk(data) => String::from_utf8(data.to_vec()).ok(),
        _ => None,
    }
}
