//! Connection-event callbacks.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::endpoint::Endpoint;

/// Why a connection went away.
#[derive(Debug, Clone)]
pub enum Disconnect {
    /// Connect failed, the peer closed, or an I/O call errored.
    Transport(String),
    /// The byte stream stopped making sense as RESP.
    Protocol(String),
    /// The handshake judged a server reply invalid.
    HandshakeRejected,
    /// A `MOVED` error pointed at another node.
    Redirected(Endpoint),
    Shutdown,
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::Transport(msg) => write!(f, "transport failure: {msg}"),
            Disconnect::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Disconnect::HandshakeRejected => write!(f, "handshake rejected"),
            Disconnect::Redirected(endpoint) => write!(f, "redirected to {endpoint}"),
            Disconnect::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Observes connection lifecycle transitions.
///
/// Both methods run on the connection engine's thread and must not block.
/// The epoch increments on every successful post-handshake connection.
pub trait ConnectionListener: Send + Sync {
    fn connection_established(&self, epoch: u64);
    fn connection_lost(&self, epoch: u64, reason: &Disconnect);
}

/// Weakly-held listener set. The client never owns its listeners; entries
/// whose owner went away are pruned on the next emission.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    entries: Mutex<Vec<Weak<dyn ConnectionListener>>>,
}

impl ListenerRegistry {
    pub(crate) fn attach(&self, listener: &Arc<dyn ConnectionListener>) {
        let mut entries = self.entries.lock().expect("listener registry lock poisoned");
        entries.push(Arc::downgrade(listener));
    }

    pub(crate) fn detach(&self, listener: &Arc<dyn ConnectionListener>) {
        let target = Arc::downgrade(listener);
        let mut entries = self.entries.lock().expect("listener registry lock poisoned");
        entries.retain(|entry| !Weak::ptr_eq(entry, &target));
    }

    pub(crate) fn notify_established(&self, epoch: u64) {
        for listener in self.snapshot() {
            listener.connection_established(epoch);
        }
    }

    pub(crate) fn notify_lost(&self, epoch: u64, reason: &Disconnect) {
        for listener in self.snapshot() {
            listener.connection_lost(epoch, reason);
        }
    }

    /// Copy live listeners under the lock; invoke them outside it.
    fn snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        let mut entries = self.entries.lock().expect("listener registry lock poisoned");
        entries.retain(|entry| entry.strong_count() > 0);
        entries.iter().filter_map(Weak::upgrade).collect()
    }
}
