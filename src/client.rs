//! The public client facade.

use std::sync::Arc;

use crate::connection::{ConnectionHandle, EngineConfig, ReplyRouting};
use crate::error::ClientError;
use crate::listener::ConnectionListener;
use crate::options::ClientOptions;
use crate::resp::{EncodedRequest, Value};
use crate::stager::ReplyFuture;

/// How many times the synchronous wrappers re-issue a command whose reply
/// came back nil.
const SYNC_RETRIES: usize = 3;

/// A concurrent RESP client over one logical connection.
///
/// Requests are pipelined: any thread may call [`execute`](Self::execute),
/// and replies resolve in submission order. The client reconnects on its
/// own; what happens to in-flight requests across a reconnect is governed
/// by the [`RetryStrategy`](crate::RetryStrategy) it was built with.
///
/// Dropping the client shuts down its two background threads and settles
/// every pending request.
pub struct Client {
    handle: ConnectionHandle,
}

impl Client {
    pub fn new(options: ClientOptions) -> Client {
        let config = EngineConfig {
            members: options.members,
            transparent_redirects: options.transparent_redirects,
            retry_strategy: options.retry_strategy,
            backpressure: options.backpressure,
            tls: options.tls,
            handshake: options.handshake,
            backoff: options.backoff,
            routing: ReplyRouting::Pairing,
            subscriptions: None,
        };
        Client {
            handle: ConnectionHandle::start(config),
        }
    }

    /// Stage one command, given as its argument list. May block when
    /// backpressure is active and the pending queue is full.
    pub fn execute<A: AsRef<[u8]>>(&self, args: &[A]) -> ReplyFuture {
        self.execute_encoded(EncodedRequest::encode(args))
    }

    /// Stage an already-encoded request.
    pub fn execute_encoded(&self, request: EncodedRequest) -> ReplyFuture {
        self.handle.shared().stager.stage(request)
    }

    /// Stage a command and run `callback` with the reply instead of
    /// returning a future. The callback runs on the engine thread.
    pub fn execute_callback<A: AsRef<[u8]>>(
        &self,
        args: &[A],
        callback: impl FnOnce(Value) + Send + 'static,
    ) {
        self.handle
            .shared()
            .stager
            .stage_callback(EncodedRequest::encode(args), Box::new(callback));
    }

    /// `EXISTS key`, synchronous.
    pub fn exists(&self, key: &str) -> Result<i64, ClientError> {
        self.expect_integer(&["EXISTS", key])
    }

    /// `DEL key`, synchronous. Returns the number of keys removed.
    pub fn del(&self, key: &str) -> Result<i64, ClientError> {
        self.expect_integer(&["DEL", key])
    }

    pub fn del_async(&self, key: &str) -> ReplyFuture {
        self.execute(&["DEL", key])
    }

    /// The epoch of the current connection generation; increments on every
    /// successful post-handshake connection.
    pub fn epoch(&self) -> u64 {
        self.handle.shared().epoch()
    }

    pub fn attach_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.handle.shared().listeners.attach(listener);
    }

    pub fn detach_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.handle.shared().listeners.detach(listener);
    }

    fn expect_integer(&self, args: &[&str]) -> Result<i64, ClientError> {
        match self.handle_response(args)? {
            Value::Integer(n) => Ok(n),
            other => Err(ClientError::UnexpectedReply {
                expected: "integer",
                got: other.describe(),
            }),
        }
    }

    /// Resolve a command synchronously: nil replies are retried a bounded
    /// number of times, error replies and exhaustion become errors.
    fn handle_response(&self, args: &[&str]) -> Result<Value, ClientError> {
        let mut attempts = SYNC_RETRIES;
        loop {
            let reply = self.execute(args).wait()?;
            match reply {
                Value::Nil => {
                    attempts -= 1;
                    if attempts == 0 {
                        return Err(ClientError::NoResponse);
                    }
                }
                Value::Error(message) => return Err(ClientError::ErrorReply(message)),
                other => return Ok(other),
            }
        }
    }
}
