//! A concurrent RESP client with transparent redirects, subscription-mode
//! connections, and replicated versioned hashes.
//!
//! The core is a single long-lived logical connection per [`Client`]: an
//! engine thread reads and routes replies while a writer thread drains the
//! staged-request queue, so any number of caller threads can pipeline
//! requests and wait on [`ReplyFuture`]s. The engine rotates through the
//! configured cluster [`Members`], runs an optional [`Handshake`] on every
//! new connection, follows `MOVED` redirects, and reconnects with backoff;
//! the [`RetryStrategy`] decides what happens to in-flight requests along
//! the way.
//!
//! On top of that sit [`BaseSubscriber`]/[`Subscriber`] for pub/sub mode
//! and [`SharedHash`], a client-local replica of a server-side versioned
//! hash kept consistent through snapshots plus a contiguous revision
//! stream.

#![forbid(unsafe_code)]

pub mod client;
mod connection;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod intercept;
pub mod listener;
pub mod options;
pub mod pubsub;
pub mod resp;
pub mod shared;
mod stager;
pub mod stream;

pub use client::Client;
pub use endpoint::{Endpoint, Members};
pub use error::ClientError;
pub use handshake::{AuthHandshake, Handshake, HandshakeStatus, PingHandshake};
pub use intercept::{add_intercept, clear_intercepts};
pub use listener::{ConnectionListener, Disconnect};
pub use options::{
    BackoffPolicy, BackpressureStrategy, ClientOptions, RetryStrategy, SubscriptionOptions,
};
pub use pubsub::{BaseSubscriber, Message, MessageListener, Subscriber, Subscription};
pub use resp::{EncodedRequest, ParseError, ResponseReader, Value};
pub use shared::SharedHash;
pub use stager::ReplyFuture;
pub use stream::{ConnectError, NetworkStream, RecvStatus, SendStatus, TlsConfig};

pub type Result<T> = std::result::Result<T, ClientError>;
