use thiserror::Error;

pub use crate::resp::ParseError;
pub use crate::stream::ConnectError;

/// Crate-level convenience error.
///
/// Transport and framing failures are handled inside the connection engine
/// by reconnecting; callers only observe them as nil replies, translated
/// here by the synchronous convenience wrappers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// The server never produced a reply, even after bounded retries.
    #[error("no response after retries")]
    NoResponse,

    /// The server answered with a RESP error.
    #[error("server error: {0}")]
    ErrorReply(String),

    /// The reply type did not match what the command calls for.
    #[error("unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply {
        expected: &'static str,
        got: String,
    },

    /// The client has shut down; the request can no longer be answered.
    #[error("client is shut down")]
    Shutdown,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}
