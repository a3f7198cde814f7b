//! Pluggable first-exchange protocols, run before any user traffic.

use crate::resp::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The server's reply is unacceptable; drop the connection.
    Invalid,
    /// The exchange continues; more frames follow.
    ValidIncomplete,
    /// The exchange is done; the connection graduates to normal traffic.
    ValidComplete,
}

/// The first request/reply exchange performed on every new connection.
///
/// While a handshake is pending, incoming replies are routed to
/// [`validate`](Self::validate) instead of being paired with requests. A
/// reply judged [`Invalid`](HandshakeStatus::Invalid) drops the connection;
/// [`ValidIncomplete`](HandshakeStatus::ValidIncomplete) makes the engine
/// send the next [`provide`](Self::provide) frames.
pub trait Handshake: Send {
    /// The next frames to send, each an argument list for one command.
    fn provide(&mut self) -> Vec<Vec<String>>;

    /// Judge a server reply.
    fn validate(&mut self, reply: &Value) -> HandshakeStatus;

    /// Reset internal state before a fresh connection attempt.
    fn restart(&mut self);
}

/// `AUTH`-based handshake: sends `AUTH password` (or `AUTH user password`)
/// and expects `+OK`.
pub struct AuthHandshake {
    username: Option<String>,
    password: String,
}

impl AuthHandshake {
    pub fn new(password: impl Into<String>) -> AuthHandshake {
        AuthHandshake {
            username: None,
            password: password.into(),
        }
    }

    pub fn with_username(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> AuthHandshake {
        AuthHandshake {
            username: Some(username.into()),
            password: password.into(),
        }
    }
}

impl Handshake for AuthHandshake {
    fn provide(&mut self) -> Vec<Vec<String>> {
        let mut frame = vec!["AUTH".to_string()];
        if let Some(username) = &self.username {
            frame.push(username.clone());
        }
        frame.push(self.password.clone());
        vec![frame]
    }

    fn validate(&mut self, reply: &Value) -> HandshakeStatus {
        match reply {
            Value::Status(s) if s == "OK" => HandshakeStatus::ValidComplete,
            _ => HandshakeStatus::Invalid,
        }
    }

    fn restart(&mut self) {}
}

/// Sends `PING` and expects `+PONG`; useful to confirm the peer actually
/// speaks RESP before letting traffic through.
pub struct PingHandshake;

impl Handshake for PingHandshake {
    fn provide(&mut self) -> Vec<Vec<String>> {
        vec![vec!["PING".to_string()]]
    }

    fn validate(&mut self, reply: &Value) -> HandshakeStatus {
        match reply {
            Value::Status(s) if s == "PONG" => HandshakeStatus::ValidComplete,
            _ => HandshakeStatus::Invalid,
        }
    }

    fn restart(&mut self) {}
}
