//! Byte-duplex transport over TCP, with optional TLS layering.
//!
//! The engine reads on one half while the writer thread sends on the other.
//! A blocked read is interruptible from outside through [`Interrupter`],
//! which shuts the underlying socket down; this is what lets shutdown and
//! teardown preempt the read loop without polling.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use thiserror::Error;

use crate::endpoint::Endpoint;

/// How often a TLS read wakes up to let the writer at the session.
const TLS_READ_SLICE: Duration = Duration::from_millis(50);

/// Bound on how long a connection attempt may hang; shutdown cannot
/// interrupt an in-flight connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid tls server name: {0}")]
    InvalidServerName(String),
}

/// TLS configuration, opaque to the connection engine.
#[derive(Debug, Clone, Default)]
pub enum TlsConfig {
    #[default]
    Off,
    On {
        config: Arc<ClientConfig>,
        /// Name presented for SNI and certificate validation; defaults to
        /// the endpoint host.
        sni: Option<String>,
    },
}

/// Outcome of a single `recv` call.
#[derive(Debug, Clone, Copy)]
pub struct RecvStatus {
    pub bytes_read: usize,
    /// Once false, the stream is permanently closed.
    pub alive: bool,
}

/// Outcome of a single `send` call.
#[derive(Debug, Clone, Copy)]
pub struct SendStatus {
    pub alive: bool,
}

type TlsSession = Arc<Mutex<StreamOwned<ClientConnection, TcpStream>>>;

/// A connected byte-duplex, split into read and write halves by the engine.
pub struct NetworkStream {
    read: ReadHalf,
    write: WriteHalf,
}

impl NetworkStream {
    pub fn connect(endpoint: &Endpoint, tls: &TlsConfig) -> Result<NetworkStream, ConnectError> {
        let addr = (endpoint.host(), endpoint.port())
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(ErrorKind::NotFound, "hostname resolved to no addresses")
            })?;
        let sock = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        sock.set_nodelay(true)?;

        match tls {
            TlsConfig::Off => {
                let sock = Arc::new(sock);
                Ok(NetworkStream {
                    read: ReadHalf {
                        inner: ReadInner::Tcp(Arc::clone(&sock)),
                        sock: Arc::clone(&sock),
                    },
                    write: WriteHalf {
                        inner: WriteInner::Tcp(Arc::clone(&sock)),
                        sock,
                    },
                })
            }
            TlsConfig::On { config, sni } => {
                // The session is shared behind a mutex, so reads run in
                // short slices to keep the writer from starving.
                sock.set_read_timeout(Some(TLS_READ_SLICE))?;
                let raw = Arc::new(sock.try_clone()?);
                let name = sni.clone().unwrap_or_else(|| endpoint.host().to_string());
                let server = ServerName::try_from(name.clone())
                    .map_err(|_| ConnectError::InvalidServerName(name))?;
                let session = ClientConnection::new(Arc::clone(config), server)?;
                let stream: TlsSession = Arc::new(Mutex::new(StreamOwned::new(session, sock)));
                Ok(NetworkStream {
                    read: ReadHalf {
                        inner: ReadInner::Tls(Arc::clone(&stream)),
                        sock: Arc::clone(&raw),
                    },
                    write: WriteHalf {
                        inner: WriteInner::Tls(stream),
                        sock: raw,
                    },
                })
            }
        }
    }

    /// A handle that can unblock a `recv` in progress on the read half.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            sock: Arc::clone(&self.read.sock),
        }
    }

    pub fn split(self) -> (ReadHalf, WriteHalf) {
        (self.read, self.write)
    }
}

enum ReadInner {
    Tcp(Arc<TcpStream>),
    Tls(TlsSession),
}

pub struct ReadHalf {
    inner: ReadInner,
    sock: Arc<TcpStream>,
}

impl ReadHalf {
    /// Blocking read. Returns `bytes_read == 0` with `alive == true` when
    /// the wait was interrupted or a TLS read slice elapsed; the caller
    /// just loops.
    pub fn recv(&mut self, buf: &mut [u8]) -> RecvStatus {
        let result = match &self.inner {
            ReadInner::Tcp(sock) => (&**sock).read(buf),
            ReadInner::Tls(session) => {
                let mut session = session.lock().expect("tls session lock poisoned");
                session.read(buf)
            }
        };
        match result {
            Ok(0) => RecvStatus {
                bytes_read: 0,
                alive: false,
            },
            Ok(n) => RecvStatus {
                bytes_read: n,
                alive: true,
            },
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                ) =>
            {
                RecvStatus {
                    bytes_read: 0,
                    alive: true,
                }
            }
            Err(_) => RecvStatus {
                bytes_read: 0,
                alive: false,
            },
        }
    }
}

enum WriteInner {
    Tcp(Arc<TcpStream>),
    Tls(TlsSession),
}

/// Cheaply cloneable write half, held by the writer thread.
#[derive(Clone)]
pub struct WriteHalf {
    inner: WriteInner,
    sock: Arc<TcpStream>,
}

impl Clone for WriteInner {
    fn clone(&self) -> Self {
        match self {
            WriteInner::Tcp(sock) => WriteInner::Tcp(Arc::clone(sock)),
            WriteInner::Tls(session) => WriteInner::Tls(Arc::clone(session)),
        }
    }
}

impl WriteHalf {
    pub fn send_all(&self, bytes: &[u8]) -> SendStatus {
        let result = match &self.inner {
            WriteInner::Tcp(sock) => (&**sock).write_all(bytes),
            WriteInner::Tls(session) => {
                let mut session = session.lock().expect("tls session lock poisoned");
                session.write_all(bytes).and_then(|()| session.flush())
            }
        };
        SendStatus {
            alive: result.is_ok(),
        }
    }

    /// Tear the whole connection down, read half included.
    pub fn shutdown(&self) {
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}

/// Unblocks a read in progress by shutting the socket down.
pub struct Interrupter {
    sock: Arc<TcpStream>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}
