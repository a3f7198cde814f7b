//! In-process RESP servers for exercising real client connections.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use revhash::{ResponseReader, Value};

pub fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (listener, port)
}

/// Server side of one connection: framed reads, raw writes.
pub struct FrameConn {
    stream: TcpStream,
    reader: ResponseReader,
    buf: [u8; 2048],
}

impl FrameConn {
    pub fn new(stream: TcpStream) -> FrameConn {
        FrameConn {
            stream,
            reader: ResponseReader::new(),
            buf: [0u8; 2048],
        }
    }

    /// Next complete frame, or `None` on EOF / garbage.
    pub fn read_frame(&mut self) -> Option<Value> {
        loop {
            match self.reader.next_response() {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(_) => return None,
            }
            let n = self.stream.read(&mut self.buf).ok()?;
            if n == 0 {
                return None;
            }
            self.reader.feed(&self.buf[..n]);
        }
    }

    /// Next frame decoded as a command: an array of UTF-8 bulk strings.
    pub fn command(&mut self) -> Option<Vec<String>> {
        let frame = self.read_frame()?;
        let items = frame.as_array()?;
        items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect()
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("server write");
    }
}

// Tiny RESP encoders for scripting server replies.

pub fn enc_status(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

pub fn enc_error(s: &str) -> Vec<u8> {
    format!("-{s}\r\n").into_bytes()
}

pub fn enc_int(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

pub fn enc_bulk(s: &str) -> Vec<u8> {
    let mut out = format!("${}\r\n", s.len()).into_bytes();
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

pub fn enc_array(parts: &[Vec<u8>]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

/// Spin until `predicate` holds, panicking after two seconds.
pub fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}
