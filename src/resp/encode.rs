use std::io::Write;

use bytes::Bytes;

/// A request already in RESP wire format, ready to be written to a stream.
///
/// `replies` records how many server replies the request produces: one for a
/// plain command, `N + 2` for a pipelined `MULTI` block of N commands. The
/// stager uses it to absorb the intermediate `+OK`/`+QUEUED` replies and
/// deliver only the final one.
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    bytes: Bytes,
    replies: usize,
}

impl EncodedRequest {
    /// Encode a single command as one RESP array frame.
    pub fn encode<A: AsRef<[u8]>>(args: &[A]) -> EncodedRequest {
        let mut buf = Vec::with_capacity(frame_capacity(args));
        encode_command(&mut buf, args);
        EncodedRequest {
            bytes: Bytes::from(buf),
            replies: 1,
        }
    }

    /// Encode a pipelined `MULTI` block: `MULTI`, every command in order,
    /// then `EXEC`, concatenated into a single buffer.
    pub fn multi(commands: &[Vec<String>]) -> EncodedRequest {
        let mut buf = Vec::new();
        encode_command(&mut buf, &["MULTI"]);
        for command in commands {
            encode_command(&mut buf, command);
        }
        encode_command(&mut buf, &["EXEC"]);
        EncodedRequest {
            bytes: Bytes::from(buf),
            replies: commands.len() + 2,
        }
    }

    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn replies(&self) -> usize {
        self.replies
    }
}

fn frame_capacity<A: AsRef<[u8]>>(args: &[A]) -> usize {
    16 + args.iter().map(|a| a.as_ref().len() + 16).sum::<usize>()
}

fn encode_command<A: AsRef<[u8]>>(buf: &mut Vec<u8>, args: &[A]) {
    write!(buf, "*{}\r\n", args.len()).expect("write to vec");
    for arg in args {
        let arg = arg.as_ref();
        write!(buf, "${}\r\n", arg.len()).expect("write to vec");
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
}
