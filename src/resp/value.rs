use bytes::Bytes;

/// A parsed RESP reply.
///
/// RESP2 defines five reply types plus the nil bulk/array markers:
/// - Simple string: `+OK\r\n`
/// - Error: `-ERR message\r\n`
/// - Integer: `:1000\r\n`
/// - Bulk string: `$6\r\nfoobar\r\n` (nil: `$-1\r\n`)
/// - Array: `*2\r\n...` (nil: `*-1\r\n`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Status(String),
    Error(String),
    Bulk(Bytes),
    Nil,
    Array(Vec<Value>),
}

impl Value {
    pub fn bulk(data: impl AsRef<[u8]>) -> Value {
        Value::Bulk(Bytes::copy_from_slice(data.as_ref()))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// The raw bytes of a bulk or status reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bulk(data) => Some(data),
            Value::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// The UTF-8 text of a bulk or status reply.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bulk(data) => std::str::from_utf8(data).ok(),
            Value::Status(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Render the reply in a format similar to what redis-cli prints.
    pub fn describe(&self) -> String {
        match self {
            Value::Integer(n) => format!("(integer) {n}"),
            Value::Status(s) => s.clone(),
            Value::Error(e) => format!("(error) {e}"),
            Value::Bulk(data) => format!("\"{}\"", String::from_utf8_lossy(data)),
            Value::Nil => "(nil)".to_string(),
            Value::Array(items) => {
                if items.is_empty() {
                    return "(empty array)".to_string();
                }
                let mut out = String::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    out.push_str(&format!("{}) {}", i + 1, item.describe()));
                }
                out
            }
        }
    }
}
