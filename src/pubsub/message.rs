use bytes::Bytes;

use crate::resp::Value;

/// An incoming frame on a connection in subscription mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Acknowledgement of `SUBSCRIBE`/`PSUBSCRIBE`; `active` is the
    /// server-side count of subscriptions on this connection.
    Subscribed { channel: String, active: i64 },
    /// Acknowledgement of `UNSUBSCRIBE`/`PUNSUBSCRIBE`.
    Unsubscribed { channel: String, active: i64 },
    /// A published message on a directly subscribed channel.
    Message { channel: String, payload: Bytes },
    /// A published message that matched a pattern subscription.
    PatternMessage {
        pattern: String,
        channel: String,
        payload: Bytes,
    },
}

impl Message {
    /// Decode a raw pub/sub frame. Returns `None` for anything that is not
    /// one of the four known shapes.
    pub fn parse(reply: &Value) -> Option<Message> {
        let items = reply.as_array()?;
        let kind = items.first()?.as_bytes()?;
        match kind {
            b"subscribe" | b"psubscribe" if items.len() == 3 => Some(Message::Subscribed {
                channel: items[1].as_str()?.to_string(),
                active: items[2].as_integer()?,
            }),
            b"unsubscribe" | b"punsubscribe" if items.len() == 3 => Some(Message::Unsubscribed {
                channel: items[1].as_str()?.to_string(),
                active: items[2].as_integer()?,
            }),
            b"message" if items.len() == 3 => Some(Message::Message {
                channel: items[1].as_str()?.to_string(),
                payload: bulk_payload(&items[2])?,
            }),
            b"pmessage" if items.len() == 4 => Some(Message::PatternMessage {
                pattern: items[1].as_str()?.to_string(),
                channel: items[2].as_str()?.to_string(),
                payload: bulk_payload(&items[3])?,
            }),
            _ => None,
        }
    }

    /// The channel this frame concerns.
    pub fn channel(&self) -> &str {
        match self {
            Message::Subscribed { channel, .. }
            | Message::Unsubscribed { channel, .. }
            | Message::Message { channel, .. }
            | Message::PatternMessage { channel, .. } => channel,
        }
    }
}

fn bulk_payload(value: &Value) -> Option<Bytes> {
    match value {
        Value::Bulk(data) => Some(data.clone()),
        _ => None,
    }
}

/// Receives every frame from a subscription-mode connection. Runs on the
/// connection engine's thread and must not block.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: Message);
}
