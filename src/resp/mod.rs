//! RESP wire values, request encoding, and incremental response parsing.

mod encode;
mod reader;
mod value;

pub use encode::EncodedRequest;
pub use reader::{ParseError, ResponseReader};
pub use value::Value;
