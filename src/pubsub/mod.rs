//! Subscription-mode connections and per-channel message dispatch.

mod base;
mod dispatch;
mod message;

pub use base::BaseSubscriber;
pub(crate) use base::SubscriptionSet;
pub use dispatch::{Subscriber, Subscription};
pub use message::{Message, MessageListener};
