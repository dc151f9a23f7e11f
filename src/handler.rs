use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::chirp::Chirp;
use crate::message::ReceivedMessage;

/// Receives fully-assembled messages from all connections of a chirp instance.
///
/// The handler runs on the connection's read task; while it holds the message, the
///  message's slot stays occupied (one of at most `max_slots` per inbound connection),
///  and in synchronous mode the peer will not send the next message until the slot is
///  released. Hand the message off if processing takes a while.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, chirp: &Chirp, msg: ReceivedMessage);
}
