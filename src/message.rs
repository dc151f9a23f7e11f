//! The user-visible message envelopes.
//!
//! [`Message`] is the outbound envelope: an identity, an endpoint and two optional
//!  blobs. [`ReceivedMessage`] is the inbound counterpart; it owns the buffer-pool slot
//!  it was assembled into, so the slot (and with it the peer's sending capacity in
//!  synchronous mode) stays occupied until the message is released. Releasing sends the
//!  acknowledge iff the sender requested one; dropping the message releases as a safety
//!  net so a lost message can never lock up a peer.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::buffer_pool::{BufferPool, Slot};
use crate::identity::Identity;
use crate::remote::Remote;

/// An outbound message.
///
/// The identity is generated on creation and preserved by [`reply`](ReceivedMessage::reply),
///  so request and response can be correlated. Never change the identity of a message
///  you are answering.
#[derive(Clone, Debug)]
pub struct Message {
    pub(crate) identity: Identity,
    pub(crate) addr: SocketAddr,
    pub(crate) header: Bytes,
    pub(crate) data: Bytes,
}

impl Message {
    pub fn new(addr: SocketAddr) -> Message {
        Message {
            identity: Identity::random(),
            addr,
            header: Bytes::new(),
            data: Bytes::new(),
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Message {
        self.identity = identity;
        self
    }

    /// Header blob used by upper-layer protocols.
    pub fn with_header(mut self, header: impl Into<Bytes>) -> Message {
        self.header = header.into();
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Message {
        self.data = data.into();
        self
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// An inbound message, owning its buffer-pool slot.
pub struct ReceivedMessage {
    pub(crate) identity: Identity,
    pub(crate) serial: u32,
    pub(crate) addr: SocketAddr,
    pub(crate) remote_identity: Identity,
    pub(crate) send_ack: bool,
    pub(crate) slot: Option<Box<Slot>>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) remote: Weak<Remote>,
}

impl ReceivedMessage {
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// The serial the sender assigned; strictly increasing per remote, wraps at 2^32.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// The sender's endpoint. Sending a reply here reaches the peer through its
    ///  advertised listening port.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The identity the peer published at handshake time. Changes on each restart of
    ///  the peer, so shared state keyed by it resets naturally.
    pub fn remote_identity(&self) -> Identity {
        self.remote_identity
    }

    pub fn header(&self) -> &[u8] {
        self.slot
            .as_ref()
            .expect("message was already released")
            .header
            .as_slice()
    }

    pub fn data(&self) -> &[u8] {
        self.slot
            .as_ref()
            .expect("message was already released")
            .data
            .as_slice()
    }

    /// Start a reply: same identity, addressed to the sender.
    pub fn reply(&self) -> Message {
        Message {
            identity: self.identity,
            addr: self.addr,
            header: Bytes::new(),
            data: Bytes::new(),
        }
    }

    /// Release the message slot, acknowledging the message if the sender requested it.
    ///  A reader stopped on pool exhaustion resumes once the slot is free. Dropping the
    ///  message has the same effect.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ReceivedMessage {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if self.send_ack {
            if let Some(remote) = self.remote.upgrade() {
                remote.enqueue_ack(self.identity);
            }
        }
        self.pool.release(slot);
    }
}

impl std::fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("identity", &self.identity)
            .field("serial", &self.serial)
            .field("addr", &self.addr)
            .field("remote_identity", &self.remote_identity)
            .field("header_len", &self.header().len())
            .field("data_len", &self.data().len())
            .finish()
    }
}
