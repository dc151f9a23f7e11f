//! Chirp is an embeddable message-passing library: reliable, optionally TLS-encrypted,
//!  per-peer-ordered delivery of discrete messages between peer nodes over TCP.
//!
//! ## Design goals
//!
//! * The protocol is peer-to-peer without a dedicated server vs. client
//!   * each node listens (on IP V4 and V6 simultaneously) *and* originates connections
//!   * a node identifies itself with a 16-byte identity, generated fresh on each start
//!      unless configured, so peers detect restarts without a concept of 'session'
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data
//!    as opposed to streams of bytes)
//! * One long-lived connection per peer, reused in both directions and garbage
//!    collected after a configurable idle time; reconnecting is transparent
//! * Two modes of operation, chosen per instance:
//!   * *synchronous*: every send requests an acknowledge message and at most one data
//!      message is in flight per peer; the send resolves when the ack arrived
//!   * *asynchronous*: sends resolve when the bytes are written; up to 32 concurrent
//!      message slots per inbound connection
//! * Back-pressure without window bookkeeping: a receiver that runs out of message
//!    slots simply stops reading, closing its TCP window, until the application
//!    releases a slot
//! * Messages are never persisted, routed across hops or fragmented beyond the
//!    configured maximum; distinct peers are fully independent
//!
//! ## Wire protocol
//!
//! Two framings, all integers in network byte order. The handshake is sent once by
//!  each side immediately on connection establishment:
//!
//! ```ascii
//! 0:  port (u16) - the port the sender listens on
//! 2:  identity (16 bytes)
//! ```
//!
//! followed by any number of wire messages:
//!
//! ```ascii
//! 0:  identity (16 bytes)
//! 16: serial (u32) - per-peer counter, assigned at transmit time, wraps
//! 20: type (u8) - bit 0 REQ_ACK, bit 1 ACK, bit 2 NOOP
//! 21: header_len (u16)
//! 23: data_len (u32)
//! 27: header, then data
//! ```
//!
//! An ACK echoes the identity of the message it acknowledges with zero lengths. A NOOP
//!  probes a connection suspected to be near its idle collection.
//!
//! ## Encryption
//!
//! Unless disabled, connections between non-loopback peers run TLS 1.2 with peer
//!  verification, restricted to the DHE AES256 cipher families with DH parameters
//!  loaded from a configured PEM file.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use chirp::{Chirp, Config, Message, MessageHandler, ReceivedMessage};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl MessageHandler for Echo {
//!     async fn on_message(&self, chirp: &Chirp, msg: ReceivedMessage) {
//!         let reply = msg.reply().with_data(msg.data().to_vec());
//!         let chirp = chirp.clone();
//!         tokio::spawn(async move { chirp.send(reply).await });
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), chirp::ChirpError> {
//!     let config = Config {
//!         port: 2998,
//!         disable_encryption: true,
//!         ..Config::default()
//!     };
//!     let chirp = Chirp::start(config, Arc::new(Echo)).await?;
//!     let msg = Message::new("127.0.0.1:2999".parse().unwrap()).with_data(&b"hello"[..]);
//!     chirp.send(msg).await?;
//!     chirp.close().await
//! }
//! ```

mod buffer_pool;
mod chirp;
mod config;
mod connection;
mod error;
mod handler;
mod identity;
mod message;
mod protocol;
mod reader;
mod remote;
mod task_gate;
mod tls;
mod transport;
mod wire;
mod writer;

pub use crate::chirp::Chirp;
pub use crate::config::Config;
pub use crate::error::ChirpError;
pub use crate::handler::MessageHandler;
pub use crate::identity::{Identity, ID_SIZE};
pub use crate::message::{Message, ReceivedMessage};
pub use crate::wire::{msg_type, Handshake, WireHeader};
