use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ChirpError;
use crate::identity::Identity;
use crate::wire::Handshake;

/// Buffer size used for a connection when the config leaves it at 0.
pub const DEFAULT_BUFFER_SIZE: u32 = 64 * 1024;

/// Minimal buffer size accepted when the config overrides it.
pub const MIN_BUFFER_SIZE: u32 = 1024;

/// Preallocated per-slot buffer size for message headers. Bigger headers spill into a
///  dedicated allocation.
pub const PREALLOC_HEADER: usize = 32;

/// Preallocated per-slot buffer size for message data. Bigger payloads spill into a
///  dedicated allocation.
pub const PREALLOC_DATA: usize = 1024;

/// Hard default limit for message size.
pub const DEFAULT_MAX_MSG_SIZE: u32 = 100 * 1024 * 1024;

/// TCP keep-alive time on accepted and initiated connections.
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Chirp configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time until an idle connection gets garbage collected. Until then the connection
    ///  will be reused. The effective reuse time is `max(reuse_time, timeout * 3)`.
    pub reuse_time: Duration,

    /// Send- and connect-timeout scaling. The send timeout is `timeout`, the connect
    ///  timeout is `min(timeout * 2, 60s)`.
    pub timeout: Duration,

    /// Port for listening to connections. Must be above 1024.
    pub port: u16,

    /// TCP listen-socket backlog.
    pub backlog: u8,

    /// The count of message slots used per inbound connection. Allowed values are 1 to
    ///  32. The default of 0 means 16 slots if asynchronous and 1 slot if synchronous.
    pub max_slots: u8,

    /// Enable connection-synchronous operation: every user send requests an acknowledge
    ///  message and at most one data message is in flight per remote.
    pub synchronous: bool,

    /// By default chirp closes on SIGINT and SIGTERM.
    pub disable_signals: bool,

    /// Size of the read buffer used for a connection. 0 means use the default. Must not
    ///  be set below 1024.
    pub buffer_size: u32,

    /// Hard per-message cap. A peer announcing a bigger message gets disconnected with a
    ///  protocol error.
    pub max_msg_size: u32,

    /// Override the IPv4 bind address.
    pub bind_v4: Ipv4Addr,

    /// Override the IPv6 bind address.
    pub bind_v6: Ipv6Addr,

    /// The identity of this node. All-zero means generate a fresh one on start.
    pub identity: Identity,

    /// Port advertised in the handshake instead of `port`, for nodes behind a NAT that
    ///  rewrites the public port.
    pub public_port: Option<u16>,

    /// Path to the certificate chain including the private key. Required unless
    ///  encryption is disabled.
    pub cert_chain_pem: Option<PathBuf>,

    /// Path to the PEM file containing DH parameters. Required unless encryption is
    ///  disabled.
    pub dh_params_pem: Option<PathBuf>,

    /// Disables encryption entirely. Only use if you know what you are doing.
    ///  Connections to `127.0.0.1` and `::1` aren't encrypted anyway.
    pub disable_encryption: bool,

    /// Encrypt loopback connections too. Unlike the process-global flag of other chirp
    ///  implementations this is deliberately per-instance.
    pub always_encrypt: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            reuse_time: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            port: 2998,
            backlog: 100,
            max_slots: 0,
            synchronous: true,
            disable_signals: false,
            buffer_size: 0,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            bind_v4: Ipv4Addr::UNSPECIFIED,
            bind_v6: Ipv6Addr::UNSPECIFIED,
            identity: Identity::ZERO,
            public_port: None,
            cert_chain_pem: None,
            dh_params_pem: None,
            disable_encryption: false,
            always_encrypt: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ChirpError> {
        let reuse = self.reuse_time.as_secs_f64();
        if !(0.5..=3600.0).contains(&reuse) {
            return Err(ChirpError::value(format!(
                "reuse_time must be between 0.5s and 3600s, was {}s",
                reuse
            )));
        }
        let timeout = self.timeout.as_secs_f64();
        if !(0.1..=1200.0).contains(&timeout) {
            return Err(ChirpError::value(format!(
                "timeout must be between 0.1s and 1200s, was {}s",
                timeout
            )));
        }
        if self.port <= 1024 {
            return Err(ChirpError::value(format!(
                "port must be above 1024, was {}",
                self.port
            )));
        }
        if self.backlog >= 128 {
            return Err(ChirpError::value(format!(
                "backlog must be below 128, was {}",
                self.backlog
            )));
        }
        if self.max_slots > 32 {
            return Err(ChirpError::value(format!(
                "max_slots must be between 0 and 32, was {}",
                self.max_slots
            )));
        }
        if self.buffer_size != 0 {
            if self.buffer_size < MIN_BUFFER_SIZE {
                return Err(ChirpError::value(format!(
                    "buffer_size must be at least {} bytes, was {}",
                    MIN_BUFFER_SIZE, self.buffer_size
                )));
            }
            if (self.buffer_size as usize) < Handshake::SERIALIZED_LEN {
                return Err(ChirpError::value(
                    "buffer_size is smaller than a handshake".to_string(),
                ));
            }
        }
        if !self.disable_encryption {
            if self.cert_chain_pem.is_none() {
                return Err(ChirpError::value(
                    "cert_chain_pem is required unless encryption is disabled".to_string(),
                ));
            }
            if self.dh_params_pem.is_none() {
                return Err(ChirpError::value(
                    "dh_params_pem is required unless encryption is disabled".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The reuse time actually applied, lower-bounded by three send timeouts so a
    ///  connection is never collected while a message can still legitimately complete.
    pub fn effective_reuse_time(&self) -> Duration {
        self.reuse_time.max(self.timeout * 3)
    }

    pub fn effective_max_slots(&self) -> usize {
        if self.synchronous {
            1
        } else if self.max_slots == 0 {
            16
        } else {
            self.max_slots as usize
        }
    }

    pub fn effective_buffer_size(&self) -> usize {
        if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE as usize
        } else {
            self.buffer_size as usize
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        (self.timeout * 2).min(Duration::from_secs(60))
    }

    /// The port published to peers in the handshake.
    pub fn advertised_port(&self) -> u16 {
        self.public_port.unwrap_or(self.port)
    }
}
