use thiserror::Error;

/// Error kinds surfaced to library users.
///
/// Per-message outcomes ([`Timeout`](ChirpError::Timeout),
///  [`CannotConnect`](ChirpError::CannotConnect), [`WriteError`](ChirpError::WriteError),
///  [`TlsError`](ChirpError::TlsError), [`ProtocolError`](ChirpError::ProtocolError),
///  [`Shutdown`](ChirpError::Shutdown), [`NoMemory`](ChirpError::NoMemory)) are delivered through
///  the send future exactly once. Configuration problems are returned synchronously from
///  `start` / `send` and never reach an in-flight message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChirpError {
    #[error("invalid value: {0}")]
    ValueError(String),

    #[error("I/O layer failure: {0}")]
    IoError(String),

    /// The peer violated the framing or the configured limits, or died unexpectedly.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("listening port is already in use")]
    AddrInUse,

    /// Should not happen in normal operation, but the underlying system has errors for it.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("chirp or another object is not initialized")]
    NotInitialized,

    #[error("action is already in progress")]
    InProgress,

    #[error("a timeout happened during the action")]
    Timeout,

    #[error("could not get memory")]
    NoMemory,

    /// The operation failed because chirp is shutting down, e.g. the connection that was
    ///  carrying the message got closed.
    #[error("chirp is shutting down")]
    Shutdown,

    #[error("the remote has refused the connection or has timed out")]
    CannotConnect,

    /// The message has been placed in the send queue.
    #[error("message queued")]
    Queued,

    /// The message is already in use and will not be sent. Ownership makes this
    ///  unreachable through the public API; retained for completeness.
    #[error("message is already in use")]
    Used,

    /// The message has not been sent completely.
    #[error("partial send")]
    More,

    /// The writer was busy or we are still waiting for an ack; no message was processed.
    #[error("writer busy")]
    Busy,

    /// The queues are empty, no message has been sent.
    #[error("queues are empty")]
    Empty,

    #[error("error while writing to the socket")]
    WriteError,

    #[error("initializing a resource failed")]
    InitFail,
}

impl ChirpError {
    pub(crate) fn value(msg: impl Into<String>) -> ChirpError {
        ChirpError::ValueError(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> ChirpError {
        ChirpError::ProtocolError(msg.into())
    }
}

impl From<std::io::Error> for ChirpError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::AddrInUse => ChirpError::AddrInUse,
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => {
                ChirpError::CannotConnect
            }
            std::io::ErrorKind::TimedOut => ChirpError::Timeout,
            std::io::ErrorKind::OutOfMemory => ChirpError::NoMemory,
            _ => ChirpError::IoError(e.to_string()),
        }
    }
}
