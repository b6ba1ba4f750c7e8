//! Error types for monitor operations.

use hvmon_proto::ErrorInfo;

/// Alias for `Result<T, hvmon::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by monitor operations.
///
/// Nothing here carries caller context; wrap at the call site.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection is already closed. No I/O was attempted.
    #[error("monitor is disconnected")]
    Disconnected,

    /// The peer rejected the command.
    #[error(transparent)]
    Protocol(#[from] ErrorInfo),

    /// The connection died while waiting for the reply.
    #[error("monitor connection closed: {0}")]
    Closed(String),

    /// Connecting, reading or writing the socket failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A file descriptor was attached but the peer never advertised `oob`.
    #[error("monitor does not support out-of-band file descriptor passing")]
    OobUnsupported,

    /// Greeting or capability negotiation failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The named object does not exist on the peer.
    #[error("{0} not found")]
    NotFound(String),

    /// The named character device is not a ring buffer.
    #[error("character device {0} is not a ring buffer")]
    NotRingbuf(String),

    /// The migration job entered the `failed` state.
    #[error("migration failed")]
    MigrationFailed,

    /// A block job reported an error.
    #[error("block job failed: {0}")]
    BlockJobFailed(String),

    /// The caller cancelled a long-running wait.
    #[error("operation cancelled")]
    Cancelled,

    /// A reply payload did not have the expected shape.
    #[error("unexpected reply payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` for failures of the connection itself rather than of a
    /// single command. Reconnecting may help; retrying the command will not.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Closed(_) | Self::Disconnected)
    }

    /// Returns `true` if the target object does not exist, whether detected
    /// locally or reported by the peer.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Protocol(e) => e.is_not_found(),
            _ => false,
        }
    }
}
