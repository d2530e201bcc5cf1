use thiserror::Error;

/// Failure classes of a ping session. Components return `anyhow::Result`
/// carrying one of these when the caller needs to tell them apart.
#[derive(Debug, Error)]
pub enum PingError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("peer closed the connection before the handshake was complete")]
    HandshakeFailed,

    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("malformed packet: needed {needed} bytes, got {actual}")]
    MalformedPacket { needed: usize, actual: usize },

    #[error("no response for message {id}")]
    Timeout { id: i64 },

    #[error("message {id}: received {actual} bytes, expected {expected}")]
    SizeMismatch {
        id: i64,
        expected: usize,
        actual: usize,
    },

    #[error("message {expected}: got an echo for message {actual}")]
    UnexpectedEcho { expected: i64, actual: i64 },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("local clock is before the unix epoch")]
    Clock(#[from] std::time::SystemTimeError),
}

impl PingError {
    /// Errors that only cost the statistic of one probe.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PingError::Timeout { .. }
                | PingError::SizeMismatch { .. }
                | PingError::UnexpectedEcho { .. }
        )
    }
}
