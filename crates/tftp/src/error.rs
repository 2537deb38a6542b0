//! Transfer error taxonomy.
//!
//! Errors carry enough context to pick the on-wire ERROR code; whether an
//! ERROR packet actually goes out (and to whom) is decided where the error
//! surfaces. A timeout after exhausted retransmissions and a local I/O
//! failure abort without any wire traffic.

use crate::protocol::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// A datagram that does not parse as any TFTP packet.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A packet that parses but is impossible at the current protocol step,
    /// e.g. an ACK for a block not sent yet.
    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    /// The requested file does not exist on the serving side.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The destination of a transfer already exists.
    #[error("file already exists: {0}")]
    FileExists(String),

    /// A path that escapes the served root.
    #[error("access violation: {0}")]
    AccessViolation(String),

    /// The receiving side lacks space for the announced transfer size.
    #[error("not enough disk space: {0}")]
    DiskFull(String),

    /// Option negotiation could not agree on a value.
    #[error("option negotiation failed: {0}")]
    OptionRejected(String),

    /// The peer stayed silent through the whole retransmission budget.
    #[error("timed out waiting for {0} after {1} retransmissions")]
    Timeout(&'static str, u32),

    /// The peer terminated the transfer with an ERROR packet.
    #[error("peer error {code}: {message}")]
    Peer { code: u16, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPacket(reason.into())
    }

    pub fn illegal(reason: impl Into<String>) -> Self {
        Self::IllegalOperation(reason.into())
    }

    /// The ERROR code to put on the wire for this failure, if one applies.
    ///
    /// Timeouts, peer errors, and local I/O failures abort without sending
    /// anything.
    pub fn wire_code(&self) -> Option<ErrorCode> {
        match self {
            Self::MalformedPacket(_) | Self::IllegalOperation(_) => Some(ErrorCode::IllegalOperation),
            Self::FileNotFound(_) => Some(ErrorCode::FileNotFound),
            Self::FileExists(_) => Some(ErrorCode::FileAlreadyExists),
            Self::AccessViolation(_) => Some(ErrorCode::AccessViolation),
            Self::DiskFull(_) => Some(ErrorCode::DiskFull),
            Self::OptionRejected(_) => Some(ErrorCode::OptionNegotiationFailed),
            Self::Timeout(..) | Self::Peer { .. } | Self::Io(_) => None,
        }
    }
}
