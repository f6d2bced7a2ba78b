//! Error types for the comet connection core.

use thiserror::Error;

use crate::operator::OperatorError;
use crate::protocol::{MAX_PACK_LEN, RAW_HEADER_LEN};
use crate::timer::TimerError;

/// Main error type for connection handling.
#[derive(Debug, Error)]
pub enum CometError {
    /// Declared packet length exceeds the protocol maximum.
    #[error("packet length {0} exceeds maximum {max}", max = MAX_PACK_LEN)]
    PacketTooLarge(u32),

    /// Declared header length is not the fixed raw header length.
    #[error("header length {0} does not match {expected}", expected = RAW_HEADER_LEN)]
    HeaderLengthMismatch(u16),

    /// A frame arrived with an operation not allowed at this point.
    #[error("unexpected operation {0}")]
    UnexpectedOperation(u32),

    /// I/O error on the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed underneath the caller.
    #[error("connection closed")]
    ConnectionClosed,

    /// A message ring has no free slot.
    #[error("message ring full")]
    RingFull,

    /// No live session is registered under the key.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Deadline scheduling failed.
    #[error("timer error: {0}")]
    Timer(#[from] TimerError),

    /// The business operator failed.
    #[error("operator error: {0}")]
    Operator(#[from] OperatorError),
}

/// Result type alias using CometError.
pub type Result<T> = std::result::Result<T, CometError>;
