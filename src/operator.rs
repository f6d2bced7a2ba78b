//! Business logic collaborator.
//!
//! The connection core never interprets payloads itself. It asks the
//! operator to authenticate the handshake frame, to turn every
//! non-heartbeat client frame into its reply, and notifies it when a
//! session ends.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::{op, Frame};

/// Operator failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperatorError {
    /// The handshake credentials were refused.
    #[error("authentication rejected: {0}")]
    Rejected(String),

    /// The operator does not handle this operation code.
    #[error("unknown operation {0}")]
    UnknownOperation(u32),

    /// The backing business service failed.
    #[error("operator unavailable: {0}")]
    Unavailable(String),
}

/// Identity resolved by a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Registry key for this connection.
    pub key: String,
    /// Heartbeat deadline applied after the handshake.
    pub heartbeat: Duration,
}

#[async_trait]
pub trait Operator: Send + Sync {
    /// Authenticate the handshake frame.
    async fn connect(&self, frame: &Frame) -> Result<Session, OperatorError>;

    /// Process a client frame, rewriting it in place into the reply.
    async fn operate(&self, frame: &mut Frame) -> Result<(), OperatorError>;

    /// The session under `key` is gone.
    async fn disconnect(&self, key: &str) -> Result<(), OperatorError>;
}

/// Operator used by the standalone binary.
///
/// The handshake body is the session token and becomes the registry key.
/// `SEND_SMS` and `TEST` frames are echoed back with their reply codes.
#[derive(Debug, Clone)]
pub struct DefaultOperator {
    heartbeat: Duration,
}

impl DefaultOperator {
    pub fn new(heartbeat: Duration) -> Self {
        Self { heartbeat }
    }
}

#[async_trait]
impl Operator for DefaultOperator {
    async fn connect(&self, frame: &Frame) -> Result<Session, OperatorError> {
        let token = std::str::from_utf8(&frame.body)
            .map_err(|_| OperatorError::Rejected("token is not valid UTF-8".to_string()))?
            .trim();
        if token.is_empty() {
            return Err(OperatorError::Rejected("empty token".to_string()));
        }
        debug!(key = token, "session authenticated");
        Ok(Session {
            key: token.to_string(),
            heartbeat: self.heartbeat,
        })
    }

    async fn operate(&self, frame: &mut Frame) -> Result<(), OperatorError> {
        frame.operation = match frame.operation {
            op::SEND_SMS => op::SEND_SMS_REPLY,
            op::TEST => op::TEST_REPLY,
            other => return Err(OperatorError::UnknownOperation(other)),
        };
        Ok(())
    }

    async fn disconnect(&self, key: &str) -> Result<(), OperatorError> {
        info!(key, "session disconnected");
        Ok(())
    }
}
