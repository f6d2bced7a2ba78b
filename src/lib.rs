//! comet: per-connection core of a long-lived TCP push gateway
//!
//! Clients open a TCP connection, authenticate with a single handshake
//! frame, then exchange length-prefixed binary frames while the gateway
//! pushes server-originated frames to them.
//!
//! Features:
//! - Big-endian frame codec with a 1 KiB packet cap
//! - Handshake gated by a deadline and an authentication operator
//! - Separate read and write tasks per connection, linked by SPSC rings
//! - Heartbeat deadlines with lazy renewal on a shared heap timer
//! - Sharded session registry for targeted push and broadcast

pub mod bucket;
pub mod channel;
pub mod closer;
pub mod config;
mod dispatch;
pub mod error;
pub mod operator;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod timer;

pub use config::Config;
pub use error::{CometError, Result};
pub use operator::{DefaultOperator, Operator, OperatorError, Session};
pub use protocol::Frame;
pub use server::Server;
