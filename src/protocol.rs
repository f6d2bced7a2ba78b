//! Binary frame codec for the comet wire protocol.
//!
//! Every frame is a fixed 16-byte header followed by an optional body:
//! ```text
//! ┌──────────┬────────────┬─────────┬───────────┬──────────┬──────────┐
//! │ Pack Len │ Header Len │ Version │ Operation │ Seq ID   │ Body     │
//! │ 4 bytes  │ 2 bytes    │ 2 bytes │ 4 bytes   │ 4 bytes  │ 0..1008  │
//! │ u32 BE   │ u16 BE     │ u16 BE  │ u32 BE    │ u32 BE   │          │
//! └──────────┴────────────┴─────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! The packet length counts the header and the body. An empty body is
//! never written to the wire and decodes back to an empty body.

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{CometError, Result};

/// Maximum total packet length (header + body).
pub const MAX_PACK_LEN: u32 = 1 << 10;

/// Fixed length of the raw frame header.
pub const RAW_HEADER_LEN: u16 = 16;

/// Size of the packet length field.
pub const PACK_LEN_SIZE: usize = 4;

/// Size of the header length field.
pub const HEADER_LEN_SIZE: usize = 2;

/// Largest body that fits in one packet.
pub const MAX_BODY_LEN: usize = MAX_PACK_LEN as usize - RAW_HEADER_LEN as usize;

/// Operation codes.
pub mod op {
    pub const HANDSHAKE: u32 = 0;
    pub const HANDSHAKE_REPLY: u32 = 1;
    pub const HEARTBEAT: u32 = 2;
    pub const HEARTBEAT_REPLY: u32 = 3;
    pub const SEND_SMS: u32 = 4;
    pub const SEND_SMS_REPLY: u32 = 5;
    pub const DISCONNECT_REPLY: u32 = 6;
    pub const AUTH: u32 = 7;
    pub const AUTH_REPLY: u32 = 8;
    pub const TEST: u32 = 254;
    pub const TEST_REPLY: u32 = 255;
}

/// A single protocol message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version, echoed back on replies.
    pub version: u16,
    /// Operation code (see [`op`]).
    pub operation: u32,
    /// Caller-assigned sequence id, echoed back on replies.
    pub seq_id: u32,
    /// Opaque body. Empty means absent.
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame with the given fields.
    pub fn new(version: u16, operation: u32, seq_id: u32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            operation,
            seq_id,
            body: body.into(),
        }
    }

    /// Whether the frame carries a body.
    #[inline]
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// Serialized length on the wire.
    #[inline]
    pub fn packet_len(&self) -> usize {
        RAW_HEADER_LEN as usize + self.body.len()
    }

    /// Turn this frame into a bodiless reply with the given operation,
    /// keeping version and sequence id.
    pub fn reply(&mut self, operation: u32) {
        self.body.clear();
        self.operation = operation;
    }

    /// Copy `other` into this frame, reusing the existing body allocation.
    pub fn assign(&mut self, other: &Frame) {
        self.version = other.version;
        self.operation = other.operation;
        self.seq_id = other.seq_id;
        self.body.clear();
        self.body.extend_from_slice(&other.body);
    }
}

/// Read one frame from `reader` into `frame`.
///
/// The body is read into the frame's existing buffer so a frame reused
/// across calls does not reallocate for bodies that fit its capacity.
pub async fn read_frame<R>(reader: &mut R, frame: &mut Frame) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; RAW_HEADER_LEN as usize];

    reader.read_exact(&mut header[..PACK_LEN_SIZE]).await?;
    let pack_len = (&header[..PACK_LEN_SIZE]).get_u32();
    trace!(pack_len, "read packet length");
    if pack_len > MAX_PACK_LEN {
        return Err(CometError::PacketTooLarge(pack_len));
    }

    let header_len_end = PACK_LEN_SIZE + HEADER_LEN_SIZE;
    reader
        .read_exact(&mut header[PACK_LEN_SIZE..header_len_end])
        .await?;
    let header_len = (&header[PACK_LEN_SIZE..header_len_end]).get_u16();
    if header_len != RAW_HEADER_LEN {
        return Err(CometError::HeaderLengthMismatch(header_len));
    }

    reader.read_exact(&mut header[header_len_end..]).await?;
    let mut rest = &header[header_len_end..];
    frame.version = rest.get_u16();
    frame.operation = rest.get_u32();
    frame.seq_id = rest.get_u32();

    let body_len = pack_len.saturating_sub(u32::from(header_len)) as usize;
    trace!(
        version = frame.version,
        operation = frame.operation,
        seq_id = frame.seq_id,
        body_len,
        "read frame header"
    );

    frame.body.clear();
    if body_len > 0 {
        frame.body.resize(body_len, 0);
        reader.read_exact(&mut frame.body).await?;
    }
    Ok(())
}

/// Write one frame to `writer` and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; RAW_HEADER_LEN as usize];
    {
        let mut buf = &mut header[..];
        buf.put_u32(frame.packet_len() as u32);
        buf.put_u16(RAW_HEADER_LEN);
        buf.put_u16(frame.version);
        buf.put_u32(frame.operation);
        buf.put_u32(frame.seq_id);
    }
    trace!(?frame, "write frame");

    writer.write_all(&header).await?;
    if frame.has_body() {
        writer.write_all(&frame.body).await?;
    }
    writer.flush().await?;
    Ok(())
}
