//! Per-connection message queues and the wake signal between the read and
//! write tasks.
//!
//! ```text
//!   read task ──► inbound ring ──┐
//!                                ├──► write task ──► socket
//!   server push ─► outbound ring ┘
//!        │                 ▲
//!        └──── wake signal ┘ (one slot, dropped when full)
//! ```
//!
//! The wake signal only shortens latency. The write task drains both rings
//! until they are empty on every wake, so a dropped signal never strands a
//! frame that was committed before the previous drain finished.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{CometError, Result};
use crate::protocol::{Frame, MAX_BODY_LEN};
use crate::ring::{ring, Consumer, Producer};

/// Wake signal payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// At least one frame was committed.
    ProtoReady,
    /// The read side is gone; the write task should tear down.
    Finished,
}

/// Shared side of a connection, stored in the registry.
#[derive(Debug)]
pub struct Channel {
    outbound: Mutex<Producer<Frame>>,
    signal: mpsc::Sender<Wake>,
}

/// Write task side of a connection.
pub struct Mailbox {
    pub(crate) inbound: Consumer<Frame>,
    pub(crate) outbound: Consumer<Frame>,
    signal: mpsc::Receiver<Wake>,
}

impl Channel {
    /// Create the queues for one connection.
    ///
    /// Returns the shared channel, the inbound producer for the read task
    /// and the mailbox for the write task.
    pub fn new(cli_proto: usize, svr_proto: usize) -> (Arc<Self>, Producer<Frame>, Mailbox) {
        let (inbound_tx, inbound_rx) = ring(cli_proto);
        let (outbound_tx, outbound_rx) = ring(svr_proto);
        let (signal_tx, signal_rx) = mpsc::channel(1);

        let channel = Arc::new(Self {
            outbound: Mutex::new(outbound_tx),
            signal: signal_tx,
        });
        let mailbox = Mailbox {
            inbound: inbound_rx,
            outbound: outbound_rx,
            signal: signal_rx,
        };
        (channel, inbound_tx, mailbox)
    }

    /// Signal the write task without blocking.
    ///
    /// Returns `false` when the slot is already occupied or the write task
    /// is gone; the signal is then dropped.
    pub fn wake(&self, wake: Wake) -> bool {
        self.signal.try_send(wake).is_ok()
    }

    /// Queue a server-originated frame for delivery to the client.
    pub fn push(&self, frame: &Frame) -> Result<()> {
        if frame.body.len() > MAX_BODY_LEN {
            return Err(CometError::PacketTooLarge(frame.packet_len() as u32));
        }
        {
            let mut outbound = self
                .outbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let slot = outbound.reserve().map_err(|_| CometError::RingFull)?;
            slot.assign(frame);
            outbound.commit();
        }
        if !self.wake(Wake::ProtoReady) {
            trace!("push signal dropped, writer already signalled");
        }
        Ok(())
    }
}

impl Mailbox {
    /// Wait for the next wake signal.
    ///
    /// Resolves to [`Wake::Finished`] once every sender is dropped.
    pub async fn wait(&mut self) -> Wake {
        self.signal.recv().await.unwrap_or(Wake::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::op;

    #[tokio::test]
    async fn test_wake_is_dropped_when_slot_occupied() {
        let (channel, _inbound, mut mailbox) = Channel::new(4, 4);

        assert!(channel.wake(Wake::ProtoReady));
        assert!(!channel.wake(Wake::Finished));

        assert_eq!(mailbox.wait().await, Wake::ProtoReady);
        assert!(channel.wake(Wake::Finished));
        assert_eq!(mailbox.wait().await, Wake::Finished);
    }

    #[tokio::test]
    async fn test_wait_resolves_finished_when_senders_gone() {
        let (channel, _inbound, mut mailbox) = Channel::new(4, 4);
        drop(channel);
        assert_eq!(mailbox.wait().await, Wake::Finished);
    }

    #[test]
    fn test_wake_after_writer_gone_is_silent() {
        let (channel, _inbound, mailbox) = Channel::new(4, 4);
        drop(mailbox);
        assert!(!channel.wake(Wake::Finished));
    }

    #[tokio::test]
    async fn test_push_lands_in_outbound_in_order() {
        let (channel, _inbound, mut mailbox) = Channel::new(4, 4);

        channel.push(&Frame::new(1, op::SEND_SMS_REPLY, 1, b"a".to_vec())).unwrap();
        channel.push(&Frame::new(1, op::SEND_SMS_REPLY, 2, b"b".to_vec())).unwrap();

        assert_eq!(mailbox.wait().await, Wake::ProtoReady);
        assert_eq!(mailbox.outbound.peek().unwrap().seq_id, 1);
        mailbox.outbound.advance();
        assert_eq!(mailbox.outbound.peek().unwrap().body, b"b");
        mailbox.outbound.advance();
        assert!(mailbox.outbound.peek().is_none());
        assert!(mailbox.inbound.peek().is_none());
    }

    #[test]
    fn test_push_full_ring() {
        let (channel, _inbound, _mailbox) = Channel::new(1, 1);
        let frame = Frame::new(1, op::SEND_SMS_REPLY, 1, Vec::new());
        channel.push(&frame).unwrap();
        assert!(matches!(channel.push(&frame), Err(CometError::RingFull)));
    }

    #[test]
    fn test_push_rejects_oversized_body() {
        let (channel, _inbound, _mailbox) = Channel::new(1, 1);
        let frame = Frame::new(1, op::SEND_SMS_REPLY, 1, vec![0u8; MAX_BODY_LEN + 1]);
        assert!(matches!(
            channel.push(&frame),
            Err(CometError::PacketTooLarge(1025))
        ));
    }
}
