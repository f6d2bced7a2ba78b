//! Write task: the outbound half of a connection.
//!
//! Waits for a wake signal, then drains the inbound ring (answering
//! heartbeats locally and handing everything else to the operator) and the
//! outbound ring (server pushes, forwarded verbatim). Every frame is flushed
//! as soon as it is written. The task owns the heartbeat deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace};

use crate::channel::{Mailbox, Wake};
use crate::closer::Closer;
use crate::error::{CometError, Result};
use crate::operator::Operator;
use crate::protocol::{op, write_frame};
use crate::timer::{DeadlineHandle, Timer};

/// Everything the write task needs besides the socket and the mailbox.
pub(crate) struct Dispatcher {
    pub key: String,
    pub closer: Closer,
    pub heartbeat: Duration,
    pub timer: Arc<dyn Timer>,
    pub operator: Arc<dyn Operator>,
}

impl Dispatcher {
    /// Run the write task to completion.
    ///
    /// Teardown always closes the connection, shuts the write half down and
    /// cancels the heartbeat deadline. Registry removal and the operator's
    /// disconnect belong to the read task.
    pub async fn run<W>(self, mut writer: W, mut mailbox: Mailbox)
    where
        W: AsyncWrite + Unpin,
    {
        debug!(key = %self.key, "dispatch started");

        let mut deadline = match self.timer.schedule(self.heartbeat, self.closer.clone()) {
            Ok(deadline) => Some(deadline),
            Err(e) => {
                error!(key = %self.key, error = %e, "failed to schedule heartbeat deadline");
                None
            }
        };

        if let Some(deadline) = deadline.as_mut() {
            if let Err(e) = self.dispatch(&mut writer, &mut mailbox, deadline).await {
                debug!(key = %self.key, error = %e, "dispatch stopped");
            }
        }

        // Wakes the read task.
        self.closer.close();
        if let Err(e) = writer.shutdown().await {
            debug!(key = %self.key, error = %e, "write half shutdown failed");
        }
        if let Some(deadline) = deadline {
            self.timer.cancel(&deadline);
        }
        debug!(key = %self.key, "dispatch exited");
    }

    async fn dispatch<W>(
        &self,
        writer: &mut W,
        mailbox: &mut Mailbox,
        deadline: &mut DeadlineHandle,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let wake = tokio::select! {
                biased;
                _ = self.closer.closed() => Wake::Finished,
                wake = mailbox.wait() => wake,
            };
            if wake == Wake::Finished {
                return Ok(());
            }

            // Client requests first, in arrival order.
            while let Some(frame) = mailbox.inbound.peek() {
                if frame.operation == op::HEARTBEAT {
                    self.renew(deadline)?;
                    frame.reply(op::HEARTBEAT_REPLY);
                    trace!(key = %self.key, seq_id = frame.seq_id, "heartbeat");
                } else {
                    self.closer
                        .guard(async {
                            self.operator.operate(frame).await.map_err(CometError::from)
                        })
                        .await?;
                }
                self.closer.guard(write_frame(writer, frame)).await?;
                mailbox.inbound.advance();
            }

            // Then server pushes, forwarded as-is.
            while let Some(frame) = mailbox.outbound.peek() {
                self.closer.guard(write_frame(writer, frame)).await?;
                mailbox.outbound.advance();
            }
        }
    }

    /// Push the heartbeat deadline out, unless the current one is close
    /// enough to the renewed expiry.
    fn renew(&self, deadline: &mut DeadlineHandle) -> Result<()> {
        if self.timer.is_within_lazy_window(deadline, self.heartbeat) {
            return Ok(());
        }
        self.timer.cancel(deadline);
        *deadline = self.timer.schedule(self.heartbeat, self.closer.clone())?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::operator::{OperatorError, Session};
    use crate::protocol::{read_frame, Frame};
    use crate::ring::Producer;
    use crate::timer::TimerError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{BufReader, BufWriter, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    /// Timer double that records calls and never fires.
    #[derive(Default)]
    pub(crate) struct RecordingTimer {
        pub lazy: AtomicBool,
        pub fail_schedule: AtomicBool,
        pub schedules: AtomicUsize,
        pub cancels: Mutex<Vec<u64>>,
        next_id: AtomicU64,
    }

    impl Timer for RecordingTimer {
        fn schedule(&self, after: Duration, _target: Closer) -> std::result::Result<DeadlineHandle, TimerError> {
            if self.fail_schedule.load(Ordering::SeqCst) {
                return Err(TimerError::Full(0));
            }
            self.schedules.fetch_add(1, Ordering::SeqCst);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(DeadlineHandle::new(id as usize, id, Instant::now() + after))
        }

        fn cancel(&self, handle: &DeadlineHandle) {
            self.cancels.lock().unwrap().push(handle.id());
        }

        fn is_within_lazy_window(&self, _handle: &DeadlineHandle, _after: Duration) -> bool {
            self.lazy.load(Ordering::SeqCst)
        }
    }

    /// Operator double that records frames it saw.
    #[derive(Default)]
    pub(crate) struct RecordingOperator {
        pub operated: Mutex<Vec<u32>>,
        pub fail_op: Option<u32>,
    }

    #[async_trait]
    impl Operator for RecordingOperator {
        async fn connect(&self, _frame: &Frame) -> std::result::Result<Session, OperatorError> {
            Ok(Session {
                key: "test".to_string(),
                heartbeat: Duration::from_secs(30),
            })
        }

        async fn operate(&self, frame: &mut Frame) -> std::result::Result<(), OperatorError> {
            self.operated.lock().unwrap().push(frame.operation);
            if self.fail_op == Some(frame.operation) {
                return Err(OperatorError::Unavailable("injected".to_string()));
            }
            frame.body.reverse();
            Ok(())
        }

        async fn disconnect(&self, _key: &str) -> std::result::Result<(), OperatorError> {
            Ok(())
        }
    }

    struct Harness {
        channel: Arc<Channel>,
        inbound: Producer<Frame>,
        client: BufReader<DuplexStream>,
        closer: Closer,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(timer: Arc<RecordingTimer>, operator: Arc<RecordingOperator>) -> Self {
            let (channel, inbound, mailbox) = Channel::new(8, 8);
            let (client, server) = tokio::io::duplex(4096);
            let closer = Closer::new();
            let dispatcher = Dispatcher {
                key: "test".to_string(),
                closer: closer.clone(),
                heartbeat: Duration::from_secs(30),
                timer,
                operator,
            };
            let task = tokio::spawn(dispatcher.run(BufWriter::new(server), mailbox));
            Self {
                channel,
                inbound,
                client: BufReader::new(client),
                closer,
                task,
            }
        }

        fn send(&mut self, frame: Frame) {
            self.inbound.reserve().unwrap().assign(&frame);
            self.inbound.commit();
            self.channel.wake(Wake::ProtoReady);
        }

        async fn recv(&mut self) -> Frame {
            let mut frame = Frame::default();
            read_frame(&mut self.client, &mut frame).await.unwrap();
            frame
        }
    }

    #[tokio::test]
    async fn test_heartbeat_answered_without_operator() {
        let timer = Arc::new(RecordingTimer::default());
        timer.lazy.store(true, Ordering::SeqCst);
        let operator = Arc::new(RecordingOperator::default());
        let mut h = Harness::start(timer, Arc::clone(&operator));

        h.send(Frame::new(3, op::HEARTBEAT, 2, b"junk".to_vec()));
        let reply = h.recv().await;

        assert_eq!(reply, Frame::new(3, op::HEARTBEAT_REPLY, 2, Vec::new()));
        assert!(operator.operated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lazy_heartbeat_keeps_deadline() {
        let timer = Arc::new(RecordingTimer::default());
        timer.lazy.store(true, Ordering::SeqCst);
        let mut h = Harness::start(Arc::clone(&timer), Arc::new(RecordingOperator::default()));

        h.send(Frame::new(1, op::HEARTBEAT, 1, Vec::new()));
        h.recv().await;

        assert_eq!(timer.schedules.load(Ordering::SeqCst), 1);
        assert!(timer.cancels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_outside_lazy_window_reschedules_once() {
        let timer = Arc::new(RecordingTimer::default());
        let mut h = Harness::start(Arc::clone(&timer), Arc::new(RecordingOperator::default()));

        h.send(Frame::new(1, op::HEARTBEAT, 1, Vec::new()));
        h.recv().await;

        assert_eq!(timer.schedules.load(Ordering::SeqCst), 2);
        assert_eq!(*timer.cancels.lock().unwrap(), vec![0]);

        // Teardown cancels the renewed deadline, not the original one.
        h.closer.close();
        h.task.await.unwrap();
        assert_eq!(*timer.cancels.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_inbound_before_outbound_in_order() {
        let timer = Arc::new(RecordingTimer::default());
        let operator = Arc::new(RecordingOperator::default());
        let mut h = Harness::start(timer, Arc::clone(&operator));

        h.channel
            .push(&Frame::new(1, op::SEND_SMS_REPLY, 100, b"push".to_vec()))
            .unwrap();
        h.inbound
            .reserve()
            .unwrap()
            .assign(&Frame::new(1, op::SEND_SMS, 1, b"ab".to_vec()));
        h.inbound.commit();
        h.inbound
            .reserve()
            .unwrap()
            .assign(&Frame::new(1, op::SEND_SMS, 2, b"cd".to_vec()));
        h.inbound.commit();
        h.channel.wake(Wake::ProtoReady);

        let first = h.recv().await;
        let second = h.recv().await;
        let third = h.recv().await;

        assert_eq!((first.seq_id, first.body), (1, b"ba".to_vec()));
        assert_eq!((second.seq_id, second.body), (2, b"dc".to_vec()));
        assert_eq!(third, Frame::new(1, op::SEND_SMS_REPLY, 100, b"push".to_vec()));
        assert_eq!(*operator.operated.lock().unwrap(), vec![op::SEND_SMS; 2]);
    }

    #[tokio::test]
    async fn test_operator_error_tears_down() {
        let timer = Arc::new(RecordingTimer::default());
        let operator = Arc::new(RecordingOperator {
            fail_op: Some(op::TEST),
            ..Default::default()
        });
        let mut h = Harness::start(Arc::clone(&timer), operator);

        h.send(Frame::new(1, op::TEST, 1, Vec::new()));
        h.task.await.unwrap();

        assert!(h.closer.is_closed());
        assert_eq!(*timer.cancels.lock().unwrap(), vec![0]);

        let mut frame = Frame::default();
        assert!(read_frame(&mut h.client, &mut frame).await.is_err());
    }

    #[tokio::test]
    async fn test_finished_signal_tears_down() {
        let timer = Arc::new(RecordingTimer::default());
        let h = Harness::start(Arc::clone(&timer), Arc::new(RecordingOperator::default()));

        assert!(h.channel.wake(Wake::Finished));
        h.task.await.unwrap();
        assert!(h.closer.is_closed());
        assert_eq!(timer.cancels.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_failure_closes_connection() {
        let timer = Arc::new(RecordingTimer::default());
        timer.fail_schedule.store(true, Ordering::SeqCst);
        let h = Harness::start(Arc::clone(&timer), Arc::new(RecordingOperator::default()));

        h.task.await.unwrap();
        assert!(h.closer.is_closed());
        assert!(timer.cancels.lock().unwrap().is_empty());
    }
}
