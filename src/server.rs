//! TCP server and per-connection lifecycle.
//!
//! Each accepted connection runs as two tasks. The read task (the task that
//! accepted the stream) performs the handshake, registers the session,
//! spawns the write task, then parses frames into the inbound ring until
//! the connection breaks. Closing the connection from either side, or from
//! an expired deadline, stops both.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bucket::{Buckets, Registry};
use crate::channel::{Channel, Wake};
use crate::closer::Closer;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{CometError, Result};
use crate::operator::{Operator, Session};
use crate::protocol::{op, read_frame, write_frame, Frame};
use crate::ring::Producer;
use crate::timer::{HeapTimer, Timer};

/// Idle time before TCP keepalive probes start.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Server instance
pub struct Server {
    config: Config,
    operator: Arc<dyn Operator>,
    registry: Arc<dyn Registry>,
    timers: Vec<Arc<dyn Timer>>,
    next_timer: AtomicUsize,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a server with in-process buckets and heap timers.
    ///
    /// Starts the timer tasks, so this must run inside a tokio runtime.
    pub fn new(config: Config, operator: Arc<dyn Operator>) -> Arc<Self> {
        let registry = Arc::new(Buckets::new(config.buckets));
        let timers = (0..config.timers.max(1))
            .map(|_| HeapTimer::start(config.timer_size, config.lazy_delay) as Arc<dyn Timer>)
            .collect();
        Self::with_parts(config, operator, registry, timers)
    }

    /// Create a server from explicit collaborators.
    ///
    /// An empty `timers` falls back to one heap timer built from `config`,
    /// which needs a tokio runtime.
    pub fn with_parts(
        config: Config,
        operator: Arc<dyn Operator>,
        registry: Arc<dyn Registry>,
        mut timers: Vec<Arc<dyn Timer>>,
    ) -> Arc<Self> {
        if timers.is_empty() {
            warn!("no timers supplied, starting a default heap timer");
            timers.push(HeapTimer::start(config.timer_size, config.lazy_delay));
        }
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Arc::new(Server {
            config,
            operator,
            registry,
            timers,
            next_timer: AtomicUsize::new(0),
            connection_limit,
        })
    }

    /// Registry of live sessions.
    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Start the server and begin accepting connections
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            // Wait for a connection slot
            let permit = match Arc::clone(&self.connection_limit).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    if let Err(e) = self.tune_socket(&stream) {
                        warn!(peer = %addr, error = %e, "Failed to tune socket");
                    }

                    let server = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            server.serve_conn(stream).await;
                            drop(permit);
                        }
                        .instrument(info_span!("conn", peer = %addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn tune_socket(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        let sock = SockRef::from(stream);
        if self.config.tcp_keepalive {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))?;
        }
        sock.set_recv_buffer_size(self.config.tcp_rcvbuf)?;
        sock.set_send_buffer_size(self.config.tcp_sndbuf)?;
        Ok(())
    }

    fn next_timer(&self) -> Arc<dyn Timer> {
        let idx = self.next_timer.fetch_add(1, Ordering::Relaxed) % self.timers.len();
        Arc::clone(&self.timers[idx])
    }

    /// Serve one connection until it closes.
    ///
    /// Runs the handshake and the read loop on the calling task and spawns
    /// the write task once the session is registered.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::with_capacity(self.config.read_buf, reader);
        let mut writer = BufWriter::with_capacity(self.config.write_buf, writer);
        let closer = Closer::new();
        let timer = self.next_timer();
        let mut frame = Frame::default();

        let session = match timer.schedule(self.config.handshake_timeout, closer.clone()) {
            Ok(deadline) => {
                let res = closer
                    .guard(self.handshake(&mut reader, &mut writer, &mut frame))
                    .await;
                timer.cancel(&deadline);
                res
            }
            Err(e) => {
                error!(error = %e, "failed to schedule handshake deadline");
                Err(e.into())
            }
        };

        let Session { key, heartbeat } = match session {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "handshake failed");
                closer.close();
                return;
            }
        };

        let (channel, mut inbound, mailbox) =
            Channel::new(self.config.cli_proto, self.config.svr_proto);
        self.registry.put(&key, Arc::clone(&channel));

        let dispatcher = Dispatcher {
            key: key.clone(),
            closer: closer.clone(),
            heartbeat,
            timer,
            operator: Arc::clone(&self.operator),
        };
        tokio::spawn(dispatcher.run(writer, mailbox).in_current_span());

        if let Err(e) = read_loop(&mut reader, &mut inbound, &channel, &closer).await {
            debug!(key = %key, error = %e, "read loop stopped");
        }

        // Teardown. Nothing here may abort early.
        closer.close();
        if !channel.wake(Wake::Finished) {
            debug!(key = %key, "finish signal dropped, writer wakes on close");
        }
        if !self.registry.remove(&key, &channel) {
            debug!(key = %key, "session already replaced in registry");
        }
        if let Err(e) = self.operator.disconnect(&key).await {
            error!(key = %key, error = %e, "operator disconnect failed");
        }
        drop(reader);
        debug!(key = %key, "connection closed");
    }

    /// Authenticate the first frame and answer it.
    async fn handshake<R, W>(&self, reader: &mut R, writer: &mut W, frame: &mut Frame) -> Result<Session>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        read_frame(reader, frame).await?;
        if frame.operation != op::AUTH {
            warn!(operation = frame.operation, "auth operation not valid");
            return Err(CometError::UnexpectedOperation(frame.operation));
        }

        let session = self.operator.connect(frame).await?;
        frame.reply(op::AUTH_REPLY);
        write_frame(writer, frame).await?;
        debug!(key = %session.key, heartbeat = ?session.heartbeat, "handshake complete");
        Ok(session)
    }

    /// Queue a frame for the session under `key`.
    pub fn push(&self, key: &str, frame: &Frame) -> Result<()> {
        let channel = self
            .registry
            .get(key)
            .ok_or_else(|| CometError::SessionNotFound(key.to_string()))?;
        channel.push(frame)
    }

    /// Queue a frame for every live session.
    ///
    /// Returns how many sessions accepted it.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.registry
            .channels()
            .iter()
            .filter(|channel| match channel.push(frame) {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "broadcast push failed");
                    false
                }
            })
            .count()
    }
}

/// Parse client frames into the inbound ring until the connection breaks.
async fn read_loop<R>(
    reader: &mut R,
    inbound: &mut Producer<Frame>,
    channel: &Channel,
    closer: &Closer,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let slot = inbound.reserve().map_err(|_| CometError::RingFull)?;
        closer.guard(read_frame(reader, slot)).await?;
        inbound.commit();
        if !channel.wake(Wake::ProtoReady) {
            warn!("send a signal, but channel is full, ignoring");
        }
    }
}
