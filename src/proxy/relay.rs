//! Relay connection module
//!
//! A relay owns one accepted client socket and its paired upstream socket.
//! Both directions are pumped concurrently, each through its own splitter and
//! reorder buffer, and nothing is forwarded until the harness releases it.

use log::{debug, info, warn};
use metrics::counter;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::forwarder::{pump_frames, write_frames, PumpExit};
use super::message::{ConnectionInfo, FrameCounts, ReleaseReport};
use crate::common::{ProxyError, Result};
use crate::config::ProxyConfig;
use crate::frame::{BoundaryRule, Direction, Frame, FrameSplitter};
use crate::reorder::{ReorderBuffer, ReorderPolicy};

/// How long writers may take to finish their current frame once closing
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of a relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Dialling the upstream server
    Connecting,
    /// Both directions are being pumped
    Relaying,
    /// Sockets are being closed, unreleased frames dropped
    Closing,
    /// Terminal
    Closed,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Relaying => write!(f, "relaying"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Item queued for a direction's writer
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A released frame
    Frame(Frame),
    /// Acknowledge once every earlier frame has been written
    Flush(oneshot::Sender<()>),
}

/// Reorder state for one direction of one relay
///
/// Shared between the direction's read pump, which accepts frames, and the
/// release path driven by the harness.
#[derive(Debug)]
pub(crate) struct Lane {
    direction: Direction,
    buffer: Mutex<ReorderBuffer>,
    /// Signalled whenever a release frees capacity
    space: Notify,
    /// Serialises release rounds so their frames never interleave
    releasing: tokio::sync::Mutex<()>,
    outbound: mpsc::Sender<Outbound>,
}

impl Lane {
    /// Create a lane and the receiving end for its writer
    pub(crate) fn new(
        direction: Direction,
        capacity: usize,
        policy: Arc<dyn ReorderPolicy>,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(capacity.clamp(1, 1024));
        let lane = Self {
            direction,
            buffer: Mutex::new(ReorderBuffer::new(direction, capacity, policy)),
            space: Notify::new(),
            releasing: tokio::sync::Mutex::new(()),
            outbound,
        };
        (lane, rx)
    }

    fn lock(&self) -> MutexGuard<'_, ReorderBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a frame, waiting for capacity while the buffer is full
    ///
    /// Returns `false` if the connection shut down before the frame fit.
    pub(crate) async fn accept(&self, mut frame: Frame, shutdown: &CancellationToken) -> bool {
        loop {
            // Registered before the check so a release in between is not missed
            let space = self.space.notified();
            let rejected = self.lock().accept(frame);
            match rejected {
                Ok(()) => return true,
                Err(full) => {
                    frame = full.into_frame();
                    debug!(
                        "[{}] reorder buffer full, stalling reader at frame {}",
                        self.direction,
                        frame.sequence()
                    );
                    tokio::select! {
                        _ = space => {}
                        _ = shutdown.cancelled() => return false,
                    }
                }
            }
        }
    }

    /// Release held frames through the policy and write them to the peer
    ///
    /// Returns once the writer has written every released frame.
    pub(crate) async fn release(&self) -> Result<usize> {
        let _round = self.releasing.lock().await;

        let (frames, policy) = {
            let mut buffer = self.lock();
            (buffer.release(), buffer.policy().name())
        };
        self.space.notify_waiters();

        let count = frames.len();
        if count == 0 {
            return Ok(0);
        }

        debug!(
            "[{}] releasing {} frames in {} order {:?}",
            self.direction,
            count,
            policy,
            frames.iter().map(Frame::sequence).collect::<Vec<_>>()
        );

        for frame in frames {
            self.outbound
                .send(Outbound::Frame(frame))
                .await
                .map_err(|_| closed_during_release(self.direction))?;
        }

        let (ack, written) = oneshot::channel();
        self.outbound
            .send(Outbound::Flush(ack))
            .await
            .map_err(|_| closed_during_release(self.direction))?;
        written
            .await
            .map_err(|_| closed_during_release(self.direction))?;

        counter!("reorder_proxy_frames_released_total", "direction" => self.direction.as_str())
            .increment(count as u64);
        Ok(count)
    }

    /// Drop every held frame
    pub(crate) fn discard(&self) -> usize {
        let dropped = self.lock().discard();
        self.space.notify_waiters();
        dropped
    }

    /// Frames currently held
    pub(crate) fn buffered(&self) -> usize {
        self.lock().len()
    }
}

fn closed_during_release(direction: Direction) -> ProxyError {
    ProxyError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("{} writer closed before released frames were written", direction),
    ))
}

/// Handle to a live relay, held by the listener
#[derive(Debug, Clone)]
pub struct RelayHandle {
    info: ConnectionInfo,
    client_to_server: Arc<Lane>,
    server_to_client: Arc<Lane>,
    shutdown: CancellationToken,
}

impl RelayHandle {
    /// Connection details
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Connection id
    pub fn id(&self) -> u64 {
        self.info.id
    }

    fn lane(&self, direction: Direction) -> &Lane {
        match direction {
            Direction::ClientToServer => &self.client_to_server,
            Direction::ServerToClient => &self.server_to_client,
        }
    }

    /// Release both directions concurrently and wait for the writes
    ///
    /// # Errors
    ///
    /// Returns an error if the connection closed before the released frames
    /// were written.
    pub async fn release(&self) -> Result<ReleaseReport> {
        let (c2s, s2c) = tokio::join!(
            self.lane(Direction::ClientToServer).release(),
            self.lane(Direction::ServerToClient).release(),
        );
        Ok(ReleaseReport {
            client_to_server: c2s?,
            server_to_client: s2c?,
        })
    }

    /// Frames currently held, by direction
    pub fn buffered(&self) -> FrameCounts {
        let mut counts = FrameCounts::default();
        for direction in Direction::ALL {
            counts.set(direction, self.lane(direction).buffered());
        }
        counts
    }

    /// Request the connection to close
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether the connection has been asked to close
    pub fn is_closing(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// One client/upstream pair
pub struct RelayConnection {
    info: ConnectionInfo,
    client: Option<TcpStream>,
    config: Arc<ProxyConfig>,
    rule: Arc<dyn BoundaryRule>,
    state: RelayState,
    shutdown: CancellationToken,
    client_to_server: Arc<Lane>,
    server_to_client: Arc<Lane>,
    client_to_server_rx: Option<mpsc::Receiver<Outbound>>,
    server_to_client_rx: Option<mpsc::Receiver<Outbound>>,
}

impl RelayConnection {
    /// Create a relay for an accepted client
    ///
    /// # Parameters
    ///
    /// * `id` - Connection id, unique per proxy
    /// * `client` - Accepted client socket
    /// * `client_addr` - Client address
    /// * `config` - Proxy configuration
    /// * `policy` - Reorder policy for both directions
    /// * `rule` - Frame boundary rule for both directions
    /// * `shutdown` - Token cancelled to close the relay
    pub fn new(
        id: u64,
        client: TcpStream,
        client_addr: SocketAddr,
        config: Arc<ProxyConfig>,
        policy: Arc<dyn ReorderPolicy>,
        rule: Arc<dyn BoundaryRule>,
        shutdown: CancellationToken,
    ) -> Self {
        let capacity = config.buffer_capacity;
        let (c2s, c2s_rx) = Lane::new(Direction::ClientToServer, capacity, Arc::clone(&policy));
        let (s2c, s2c_rx) = Lane::new(Direction::ServerToClient, capacity, policy);

        Self {
            info: ConnectionInfo {
                id,
                source: client_addr,
                target: config.upstream_addr(),
                timestamp: SystemTime::now(),
            },
            client: Some(client),
            config,
            rule,
            state: RelayState::Connecting,
            shutdown,
            client_to_server: Arc::new(c2s),
            server_to_client: Arc::new(s2c),
            client_to_server_rx: Some(c2s_rx),
            server_to_client_rx: Some(s2c_rx),
        }
    }

    /// Handle for releasing and closing this relay from elsewhere
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            info: self.info.clone(),
            client_to_server: Arc::clone(&self.client_to_server),
            server_to_client: Arc::clone(&self.server_to_client),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Current state
    pub fn state(&self) -> RelayState {
        self.state
    }

    fn transition(&mut self, next: RelayState) {
        debug!("[conn {}] {} -> {}", self.info.id, self.state, next);
        self.state = next;
    }

    fn splitter(&self, direction: Direction) -> FrameSplitter {
        FrameSplitter::new(direction, Arc::clone(&self.rule), self.config.max_frame_size)
    }

    /// Run the relay until either side closes, an error occurs, or shutdown
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ConnectUpstream` if the upstream server cannot be
    /// reached, or the error that aborted relaying. Either way both sockets
    /// are closed when this returns.
    pub async fn run(mut self) -> Result<()> {
        let upstream = match self.connect_upstream().await {
            Ok(Some(upstream)) => upstream,
            Ok(None) => {
                self.transition(RelayState::Closed);
                return Ok(());
            }
            Err(e) => {
                // Closing the client without relaying anything
                self.client.take();
                self.transition(RelayState::Closed);
                return Err(e);
            }
        };

        let client = match self.client.take() {
            Some(client) => client,
            None => return Err(ProxyError::Other("Relay started twice".to_string())),
        };
        let receivers = (self.client_to_server_rx.take(), self.server_to_client_rx.take());
        let (c2s_rx, s2c_rx) = match receivers {
            (Some(c2s), Some(s2c)) => (c2s, s2c),
            _ => return Err(ProxyError::Other("Relay started twice".to_string())),
        };

        self.transition(RelayState::Relaying);
        info!(
            "[conn {}] relaying {} <-> {}",
            self.info.id, self.info.source, self.info.target
        );

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let mut writers = tokio::task::JoinSet::new();
        writers.spawn(write_frames(upstream_write, c2s_rx, self.shutdown.clone()));
        writers.spawn(write_frames(client_write, s2c_rx, self.shutdown.clone()));

        let read_size = self.config.read_buffer_size;
        let outcome = tokio::select! {
            result = pump_frames(
                client_read,
                self.splitter(Direction::ClientToServer),
                &self.client_to_server,
                &self.shutdown,
                read_size,
            ) => (Direction::ClientToServer, result),
            result = pump_frames(
                upstream_read,
                self.splitter(Direction::ServerToClient),
                &self.server_to_client,
                &self.shutdown,
                read_size,
            ) => (Direction::ServerToClient, result),
        };

        self.transition(RelayState::Closing);
        self.shutdown.cancel();

        let result = match outcome {
            (direction, Ok(PumpExit::Eof)) => {
                info!("[conn {}] {} stream closed by peer", self.info.id, direction);
                Ok(())
            }
            (_, Ok(PumpExit::Cancelled)) => {
                info!("[conn {}] shutdown requested", self.info.id);
                Ok(())
            }
            (direction, Err(e)) => {
                // Reported once by the listener when the task is joined
                debug!("[conn {}] aborting after {} error", self.info.id, direction);
                Err(e)
            }
        };

        self.discard_unreleased();

        let drained = timeout(WRITER_GRACE, async {
            while let Some(joined) = writers.join_next().await {
                if let Ok(Err(e)) = joined {
                    debug!("[conn {}] writer stopped: {}", self.info.id, e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("[conn {}] writers did not stop in time, aborting them", self.info.id);
            writers.abort_all();
        }

        self.transition(RelayState::Closed);
        result
    }

    /// Dial the upstream server
    ///
    /// Returns `Ok(None)` if shutdown was requested first.
    async fn connect_upstream(&mut self) -> Result<Option<TcpStream>> {
        let addr = self.info.target.clone();
        let connect = timeout(self.config.connect_timeout(), TcpStream::connect(addr.clone()));

        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            connected = connect => connected,
        };

        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ProxyError::ConnectUpstream { addr, source }),
            Err(_) => {
                return Err(ProxyError::ConnectUpstream {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "Connection timed out"),
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("[conn {}] could not set TCP_NODELAY upstream: {}", self.info.id, e);
        }
        Ok(Some(stream))
    }

    /// Drop frames that were captured but never released
    fn discard_unreleased(&self) {
        let c2s = self.client_to_server.discard();
        let s2c = self.server_to_client.discard();
        let dropped = c2s + s2c;
        if dropped > 0 {
            warn!(
                "[conn {}] connection closed with {} unreleased frames dropped ({} {}, {} {})",
                self.info.id,
                dropped,
                c2s,
                Direction::ClientToServer,
                s2c,
                Direction::ServerToClient
            );
            counter!("reorder_proxy_frames_discarded_total").increment(dropped as u64);
        }
    }
}
