//! Proxy service implementation
//!
//! This module implements the reordering proxy using a message-driven
//! architecture. The accept loop owns the listener and every relay handle;
//! the harness reaches it only through a [`ProxyHandle`].

use futures::future::join_all;
use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

use super::message::{
    create_channel, FrameCounts, ProxyHandle, ProxyMessage, ProxySnapshot, ReorderRound,
};
use super::relay::{RelayConnection, RelayHandle};
use crate::common::{bind_listener, ProxyError, Result};
use crate::config::ProxyConfig;
use crate::frame::BoundaryRule;
use crate::reorder::ReorderPolicy;

/// How long stop waits for relays to close their sockets
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Relay tasks keyed by connection id
///
/// A panicking relay still yields its connection id, so its handle is
/// removed like any other finished connection.
#[derive(Default)]
struct ConnectionTasks {
    set: JoinSet<Result<()>>,
    ids: HashMap<task::Id, u64>,
}

impl ConnectionTasks {
    fn spawn<F>(&mut self, id: u64, relay: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let abort = self.set.spawn(relay);
        self.ids.insert(abort.id(), id);
    }

    /// Wait for the next relay to finish
    ///
    /// Returns `None` once no relay is running.
    async fn join_next(&mut self) -> Option<(u64, Result<()>)> {
        loop {
            let (task_id, result) = match self.set.join_next_with_id().await? {
                Ok((task_id, result)) => (task_id, result),
                Err(e) => {
                    let reason = if e.is_panic() { "panicked" } else { "was cancelled" };
                    let error = ProxyError::Other(format!("relay task {}", reason));
                    (e.id(), Err(error))
                }
            };
            // Ids are recorded at spawn, so a miss is not expected
            if let Some(id) = self.ids.remove(&task_id) {
                return Some((id, result));
            }
        }
    }

    fn len(&self) -> usize {
        self.set.len()
    }

    fn abort_all(&mut self) {
        self.set.abort_all();
    }
}

/// Mutable state of the accept loop
struct ProxyState {
    /// Proxy configuration
    config: Arc<ProxyConfig>,
    /// Reorder policy shared by every relay
    policy: Arc<dyn ReorderPolicy>,
    /// Frame boundary rule shared by every relay
    rule: Arc<dyn BoundaryRule>,
    /// Parent of every relay's cancellation token
    shutdown: CancellationToken,
    /// Live relays by connection id
    relays: HashMap<u64, RelayHandle>,
    /// Relay tasks
    tasks: ConnectionTasks,
    /// Next connection id
    next_id: u64,
}

impl ProxyState {
    fn record_active(&self) {
        gauge!("reorder_proxy_active_connections").set(self.relays.len() as f64);
    }

    fn handle_connection(&mut self, client: tokio::net::TcpStream, client_addr: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;

        if let Err(e) = client.set_nodelay(true) {
            debug!("[conn {}] could not set TCP_NODELAY: {}", id, e);
        }

        let relay = RelayConnection::new(
            id,
            client,
            client_addr,
            Arc::clone(&self.config),
            Arc::clone(&self.policy),
            Arc::clone(&self.rule),
            self.shutdown.child_token(),
        );
        info!("[conn {}] accepted {} -> {}", id, client_addr, self.config.upstream_addr());

        self.relays.insert(id, relay.handle());
        self.tasks.spawn(id, relay.run());
        self.record_active();
    }

    fn connection_finished(&mut self, id: u64, result: Result<()>) {
        self.relays.remove(&id);
        self.record_active();
        match result {
            Ok(()) => debug!("[conn {}] finished", id),
            Err(e) => error!("[conn {}] finished with error: {}", id, e),
        }
    }

    fn snapshot(&self) -> ProxySnapshot {
        let mut connections: Vec<_> =
            self.relays.values().map(|relay| relay.info().clone()).collect();
        connections.sort_by_key(|info| info.id);

        let buffered = self
            .relays
            .values()
            .map(RelayHandle::buffered)
            .fold(FrameCounts::default(), |acc, counts| acc + counts);

        ProxySnapshot { connections, buffered }
    }

    /// Release every live relay off the accept loop
    fn trigger_reorder(&self, reply: oneshot::Sender<ReorderRound>) {
        let relays: Vec<RelayHandle> = self.relays.values().cloned().collect();
        tokio::spawn(async move {
            let round = reorder_round(relays).await;
            // The caller may have stopped waiting
            let _ = reply.send(round);
        });
    }
}

/// Release and flush a set of relays concurrently
async fn reorder_round(relays: Vec<RelayHandle>) -> ReorderRound {
    let results = join_all(relays.iter().map(|relay| async move {
        (relay.id(), relay.release().await)
    }))
    .await;

    let mut round = ReorderRound::default();
    for (id, result) in results {
        match result {
            Ok(report) => {
                round.connections += 1;
                round.frames = round.frames + report;
            }
            Err(e) => {
                round.failed += 1;
                warn!("[conn {}] reorder round skipped: {}", id, e);
            }
        }
    }

    info!(
        "Reorder round released {} frames ({} client->server, {} server->client) on {} connections",
        round.total_frames(),
        round.frames.client_to_server,
        round.frames.server_to_client,
        round.connections
    );
    counter!("reorder_proxy_rounds_total").increment(1);
    round
}

/// Reordering proxy
///
/// Listens on a local address, relays every accepted client to the upstream
/// server, and holds the frames of both directions until a reorder round is
/// triggered through the [`ProxyHandle`].
pub struct ReorderProxy {
    /// Bound listening socket
    listener: TcpListener,
    /// Address actually bound
    local_addr: SocketAddr,
    /// Proxy configuration (wrapped in Arc for efficient sharing)
    config: Arc<ProxyConfig>,
    /// Reorder policy for every relay
    policy: Arc<dyn ReorderPolicy>,
    /// Frame boundary rule for every relay
    rule: Arc<dyn BoundaryRule>,
}

impl ReorderProxy {
    /// Bind a proxy in front of `upstream_host:upstream_port`
    ///
    /// Other settings take their defaults. Must be called from within a Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Bind` if the local address is unavailable.
    pub fn new(
        local_host: &str,
        local_port: u16,
        upstream_host: &str,
        upstream_port: u16,
        policy: Arc<dyn ReorderPolicy>,
    ) -> Result<Self> {
        let config = ProxyConfig::new(local_host, local_port, upstream_host, upstream_port);
        Self::with_policy(config, policy)
    }

    /// Bind a proxy using the policy described by the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the policy settings are invalid or the local
    /// address is unavailable.
    pub fn bind(config: ProxyConfig) -> Result<Self> {
        let policy = config.build_policy()?;
        Self::with_policy(config, policy)
    }

    /// Bind a proxy with an explicit reorder policy
    ///
    /// # Errors
    ///
    /// Returns an error if the framing settings are invalid or the local
    /// address is unavailable.
    pub fn with_policy(config: ProxyConfig, policy: Arc<dyn ReorderPolicy>) -> Result<Self> {
        let rule = config.boundary_rule()?;
        let listener = bind_listener(config.listen_addr()?)?;
        let local_addr = listener.local_addr()?;

        info!(
            "Proxy bound on {}, relaying to {} with {} policy",
            local_addr,
            config.upstream_addr(),
            policy.name()
        );

        Ok(Self {
            listener,
            local_addr,
            config: Arc::new(config),
            policy,
            rule,
        })
    }

    /// Address clients should connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Proxy configuration
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Spawn the accept loop and return its control handle
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> ProxyHandle {
        let (handle, rx) = create_channel(self.local_addr);
        tokio::spawn(self.run_service(rx));
        handle
    }

    /// Run the accept loop until a shutdown message arrives or every handle
    /// is dropped
    async fn run_service(self, mut rx: mpsc::Receiver<ProxyMessage>) {
        let Self {
            listener,
            local_addr,
            config,
            policy,
            rule,
        } = self;

        info!("Proxy service started, listening on {}", local_addr);

        let mut state = ProxyState {
            config,
            policy,
            rule,
            shutdown: CancellationToken::new(),
            relays: HashMap::new(),
            tasks: ConnectionTasks::default(),
            next_id: 1,
        };
        state.record_active();

        let stop_reply = loop {
            select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((client, client_addr)) => state.handle_connection(client, client_addr),
                        Err(e) => error!("Error accepting connection: {}", e),
                    }
                }

                message = rx.recv() => {
                    match message {
                        Some(ProxyMessage::TriggerReorder { reply }) => {
                            state.trigger_reorder(reply)
                        }
                        Some(ProxyMessage::Snapshot { reply }) => {
                            let _ = reply.send(state.snapshot());
                        }
                        Some(ProxyMessage::Shutdown { reply }) => {
                            info!("Received shutdown message");
                            break Some(reply);
                        }
                        None => {
                            info!("All proxy handles dropped, shutting down");
                            break None;
                        }
                    }
                }

                Some((id, result)) = state.tasks.join_next() => {
                    state.connection_finished(id, result);
                }
            }
        };

        // Closing the listener first so no relay is accepted mid-shutdown
        drop(listener);
        state.shutdown.cancel();

        info!("Closing {} connections...", state.relays.len());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some((id, result)) = state.tasks.join_next().await {
                if let Err(e) = result {
                    debug!("[conn {}] closed with error during shutdown: {}", id, e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown timeout reached, {} connections still active", state.tasks.len());
            state.tasks.abort_all();
        }
        state.relays.clear();
        state.record_active();

        info!("Proxy service on {} shutdown complete", local_addr);
        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
    }
}
