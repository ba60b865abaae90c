//! Aggregation coordinator
//!
//! Lifecycle root of the monitor: starts the discovery listener and the
//! stale-instance sweeper, spawns one server session per discovered
//! backend, and exposes the query/command/subscribe API presenters use.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{PermissionDecision, SendReceipt};
use crate::config::Config;
use crate::discovery::DiscoveryListener;
use crate::model::{Server, Session};
use crate::protocol::{AnnouncePacket, DiscoveryPacket};
use crate::registry::{EventFilter, Registry, RemovalReason, Stats, Subscription};
use crate::server_session::ServerSession;
use crate::supervisor::StreamState;
use crate::{Error, Result};

/// The aggregation engine. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    registry: Arc<Registry>,
    server_sessions: DashMap<String, Arc<ServerSession>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    discovery_port: Mutex<Option<u16>>,
}

impl Coordinator {
    /// Create a coordinator; nothing runs until [`Self::start`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new(config.aggregator.notification_buffer));
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                server_sessions: DashMap::new(),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                discovery_port: Mutex::new(None),
            }),
        }
    }

    /// Bind the discovery socket and start the background loops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] when the UDP port is taken; no partial
    /// state is left behind.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;

        let listener = DiscoveryListener::bind(inner.config.discovery.port).await?;
        let port = listener.local_port()?;
        *inner.discovery_port.lock() = Some(port);

        let (tx, rx) = mpsc::channel(64);

        let listen_task = tokio::spawn(listener.run(inner.cancel.child_token(), tx));
        let accept_task = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move { accept_loop(inner, rx).await })
        };
        let sweep_task = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move { sweeper_loop(inner).await })
        };
        inner
            .tasks
            .lock()
            .extend([listen_task, accept_task, sweep_task]);

        info!(
            port,
            stale_timeout = ?inner.config.aggregator.stale_timeout,
            "Aggregator started"
        );
        Ok(())
    }

    /// The UDP port actually bound, once started.
    #[must_use]
    pub fn discovery_port(&self) -> Option<u16> {
        *self.inner.discovery_port.lock()
    }

    /// The effective configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // -- queries -----------------------------------------------------------

    /// All known servers.
    #[must_use]
    pub fn servers(&self) -> Vec<Server> {
        self.inner.registry.servers()
    }

    /// All known sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        self.inner.registry.sessions()
    }

    /// One session.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.inner.registry.session(session_id)
    }

    /// Sessions in a non-terminal status.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<Session> {
        self.inner.registry.active_sessions()
    }

    /// Sessions flagged long-running or older than the configured
    /// threshold.
    #[must_use]
    pub fn long_running_sessions(&self) -> Vec<Session> {
        self.inner
            .registry
            .long_running_sessions(self.inner.config.aggregator.long_running_threshold)
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.inner.registry.stats()
    }

    // -- commands ----------------------------------------------------------

    /// Fetch full detail (messages included) for one session and return
    /// the refreshed record.
    pub async fn focus_session(&self, session_id: &str) -> Result<Session> {
        let server = self.owning_session(session_id)?;
        let result = server.refresh_session(session_id).await.and_then(|()| {
            self.inner
                .registry
                .session(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
        });
        self.surface(Some(server.server_id()), result)
    }

    /// Send a message into a session.
    pub async fn send_message(&self, session_id: &str, content: &str) -> Result<SendReceipt> {
        let server = self.owning_session(session_id)?;
        let result = server.send_message(session_id, content).await;
        self.surface(Some(server.server_id()), result)
    }

    /// Abort a session's current turn.
    pub async fn abort_session(&self, session_id: &str) -> Result<()> {
        let server = self.owning_session(session_id)?;
        let result = server.abort(session_id).await;
        self.surface(Some(server.server_id()), result)
    }

    /// Resolve a permission prompt.
    pub async fn resolve_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        decision: PermissionDecision,
    ) -> Result<()> {
        let server = self.owning_session(session_id)?;
        let result = server
            .resolve_permission(session_id, permission_id, decision)
            .await;
        self.surface(Some(server.server_id()), result)
    }

    // -- subscriptions -----------------------------------------------------

    /// Register a change-notification subscriber.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        self.inner.registry.subscribe(filter)
    }

    /// Unsubscribe by handing the handle back.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    // -- lifecycle ---------------------------------------------------------

    /// Orderly teardown: discovery and sweeper stop, every server session
    /// is cancelled (concurrently) before its records go away, then the
    /// registry is cleared.
    pub async fn stop(&self) {
        info!("Stopping aggregator");
        let inner = &self.inner;
        inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let sessions: Vec<Arc<ServerSession>> = inner
            .server_sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        inner.server_sessions.clear();
        futures::future::join_all(sessions.iter().map(|s| s.halt())).await;

        inner.registry.clear();
        info!("Aggregator stopped");
    }

    // -- internals ---------------------------------------------------------

    fn owning_session(&self, session_id: &str) -> Result<Arc<ServerSession>> {
        let session = self
            .inner
            .registry
            .session(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        self.inner
            .server_sessions
            .get(&session.server_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::ServerNotFound(session.server_id))
    }

    fn surface<T>(&self, server_id: Option<&str>, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if !e.is_recoverable() {
                self.inner.registry.notify_error(server_id, e.to_string());
            }
        }
        result
    }
}

async fn accept_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<DiscoveryPacket>) {
    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            packet = rx.recv() => match packet {
                Some(DiscoveryPacket::Announce(announce)) => {
                    inner.handle_announce(announce).await;
                }
                Some(DiscoveryPacket::Shutdown(shutdown)) => {
                    inner
                        .remove_server(&shutdown.server_id, RemovalReason::Shutdown)
                        .await;
                }
                None => return,
            },
        }
    }
}

async fn sweeper_loop(inner: Arc<Inner>) {
    let period = (inner.config.aggregator.stale_timeout / 2).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            _ = interval.tick() => inner.sweep().await,
        }
    }
}

impl Inner {
    async fn handle_announce(&self, packet: AnnouncePacket) {
        // A changed URL or a supervisor that ran out of reconnect attempts
        // both call for a fresh server session around a fresh client; the
        // announcement is the external reset.
        let rebuild = self
            .server_sessions
            .get(&packet.server_id)
            .map(|entry| {
                entry.url() != packet.server_url || entry.stream_state() == StreamState::Failed
            })
            .unwrap_or(false);

        if rebuild {
            if let Some((_, old)) = self.server_sessions.remove(&packet.server_id) {
                info!(server = %packet.server_id, url = %packet.server_url, "Rebuilding server session");
                old.halt().await;
            }
        }

        self.registry.absorb_announce(&packet);

        if !self.server_sessions.contains_key(&packet.server_id) {
            match ServerSession::spawn(
                &packet,
                Arc::clone(&self.registry),
                &self.config,
                &self.cancel,
            ) {
                Ok(session) => {
                    self.server_sessions
                        .insert(packet.server_id.clone(), session);
                }
                Err(e) => {
                    warn!(server = %packet.server_id, error = %e, "Failed to start server session");
                    self.registry
                        .notify_error(Some(&packet.server_id), e.to_string());
                }
            }
        }
    }

    async fn remove_server(&self, server_id: &str, reason: RemovalReason) {
        if let Some((_, session)) = self.server_sessions.remove(server_id) {
            session.shutdown(reason).await;
        } else {
            // Spawn may have failed earlier; the record still goes away.
            self.registry.absorb_shutdown(server_id, reason);
        }
    }

    async fn sweep(&self) {
        let now = Utc::now();
        let timeout = self.config.aggregator.stale_timeout;
        let stale: Vec<String> = self
            .registry
            .servers()
            .into_iter()
            .filter(|server| server.is_stale(now, timeout))
            .map(|server| server.id)
            .collect();

        for server_id in stale {
            info!(server = %server_id, "Server announcement went stale");
            self.remove_server(&server_id, RemovalReason::Stale).await;
        }
    }
}
