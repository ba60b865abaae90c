//! Per-server session management
//!
//! A `ServerSession` represents one discovered backend while it is alive:
//! it owns the backend's HTTP client, runs the snapshot reconciliation
//! loop, and drives the event stream supervisor. It never stores session
//! records itself; every observation flows into the registry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{BackendClient, PermissionDecision, SendReceipt};
use crate::config::Config;
use crate::model::SessionSummary;
use crate::protocol::AnnouncePacket;
use crate::registry::{Registry, RemovalReason};
use crate::supervisor::{EventStreamSupervisor, StreamState};
use crate::Result;

/// One discovered backend with its client, refresher, and stream
/// supervisor.
pub struct ServerSession {
    server_id: String,
    url: String,
    client: Arc<BackendClient>,
    registry: Arc<Registry>,
    supervisor: Arc<EventStreamSupervisor>,
    refresh_interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerSession {
    /// Create the session for an announced backend and start its tasks:
    /// an initial snapshot reconciliation, then the event stream
    /// supervisor, then the periodic refresher.
    pub fn spawn(
        packet: &AnnouncePacket,
        registry: Arc<Registry>,
        config: &Config,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let client = Arc::new(BackendClient::new(
            &packet.server_url,
            config.aggregator.request_timeout,
        )?);
        let supervisor = Arc::new(EventStreamSupervisor::new(
            packet.server_id.clone(),
            Arc::clone(&client),
            Arc::clone(&registry),
            config.stream.clone(),
        ));

        let session = Arc::new(Self {
            server_id: packet.server_id.clone(),
            url: packet.server_url.clone(),
            client,
            registry,
            supervisor,
            refresh_interval: config.aggregator.session_refresh_interval,
            cancel: parent.child_token(),
            tasks: Mutex::new(Vec::new()),
        });

        let main_task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run().await })
        };
        session.tasks.lock().push(main_task);

        info!(server = %session.server_id, url = %session.url, "Server session started");
        Ok(session)
    }

    /// Backend id this session tracks.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Normalized URL the client talks to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connection state of the event stream supervisor.
    #[must_use]
    pub fn stream_state(&self) -> StreamState {
        self.supervisor.state()
    }

    async fn run(self: Arc<Self>) {
        // Initial reconciliation completes before the event stream opens,
        // so status events always find their sessions in the registry.
        self.reconcile().await;
        if self.cancel.is_cancelled() {
            return;
        }

        let supervisor_task = {
            let supervisor = Arc::clone(&self.supervisor);
            let cancel = self.cancel.child_token();
            tokio::spawn(async move { supervisor.run(cancel).await })
        };
        self.tasks.lock().push(supervisor_task);

        let mut interval = tokio::time::interval_at(
            Instant::now() + self.refresh_interval,
            self.refresh_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = interval.tick() => self.reconcile().await,
            }
        }
    }

    /// One snapshot pass: list sessions, merge in their runtime statuses,
    /// and hand the complete set to the registry. Failures flip the
    /// server's health flag; the next tick tries again.
    async fn reconcile(&self) {
        match self.fetch_snapshot().await {
            Ok(summaries) => {
                self.registry.absorb_snapshot(&self.server_id, summaries);
                self.registry.set_server_health(&self.server_id, true);
            }
            Err(e) => {
                warn!(server = %self.server_id, error = %e, "Snapshot failed");
                self.registry.set_server_health(&self.server_id, false);
            }
        }
    }

    async fn fetch_snapshot(&self) -> Result<Vec<SessionSummary>> {
        let mut sessions = self.client.list_sessions().await?;
        let statuses = self.client.session_statuses().await?;
        for session in &mut sessions {
            if let Some(status) = statuses.get(&session.id) {
                session.status = *status;
            }
        }
        Ok(sessions)
    }

    /// Fetch one session in full and hand it to the registry.
    pub async fn refresh_session(&self, session_id: &str) -> Result<()> {
        let detail = self.client.get_session(session_id).await?;
        self.registry.absorb_session_detail(&self.server_id, detail);
        Ok(())
    }

    /// Send a message, then refresh the session so the observable state
    /// reflects the command without waiting for the next tick.
    pub async fn send_message(&self, session_id: &str, content: &str) -> Result<SendReceipt> {
        let receipt = self.client.send_message(session_id, content).await?;
        self.post_command_refresh(session_id).await;
        Ok(receipt)
    }

    /// Abort the session's current turn, then refresh it.
    pub async fn abort(&self, session_id: &str) -> Result<()> {
        self.client.abort(session_id).await?;
        self.post_command_refresh(session_id).await;
        Ok(())
    }

    /// Resolve a permission prompt, then refresh the session.
    pub async fn resolve_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        decision: PermissionDecision,
    ) -> Result<()> {
        self.client
            .resolve_permission(session_id, permission_id, decision)
            .await?;
        self.post_command_refresh(session_id).await;
        Ok(())
    }

    async fn post_command_refresh(&self, session_id: &str) {
        if let Err(e) = self.refresh_session(session_id).await {
            debug!(
                server = %self.server_id,
                session = %session_id,
                error = %e,
                "Post-command refresh failed"
            );
        }
    }

    /// Cancel this session's tasks and wait for them to finish. The
    /// registry is left untouched.
    pub async fn halt(&self) {
        self.cancel.cancel();
        loop {
            let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    /// Orderly teardown: tasks stop first, then the registry removes the
    /// server, cascading to its sessions.
    pub async fn shutdown(&self, reason: RemovalReason) {
        self.halt().await;
        self.registry.absorb_shutdown(&self.server_id, reason);
    }
}
