//! Canonical in-memory state store
//!
//! The registry exclusively owns every server, session, and message record.
//! All mutations pass through a single write lock, and change notifications
//! are published on a broadcast channel while that lock is held, so
//! subscribers observe notifications in exactly the order mutations
//! committed. No I/O ever happens under the lock.
//!
//! Invariants enforced here and nowhere else:
//! - every session's `server_id` refers to a present server,
//! - `last_activity >= created_at` (violations are clamped),
//! - parent links are acyclic and never self-referential (violations are
//!   dropped with a log entry, the rest of the mutation applies),
//! - messages are timestamp-ascending and unique by id (re-insertion
//!   replaces in place),
//! - a terminal status is never replaced by a non-terminal one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::model::{BackendEvent, Message, Server, Session, SessionStatus, SessionSummary};
use crate::protocol::AnnouncePacket;

/// Why a server left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalReason {
    /// The backend sent a shutdown datagram
    Shutdown,
    /// No announcement arrived within the stale timeout
    Stale,
}

impl RemovalReason {
    /// Stable string form for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::Stale => "stale",
        }
    }
}

/// One change notification fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A server appeared
    ServerDiscovered {
        /// The new server record
        server: Server,
    },
    /// A server's observable fields changed
    ServerUpdated {
        /// The updated server record
        server: Server,
    },
    /// A server left, cascading its sessions
    ServerRemoved {
        /// Removed server id
        server_id: String,
        /// Shutdown datagram or staleness
        reason: RemovalReason,
    },
    /// A session appeared
    SessionAdded {
        /// The new session record
        session: Session,
    },
    /// A session's observable fields changed
    SessionUpdated {
        /// The updated session record
        session: Session,
    },
    /// A session left
    SessionRemoved {
        /// Removed session id
        session_id: String,
        /// Server that hosted it
        server_id: String,
    },
    /// A non-recoverable failure presenters should surface
    AggregatorError {
        /// Server the failure belongs to, when attributable
        server_id: Option<String>,
        /// Human-readable description
        message: String,
    },
    /// The subscriber fell behind and `count` notifications were dropped;
    /// consumers must re-snapshot via the query API
    BacklogDropped {
        /// How many notifications were lost
        count: u64,
    },
}

impl Notification {
    fn server_id(&self) -> Option<&str> {
        match self {
            Self::ServerDiscovered { server } | Self::ServerUpdated { server } => Some(&server.id),
            Self::ServerRemoved { server_id, .. } | Self::SessionRemoved { server_id, .. } => {
                Some(server_id)
            }
            Self::SessionAdded { session } | Self::SessionUpdated { session } => {
                Some(&session.server_id)
            }
            Self::AggregatorError { server_id, .. } => server_id.as_deref(),
            Self::BacklogDropped { .. } => None,
        }
    }
}

/// Subscriber-side filter.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only pass notifications attributable to this server. Notifications
    /// without a server attribution (backlog markers, global errors)
    /// always pass.
    pub server_id: Option<String>,
}

impl EventFilter {
    fn matches(&self, notification: &Notification) -> bool {
        match (&self.server_id, notification.server_id()) {
            (Some(want), Some(got)) => want == got,
            _ => true,
        }
    }
}

/// Handle for one registered subscriber.
///
/// Dropping the handle unsubscribes. A subscriber that consumes slower
/// than the registry produces loses the oldest pending notifications and
/// observes a single [`Notification::BacklogDropped`] in their place.
pub struct Subscription {
    id: u64,
    rx: broadcast::Receiver<Notification>,
    filter: EventFilter,
}

impl Subscription {
    /// Subscriber identity.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next notification; `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(n) => {
                    if self.filter.matches(&n) {
                        return Some(n);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Some(Notification::BacklogDropped { count });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`] for polling
    /// presenters; `None` when no notification is pending.
    pub fn try_recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.try_recv() {
                Ok(n) => {
                    if self.filter.matches(&n) {
                        return Some(n);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    return Some(Notification::BacklogDropped { count });
                }
                Err(_) => return None,
            }
        }
    }
}

/// Aggregate counters for presenter status bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Known servers
    pub servers: usize,
    /// Known sessions
    pub sessions: usize,
    /// Sessions in a non-terminal status
    pub active_sessions: usize,
}

#[derive(Default)]
struct Inner {
    servers: HashMap<String, Server>,
    sessions: HashMap<String, Session>,
}

/// The canonical state store.
pub struct Registry {
    inner: RwLock<Inner>,
    events: broadcast::Sender<Notification>,
    subscriber_seq: AtomicU64,
}

impl Registry {
    /// Create an empty registry whose subscribers buffer up to
    /// `notification_buffer` pending notifications each.
    #[must_use]
    pub fn new(notification_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(notification_buffer.max(1));
        Self {
            inner: RwLock::new(Inner::default()),
            events,
            subscriber_seq: AtomicU64::new(1),
        }
    }

    // -- mutations ---------------------------------------------------------

    /// Upsert a server from an announcement.
    pub fn absorb_announce(&self, packet: &AnnouncePacket) {
        let now = Utc::now();
        let mut inner = self.inner.write();

        if let Some(server) = inner.servers.get_mut(&packet.server_id) {
            let changed = server.url != packet.server_url
                || server.name != packet.server_name
                || server.project != packet.project
                || server.branch != packet.branch
                || server.version != packet.version;

            server.url = packet.server_url.clone();
            server.name = packet.server_name.clone();
            server.project = packet.project.clone();
            server.branch = packet.branch.clone();
            server.version = packet.version.clone();
            server.last_announced = now;

            if changed {
                let snapshot = server.clone();
                self.publish(Notification::ServerUpdated { server: snapshot });
            }
        } else {
            let server = Server {
                id: packet.server_id.clone(),
                url: packet.server_url.clone(),
                name: packet.server_name.clone(),
                project: packet.project.clone(),
                branch: packet.branch.clone(),
                version: packet.version.clone(),
                last_announced: now,
                healthy: true,
                session_ids: std::collections::BTreeSet::new(),
            };
            info!(server = %server.id, url = %server.url, "Server discovered");
            inner.servers.insert(server.id.clone(), server.clone());
            self.publish(Notification::ServerDiscovered { server });
        }
    }

    /// Remove a server and cascade-remove its sessions.
    ///
    /// Session removals are emitted first (in id order), then the server
    /// removal.
    pub fn absorb_shutdown(&self, server_id: &str, reason: RemovalReason) {
        let mut inner = self.inner.write();

        let Some(server) = inner.servers.remove(server_id) else {
            debug!(server = %server_id, "Shutdown for unknown server ignored");
            return;
        };

        for session_id in &server.session_ids {
            if let Some(session) = inner.sessions.remove(session_id) {
                unlink_parent(&mut inner, &session);
                self.publish(Notification::SessionRemoved {
                    session_id: session.id,
                    server_id: server_id.to_string(),
                });
            }
        }

        info!(server = %server_id, reason = reason.as_str(), "Server removed");
        self.publish(Notification::ServerRemoved {
            server_id: server_id.to_string(),
            reason,
        });
    }

    /// Reconcile the full session set for one server against a snapshot.
    ///
    /// Sessions present in the snapshot are inserted or merged; stored
    /// sessions the snapshot omits are removed. `SessionUpdated` is only
    /// emitted when an observable field actually changed, so re-absorbing
    /// an identical snapshot emits nothing.
    pub fn absorb_snapshot(&self, server_id: &str, summaries: Vec<SessionSummary>) {
        let mut inner = self.inner.write();

        if !inner.servers.contains_key(server_id) {
            warn!(server = %server_id, "Snapshot for unknown server dropped");
            return;
        }

        let mut seen: Vec<String> = Vec::with_capacity(summaries.len());
        for summary in summaries {
            seen.push(summary.id.clone());
            self.apply_summary(&mut inner, server_id, summary);
        }

        let stored: Vec<String> = inner
            .servers
            .get(server_id)
            .map(|s| s.session_ids.iter().cloned().collect())
            .unwrap_or_default();
        for session_id in stored {
            if !seen.contains(&session_id) {
                self.remove_session(&mut inner, &session_id);
            }
        }
    }

    /// Absorb a full session detail (messages included).
    pub fn absorb_session_detail(&self, server_id: &str, detail: SessionSummary) {
        let mut inner = self.inner.write();

        if !inner.servers.contains_key(server_id) {
            warn!(server = %server_id, session = %detail.id, "Detail for unknown server dropped");
            return;
        }

        self.apply_summary(&mut inner, server_id, detail);
    }

    /// Apply one decoded stream event.
    ///
    /// Events referencing sessions the registry does not know yet are
    /// dropped; the next snapshot introduces the session and subsequent
    /// events apply normally.
    pub fn absorb_event(&self, server_id: &str, event: BackendEvent) {
        let mut inner = self.inner.write();

        let session_id = event.session_id().to_string();
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            debug!(server = %server_id, session = %session_id, "Event for unknown session dropped");
            return;
        };
        if session.server_id != server_id {
            warn!(
                server = %server_id,
                session = %session_id,
                owner = %session.server_id,
                "Event from non-owning server dropped"
            );
            return;
        }

        let before = session.clone();
        match event {
            BackendEvent::SessionUpdate {
                status,
                observed_at,
                ..
            } => {
                apply_status(session, status);
                session.last_activity = observed_at.max(session.created_at);
            }
            BackendEvent::MessageArrived { message, .. } => {
                let activity = message.timestamp;
                insert_message(session, message);
                session.last_activity =
                    session.last_activity.max(activity).max(session.created_at);
            }
            BackendEvent::PermissionRequested { .. } => {
                apply_status(session, SessionStatus::WaitingForPermission);
            }
        }

        if *session != before {
            let snapshot = session.clone();
            self.publish(Notification::SessionUpdated { session: snapshot });
        }
    }

    /// Flip a server's health flag.
    pub fn set_server_health(&self, server_id: &str, healthy: bool) {
        let mut inner = self.inner.write();
        if let Some(server) = inner.servers.get_mut(server_id) {
            if server.healthy != healthy {
                server.healthy = healthy;
                if healthy {
                    info!(server = %server_id, "Server recovered");
                } else {
                    warn!(server = %server_id, "Server marked unhealthy");
                }
                let snapshot = server.clone();
                self.publish(Notification::ServerUpdated { server: snapshot });
            }
        }
    }

    /// Surface a non-recoverable failure to subscribers.
    pub fn notify_error(&self, server_id: Option<&str>, message: impl Into<String>) {
        self.publish(Notification::AggregatorError {
            server_id: server_id.map(str::to_string),
            message: message.into(),
        });
    }

    /// Drop every record. Used during orderly shutdown, after all server
    /// sessions have been cancelled.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.servers.clear();
        inner.sessions.clear();
    }

    // -- queries -----------------------------------------------------------

    /// All servers, ordered by id.
    #[must_use]
    pub fn servers(&self) -> Vec<Server> {
        let inner = self.inner.read();
        let mut servers: Vec<Server> = inner.servers.values().cloned().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    /// One server.
    #[must_use]
    pub fn server(&self, server_id: &str) -> Option<Server> {
        self.inner.read().servers.get(server_id).cloned()
    }

    /// All sessions, ordered by id.
    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        let inner = self.inner.read();
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// One session.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.inner.read().sessions.get(session_id).cloned()
    }

    /// Sessions hosted by one server, ordered by id.
    #[must_use]
    pub fn sessions_for_server(&self, server_id: &str) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .read()
            .sessions
            .values()
            .filter(|s| s.server_id == server_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Sessions in a non-terminal status.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .read()
            .sessions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Sessions flagged long-running or alive longer than `threshold`.
    #[must_use]
    pub fn long_running_sessions(&self, threshold: Duration) -> Vec<Session> {
        let now = Utc::now();
        let mut sessions: Vec<Session> = self
            .inner
            .read()
            .sessions
            .values()
            .filter(|s| s.is_long_running(now, threshold))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let inner = self.inner.read();
        Stats {
            servers: inner.servers.len(),
            sessions: inner.sessions.len(),
            active_sessions: inner.sessions.values().filter(|s| s.is_active()).count(),
        }
    }

    // -- subscriptions -----------------------------------------------------

    /// Register a change-notification subscriber.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        let id = self.subscriber_seq.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = id, "Subscriber registered");
        Subscription {
            id,
            rx: self.events.subscribe(),
            filter: filter.unwrap_or_default(),
        }
    }

    // -- internals ---------------------------------------------------------

    fn publish(&self, notification: Notification) {
        // Sent while the caller holds the write lock: commit order and
        // notification order are the same by construction.
        let _ = self.events.send(notification);
    }

    fn apply_summary(&self, inner: &mut Inner, server_id: &str, summary: SessionSummary) {
        if let Some(prev) = inner.sessions.get(&summary.id).cloned() {
            let mut next = prev.clone();

            if prev.server_id != server_id {
                // Same session id reported by two servers: the latest
                // writer wins and takes ownership.
                warn!(
                    session = %summary.id,
                    old = %prev.server_id,
                    new = %server_id,
                    "Session re-homed to another server"
                );
                if let Some(old) = inner.servers.get_mut(&prev.server_id) {
                    old.session_ids.remove(&summary.id);
                }
                if let Some(new) = inner.servers.get_mut(server_id) {
                    new.session_ids.insert(summary.id.clone());
                }
                next.server_id = server_id.to_string();
            }

            if let Some(name) = summary.name {
                next.name = name;
            }
            apply_status(&mut next, summary.status);
            next.created_at = summary.created_at.min(summary.last_activity);
            next.last_activity = summary.last_activity.max(next.created_at);
            next.long_running = summary.long_running;
            next.project = summary.project;
            next.branch = summary.branch;
            next.cost = summary.cost;
            next.tokens = summary.tokens;
            if let Some(messages) = summary.messages {
                next.messages = messages;
            }

            next.parent_id = match summary.parent_id {
                Some(parent_id)
                    if parent_id == next.id || creates_cycle(inner, &next.id, &parent_id) =>
                {
                    warn!(
                        session = %next.id,
                        parent = %parent_id,
                        "Rejected parent link that would form a cycle"
                    );
                    prev.parent_id.clone()
                }
                other => other,
            };

            if next != prev {
                relink_parent(inner, &prev, &next);
                let snapshot = next.clone();
                inner.sessions.insert(next.id.clone(), next);
                self.publish(Notification::SessionUpdated { session: snapshot });
            }
        } else {
            let parent_id = match summary.parent_id {
                Some(parent_id)
                    if parent_id == summary.id || creates_cycle(inner, &summary.id, &parent_id) =>
                {
                    warn!(
                        session = %summary.id,
                        parent = %parent_id,
                        "Rejected parent link that would form a cycle"
                    );
                    None
                }
                other => other,
            };

            let session = Session {
                id: summary.id.clone(),
                server_id: server_id.to_string(),
                name: summary.name.unwrap_or_else(|| summary.id.clone()),
                status: summary.status,
                created_at: summary.created_at.min(summary.last_activity),
                last_activity: summary.last_activity.max(summary.created_at),
                long_running: summary.long_running,
                parent_id,
                child_ids: std::collections::BTreeSet::new(),
                project: summary.project,
                branch: summary.branch,
                cost: summary.cost,
                tokens: summary.tokens,
                messages: summary.messages.unwrap_or_default(),
            };

            if let Some(server) = inner.servers.get_mut(server_id) {
                server.session_ids.insert(session.id.clone());
            }
            if let Some(parent_id) = session.parent_id.clone() {
                if let Some(parent) = inner.sessions.get_mut(&parent_id) {
                    parent.child_ids.insert(session.id.clone());
                }
            }

            debug!(server = %server_id, session = %session.id, "Session added");
            inner.sessions.insert(session.id.clone(), session.clone());
            self.publish(Notification::SessionAdded { session });
        }
    }

    fn remove_session(&self, inner: &mut Inner, session_id: &str) {
        if let Some(session) = inner.sessions.remove(session_id) {
            if let Some(server) = inner.servers.get_mut(&session.server_id) {
                server.session_ids.remove(session_id);
            }
            unlink_parent(inner, &session);
            debug!(server = %session.server_id, session = %session_id, "Session removed");
            self.publish(Notification::SessionRemoved {
                session_id: session.id,
                server_id: session.server_id,
            });
        }
    }
}

/// Set a status while honoring the terminal latch: a terminal status is
/// only ever replaced by another terminal status.
fn apply_status(session: &mut Session, status: SessionStatus) {
    if status.is_terminal() || !session.status.is_terminal() {
        session.status = status;
    } else {
        debug!(
            session = %session.id,
            current = ?session.status,
            requested = ?status,
            "Ignoring transition out of terminal status"
        );
    }
}

/// Insert a message keeping timestamp order; an existing id is replaced in
/// place, preserving its position.
fn insert_message(session: &mut Session, message: Message) {
    if let Some(pos) = session.messages.iter().position(|m| m.id == message.id) {
        if session.messages[pos] != message {
            session.messages[pos] = message;
        }
    } else {
        let pos = session
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        session.messages.insert(pos, message);
    }
}

fn creates_cycle(inner: &Inner, session_id: &str, parent_id: &str) -> bool {
    let mut current = Some(parent_id.to_string());
    let mut hops = 0usize;
    while let Some(id) = current {
        if id == session_id {
            return true;
        }
        hops += 1;
        if hops > inner.sessions.len() {
            return true;
        }
        current = inner.sessions.get(&id).and_then(|s| s.parent_id.clone());
    }
    false
}

fn unlink_parent(inner: &mut Inner, session: &Session) {
    if let Some(parent_id) = &session.parent_id {
        if let Some(parent) = inner.sessions.get_mut(parent_id) {
            parent.child_ids.remove(&session.id);
        }
    }
}

fn relink_parent(inner: &mut Inner, prev: &Session, next: &Session) {
    if prev.parent_id == next.parent_id {
        return;
    }
    if let Some(old) = &prev.parent_id {
        if let Some(parent) = inner.sessions.get_mut(old) {
            parent.child_ids.remove(&prev.id);
        }
    }
    if let Some(new) = &next.parent_id {
        if let Some(parent) = inner.sessions.get_mut(new) {
            parent.child_ids.insert(next.id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::{MessageKind, MessageMeta, Role};

    fn announce(server_id: &str) -> AnnouncePacket {
        AnnouncePacket {
            server_id: server_id.to_string(),
            server_url: format!("http://localhost:9000/{server_id}"),
            server_name: server_id.to_string(),
            project: None,
            branch: None,
            version: None,
            timestamp: 1000,
        }
    }

    fn summary(id: &str, status: SessionStatus) -> SessionSummary {
        let base = Utc::now() - TimeDelta::seconds(60);
        SessionSummary {
            id: id.to_string(),
            name: Some(id.to_string()),
            status,
            created_at: base,
            last_activity: base + TimeDelta::seconds(30),
            long_running: false,
            parent_id: None,
            project: None,
            branch: None,
            cost: None,
            tokens: None,
            messages: None,
        }
    }

    fn message(id: &str, session_id: &str, offset_ms: i64) -> Message {
        Message {
            id: id.to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now() + TimeDelta::milliseconds(offset_ms),
            role: Role::Assistant,
            kind: MessageKind::AssistantResponse,
            content: format!("m-{id}"),
            parts: Vec::new(),
            meta: MessageMeta::default(),
        }
    }

    fn drain(sub: &mut Subscription) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Some(n) = sub.try_recv() {
            out.push(n);
        }
        out
    }

    #[test]
    fn duplicate_announce_emits_discovered_then_nothing() {
        let registry = Registry::new(64);
        let mut sub = registry.subscribe(None);

        registry.absorb_announce(&announce("A"));
        registry.absorb_announce(&announce("A"));

        let events = drain(&mut sub);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Notification::ServerDiscovered { .. }));
    }

    #[test]
    fn changed_announce_emits_one_update() {
        let registry = Registry::new(64);
        let mut sub = registry.subscribe(None);

        registry.absorb_announce(&announce("A"));
        let mut changed = announce("A");
        changed.server_name = "renamed".into();
        registry.absorb_announce(&changed);
        registry.absorb_announce(&changed);

        let events = drain(&mut sub);
        assert_eq!(events.len(), 2);
        assert!(
            matches!(events[1], Notification::ServerUpdated { ref server } if server.name == "renamed")
        );
    }

    #[test]
    fn snapshot_inserts_and_is_idempotent() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("A"));
        let mut sub = registry.subscribe(None);

        let snap = vec![
            summary("x", SessionStatus::Idle),
            summary("y", SessionStatus::Busy),
        ];
        registry.absorb_snapshot("A", snap.clone());

        let events = drain(&mut sub);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Notification::SessionAdded { ref session } if session.id == "x"));
        assert!(matches!(events[1], Notification::SessionAdded { ref session } if session.id == "y"));

        // Re-absorbing the identical snapshot emits nothing.
        registry.absorb_snapshot("A", snap);
        assert!(drain(&mut sub).is_empty());
    }

    #[test]
    fn snapshot_removes_omitted_sessions() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("A"));
        registry.absorb_snapshot(
            "A",
            vec![
                summary("x", SessionStatus::Idle),
                summary("y", SessionStatus::Idle),
            ],
        );

        let mut sub = registry.subscribe(None);
        registry.absorb_snapshot("A", vec![summary("x", SessionStatus::Idle)]);

        let events = drain(&mut sub);
        assert_eq!(
            events,
            vec![Notification::SessionRemoved {
                session_id: "y".into(),
                server_id: "A".into(),
            }]
        );
        assert!(registry.session("y").is_none());
        assert_eq!(registry.server("A").unwrap().session_ids.len(), 1);
    }

    #[test]
    fn shutdown_cascades_sessions_before_server() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("A"));
        registry.absorb_snapshot(
            "A",
            vec![
                summary("x", SessionStatus::Busy),
                summary("y", SessionStatus::Idle),
            ],
        );

        let mut sub = registry.subscribe(None);
        registry.absorb_shutdown("A", RemovalReason::Shutdown);

        let events = drain(&mut sub);
        assert_eq!(
            events,
            vec![
                Notification::SessionRemoved {
                    session_id: "x".into(),
                    server_id: "A".into(),
                },
                Notification::SessionRemoved {
                    session_id: "y".into(),
                    server_id: "A".into(),
                },
                Notification::ServerRemoved {
                    server_id: "A".into(),
                    reason: RemovalReason::Shutdown,
                },
            ]
        );
        assert!(registry.servers().is_empty());
        assert!(registry.sessions().is_empty());
    }

    #[test]
    fn event_before_snapshot_is_dropped() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("B"));
        let mut sub = registry.subscribe(None);

        registry.absorb_event(
            "B",
            BackendEvent::SessionUpdate {
                session_id: "s1".into(),
                status: SessionStatus::Busy,
                observed_at: Utc::now(),
            },
        );
        assert!(drain(&mut sub).is_empty());
        assert!(registry.session("s1").is_none());

        registry.absorb_snapshot("B", vec![summary("s1", SessionStatus::Idle)]);
        assert_eq!(registry.session("s1").unwrap().status, SessionStatus::Idle);

        registry.absorb_event(
            "B",
            BackendEvent::SessionUpdate {
                session_id: "s1".into(),
                status: SessionStatus::Busy,
                observed_at: Utc::now(),
            },
        );
        assert_eq!(registry.session("s1").unwrap().status, SessionStatus::Busy);
    }

    #[test]
    fn terminal_status_latches() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("C"));
        registry.absorb_snapshot("C", vec![summary("s2", SessionStatus::Busy)]);

        // Drift correction: the stream missed the completion, the next
        // snapshot reports it.
        registry.absorb_snapshot("C", vec![summary("s2", SessionStatus::Completed)]);
        assert_eq!(
            registry.session("s2").unwrap().status,
            SessionStatus::Completed
        );

        // Neither events nor snapshots may leave the terminal status.
        registry.absorb_event(
            "C",
            BackendEvent::SessionUpdate {
                session_id: "s2".into(),
                status: SessionStatus::Busy,
                observed_at: Utc::now(),
            },
        );
        assert_eq!(
            registry.session("s2").unwrap().status,
            SessionStatus::Completed
        );

        registry.absorb_snapshot("C", vec![summary("s2", SessionStatus::Idle)]);
        assert_eq!(
            registry.session("s2").unwrap().status,
            SessionStatus::Completed
        );

        // Terminal-to-terminal is allowed.
        registry.absorb_snapshot("C", vec![summary("s2", SessionStatus::Aborted)]);
        assert_eq!(
            registry.session("s2").unwrap().status,
            SessionStatus::Aborted
        );
    }

    #[test]
    fn permission_event_sets_waiting_status() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("A"));
        registry.absorb_snapshot("A", vec![summary("s1", SessionStatus::Busy)]);

        registry.absorb_event(
            "A",
            BackendEvent::PermissionRequested {
                session_id: "s1".into(),
                permission_id: "p1".into(),
                tool_name: Some("bash".into()),
                description: None,
            },
        );
        assert_eq!(
            registry.session("s1").unwrap().status,
            SessionStatus::WaitingForPermission
        );
    }

    #[test]
    fn messages_stay_ordered_and_unique() {
        let registry = Registry::new(256);
        registry.absorb_announce(&announce("A"));
        registry.absorb_snapshot("A", vec![summary("s1", SessionStatus::Busy)]);

        let m2 = message("m2", "s1", 200);
        let m1 = message("m1", "s1", 100);
        let m3 = message("m3", "s1", 300);

        for m in [m2.clone(), m1.clone(), m3.clone()] {
            registry.absorb_event(
                "A",
                BackendEvent::MessageArrived {
                    session_id: "s1".into(),
                    message: m,
                },
            );
        }

        let ids: Vec<String> = registry
            .session("s1")
            .unwrap()
            .messages
            .iter()
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        // Replacing an existing id keeps its position and count.
        let mut replacement = m2;
        replacement.content = "filled in".into();
        registry.absorb_event(
            "A",
            BackendEvent::MessageArrived {
                session_id: "s1".into(),
                message: replacement,
            },
        );
        let session = registry.session("s1").unwrap();
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.messages[1].content, "filled in");
    }

    #[test]
    fn activity_is_clamped_to_creation() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("A"));
        registry.absorb_snapshot("A", vec![summary("s1", SessionStatus::Idle)]);
        let created = registry.session("s1").unwrap().created_at;

        registry.absorb_event(
            "A",
            BackendEvent::SessionUpdate {
                session_id: "s1".into(),
                status: SessionStatus::Busy,
                observed_at: created - TimeDelta::seconds(3600),
            },
        );

        let session = registry.session("s1").unwrap();
        assert_eq!(session.last_activity, session.created_at);
    }

    #[test]
    fn self_parent_is_rejected() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("A"));
        let mut s = summary("s1", SessionStatus::Idle);
        s.parent_id = Some("s1".into());
        registry.absorb_snapshot("A", vec![s]);

        assert_eq!(registry.session("s1").unwrap().parent_id, None);
    }

    #[test]
    fn parent_cycle_is_rejected_but_rest_applies() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("A"));

        let mut child = summary("child", SessionStatus::Idle);
        child.parent_id = Some("root".into());
        registry.absorb_snapshot("A", vec![summary("root", SessionStatus::Idle), child]);
        assert_eq!(
            registry.session("root").unwrap().child_ids,
            ["child".to_string()].into_iter().collect()
        );

        // root -> child would close the loop; the parent link is dropped,
        // the status change still lands.
        let mut looped = summary("root", SessionStatus::Busy);
        looped.parent_id = Some("child".into());
        registry.absorb_snapshot(
            "A",
            vec![looped, {
                let mut c = summary("child", SessionStatus::Idle);
                c.parent_id = Some("root".into());
                c
            }],
        );

        let root = registry.session("root").unwrap();
        assert_eq!(root.parent_id, None);
        assert_eq!(root.status, SessionStatus::Busy);
    }

    #[test]
    fn detail_replaces_messages() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("A"));
        registry.absorb_snapshot("A", vec![summary("s1", SessionStatus::Busy)]);
        registry.absorb_event(
            "A",
            BackendEvent::MessageArrived {
                session_id: "s1".into(),
                message: message("m1", "s1", 0),
            },
        );

        let mut detail = summary("s1", SessionStatus::Busy);
        detail.messages = Some(vec![message("m1", "s1", 0), message("m2", "s1", 50)]);
        registry.absorb_session_detail("A", detail);

        assert_eq!(registry.session("s1").unwrap().messages.len(), 2);

        // A later snapshot without messages preserves them.
        registry.absorb_snapshot("A", vec![summary("s1", SessionStatus::Busy)]);
        assert_eq!(registry.session("s1").unwrap().messages.len(), 2);
    }

    #[test]
    fn health_flip_emits_update_once() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("A"));
        let mut sub = registry.subscribe(None);

        registry.set_server_health("A", false);
        registry.set_server_health("A", false);
        registry.set_server_health("A", true);

        let events = drain(&mut sub);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Notification::ServerUpdated { ref server } if !server.healthy));
        assert!(matches!(events[1], Notification::ServerUpdated { ref server } if server.healthy));
    }

    #[test]
    fn every_session_references_a_present_server() {
        let registry = Registry::new(64);
        // No announce: the snapshot has nowhere to attach.
        registry.absorb_snapshot("ghost", vec![summary("s1", SessionStatus::Idle)]);
        assert!(registry.sessions().is_empty());

        registry.absorb_announce(&announce("A"));
        registry.absorb_snapshot("A", vec![summary("s1", SessionStatus::Idle)]);
        for session in registry.sessions() {
            assert!(registry.server(&session.server_id).is_some());
        }
    }

    #[test]
    fn slow_subscriber_observes_backlog_marker() {
        let registry = Registry::new(2);
        let mut sub = registry.subscribe(None);

        for i in 0..5 {
            registry.absorb_announce(&announce(&format!("srv-{i}")));
        }

        match sub.try_recv() {
            Some(Notification::BacklogDropped { count }) => assert_eq!(count, 3),
            other => panic!("expected backlog marker, got {other:?}"),
        }
        // The notifications still buffered are delivered after the marker.
        assert!(sub.try_recv().is_some());
    }

    #[test]
    fn filter_passes_only_matching_servers() {
        let registry = Registry::new(64);
        let mut sub = registry.subscribe(Some(EventFilter {
            server_id: Some("A".into()),
        }));

        registry.absorb_announce(&announce("A"));
        registry.absorb_announce(&announce("B"));

        let events = drain(&mut sub);
        assert_eq!(events.len(), 1);
        assert!(
            matches!(events[0], Notification::ServerDiscovered { ref server } if server.id == "A")
        );
    }

    #[test]
    fn stats_count_active_sessions() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("A"));
        registry.absorb_snapshot(
            "A",
            vec![
                summary("s1", SessionStatus::Busy),
                summary("s2", SessionStatus::Completed),
            ],
        );

        let stats = registry.stats();
        assert_eq!(stats.servers, 1);
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.active_sessions, 1);
    }

    #[test]
    fn long_running_by_flag_or_age() {
        let registry = Registry::new(64);
        registry.absorb_announce(&announce("A"));

        let mut flagged = summary("flagged", SessionStatus::Busy);
        flagged.long_running = true;
        let mut old = summary("old", SessionStatus::Busy);
        old.created_at = Utc::now() - TimeDelta::hours(2);
        registry.absorb_snapshot(
            "A",
            vec![flagged, old, summary("young", SessionStatus::Busy)],
        );

        let ids: Vec<String> = registry
            .long_running_sessions(Duration::from_secs(600))
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["flagged", "old"]);
    }
}
