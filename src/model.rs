//! Domain model shared by every component: servers, sessions, messages and
//! the internal update events decoded from backend streams.
//!
//! These records are owned exclusively by the registry; everything else
//! holds ids and observes clones.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Runtime status of a session.
///
/// Closed set; the terminal subset is `{Completed, Error, Aborted}` and a
/// session never leaves a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No turn in flight
    Idle,
    /// Assistant is working
    Busy,
    /// Blocked on a permission prompt
    WaitingForPermission,
    /// Finished normally
    Completed,
    /// Finished with an error
    Error,
    /// Aborted by the user
    Aborted,
}

impl SessionStatus {
    /// Whether the status is terminal. Terminal sessions never transition
    /// back to a non-terminal status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Aborted)
    }

    /// Map a backend status tag onto the closed internal set.
    ///
    /// Unknown tags map to `Idle`.
    #[must_use]
    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "running" | "busy" => Self::Busy,
            "pending" => Self::WaitingForPermission,
            "completed" => Self::Completed,
            "error" => Self::Error,
            "aborted" => Self::Aborted,
            _ => Self::Idle,
        }
    }
}

/// Author of a message turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Human operator
    User,
    /// The assistant
    Assistant,
    /// Backend-generated
    System,
}

impl Role {
    /// Map a wire role string; unknown roles count as system output.
    #[must_use]
    pub fn from_wire(role: &str) -> Self {
        match role {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            _ => Self::System,
        }
    }
}

/// Semantic type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Operator input
    UserInput,
    /// Assistant reply
    AssistantResponse,
    /// A tool ran
    ToolExecution,
    /// Backend asked for permission
    PermissionRequest,
    /// Informational backend message
    SystemMessage,
    /// Backend error surfaced in the conversation
    ErrorMessage,
}

impl MessageKind {
    /// Default kind for a role when the wire carries none.
    #[must_use]
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::User => Self::UserInput,
            Role::Assistant => Self::AssistantResponse,
            Role::System => Self::SystemMessage,
        }
    }
}

/// Execution state of a tool invocation part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Queued, not started
    Pending,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Error,
}

/// One structured part of a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    /// Plain text
    Text {
        /// The text content
        text: String,
    },
    /// Assistant reasoning
    Reasoning {
        /// The reasoning content
        text: String,
    },
    /// A tool invocation with its lifecycle state and I/O
    Tool {
        /// Tool name
        name: String,
        /// Invocation state
        status: ToolStatus,
        /// Short human title, if the backend provides one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Tool input
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
        /// Tool output
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    /// A reasoning/tool step opened
    StepStart,
    /// A reasoning/tool step closed
    StepFinish,
    /// A file patch
    Patch {
        /// Files touched by the patch
        #[serde(default)]
        files: Vec<String>,
    },
    /// A sub-agent turn
    Agent {
        /// Agent name
        name: String,
    },
    /// Part kind this monitor does not know; kept so decoding never fails
    #[serde(other)]
    Unknown,
}

/// Token counters reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens
    #[serde(default)]
    pub input: u64,
    /// Output tokens
    #[serde(default)]
    pub output: u64,
}

/// Optional metadata attached to a message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageMeta {
    /// Cost in account currency
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Token counters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    /// Tool name, for tool executions
    #[serde(alias = "toolName", skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Tool arguments, for tool executions
    #[serde(alias = "toolArgs", skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<serde_json::Value>,
    /// Permission id, for permission requests
    #[serde(alias = "permissionId", skip_serializing_if = "Option::is_none")]
    pub permission_id: Option<String>,
}

/// One turn in a session.
///
/// Messages within a session are stored in timestamp-ascending order;
/// re-insertion of an existing id replaces the record in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message id, unique within its session
    pub id: String,
    /// Owning session id
    pub session_id: String,
    /// When the turn happened
    pub timestamp: DateTime<Utc>,
    /// Author
    pub role: Role,
    /// Semantic type
    pub kind: MessageKind,
    /// Plain-text content (may be empty until a detail fetch fills it)
    pub content: String,
    /// Structured parts
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    /// Optional metadata
    #[serde(default)]
    pub meta: MessageMeta,
}

/// A discovered backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Stable id supplied by the backend
    pub id: String,
    /// Normalized base URL
    pub url: String,
    /// Human name
    pub name: String,
    /// Project tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Branch tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Backend version string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// When the last announcement was observed
    pub last_announced: DateTime<Utc>,
    /// Health flag; flips on snapshot failure/success, never removes the server
    pub healthy: bool,
    /// Ids of sessions currently hosted here
    #[serde(default)]
    pub session_ids: BTreeSet<String>,
}

impl Server {
    /// Whether the server's last announcement is older than `timeout`.
    ///
    /// The boundary is strict: a server whose announcement age equals the
    /// timeout is not yet stale.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now.signed_duration_since(self.last_announced)
            .num_milliseconds()
            > timeout.as_millis() as i64
    }
}

/// One assistant conversation on a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session id
    pub id: String,
    /// Owning server id
    pub server_id: String,
    /// Display name
    pub name: String,
    /// Runtime status
    pub status: SessionStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last observed activity; never earlier than `created_at`
    pub last_activity: DateTime<Utc>,
    /// Backend-asserted long-running flag
    pub long_running: bool,
    /// Parent session, for sub-agent conversations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Child sessions (ordered)
    #[serde(default)]
    pub child_ids: BTreeSet<String>,
    /// Project tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Branch tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Accumulated cost
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Token counters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    /// Conversation, timestamp-ascending
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    /// Whether the session is in a non-terminal status.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Whether the session counts as long-running: either flagged by the
    /// backend or alive longer than `threshold`.
    #[must_use]
    pub fn is_long_running(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.long_running
            || now.signed_duration_since(self.created_at).num_milliseconds()
                > threshold.as_millis() as i64
    }
}

/// One session as reported by a snapshot or detail fetch.
///
/// `messages` is `None` when the backend endpoint carries no message list;
/// the registry then preserves whatever it already holds.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    /// Session id
    pub id: String,
    /// Display name (falls back to the id)
    pub name: Option<String>,
    /// Runtime status
    pub status: SessionStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp
    pub last_activity: DateTime<Utc>,
    /// Long-running flag
    pub long_running: bool,
    /// Parent session id
    pub parent_id: Option<String>,
    /// Project tag
    pub project: Option<String>,
    /// Branch tag
    pub branch: Option<String>,
    /// Accumulated cost
    pub cost: Option<f64>,
    /// Token counters
    pub tokens: Option<TokenUsage>,
    /// Message list, when the endpoint carries one
    pub messages: Option<Vec<Message>>,
}

/// Internal update decoded from a backend event stream.
///
/// Closed sum type; the wire formats diverge per event family, the decoded
/// form does not.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A session changed status
    SessionUpdate {
        /// Session id
        session_id: String,
        /// New status
        status: SessionStatus,
        /// When the backend observed the change
        observed_at: DateTime<Utc>,
    },
    /// A message appeared or changed
    MessageArrived {
        /// Session id
        session_id: String,
        /// The message; content may be empty until a detail fetch
        message: Message,
    },
    /// The backend is waiting on a permission prompt
    PermissionRequested {
        /// Session id
        session_id: String,
        /// Permission id to resolve against
        permission_id: String,
        /// Tool the permission guards
        tool_name: Option<String>,
        /// Human description of the prompt
        description: Option<String>,
    },
}

impl BackendEvent {
    /// The session this event belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionUpdate { session_id, .. }
            | Self::MessageArrived { session_id, .. }
            | Self::PermissionRequested { session_id, .. } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_mapping() {
        assert_eq!(SessionStatus::from_wire("idle"), SessionStatus::Idle);
        assert_eq!(SessionStatus::from_wire("running"), SessionStatus::Busy);
        assert_eq!(SessionStatus::from_wire("busy"), SessionStatus::Busy);
        assert_eq!(
            SessionStatus::from_wire("pending"),
            SessionStatus::WaitingForPermission
        );
        assert_eq!(
            SessionStatus::from_wire("completed"),
            SessionStatus::Completed
        );
        assert_eq!(SessionStatus::from_wire("error"), SessionStatus::Error);
        assert_eq!(SessionStatus::from_wire("aborted"), SessionStatus::Aborted);
        assert_eq!(SessionStatus::from_wire("warming-up"), SessionStatus::Idle);
    }

    #[test]
    fn terminal_subset() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(SessionStatus::Aborted.is_terminal());
        assert!(!SessionStatus::Idle.is_terminal());
        assert!(!SessionStatus::Busy.is_terminal());
        assert!(!SessionStatus::WaitingForPermission.is_terminal());
    }

    #[test]
    fn staleness_boundary_is_strict() {
        let now = Utc::now();
        let server = Server {
            id: "a".into(),
            url: "http://localhost:9000".into(),
            name: "a".into(),
            project: None,
            branch: None,
            version: None,
            last_announced: now - chrono::Duration::seconds(120),
            healthy: true,
            session_ids: BTreeSet::new(),
        };

        // Age exactly equal to the timeout: not stale.
        assert!(!server.is_stale(now, Duration::from_secs(120)));
        // One millisecond past: stale.
        assert!(server.is_stale(
            now + chrono::Duration::milliseconds(1),
            Duration::from_secs(120)
        ));
    }

    #[test]
    fn unknown_message_part_decodes() {
        let part: MessagePart =
            serde_json::from_str(r#"{"type":"holographic","payload":42}"#).unwrap();
        assert_eq!(part, MessagePart::Unknown);
    }
}
