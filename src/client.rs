//! Per-server HTTP client
//!
//! One `BackendClient` per discovered server, exclusively owned by its
//! server session. Commands and snapshot fetches carry a per-request
//! timeout; the event stream request deliberately does not, because its
//! supervisor tracks liveness through connection state instead.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use reqwest::{Client, header};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::model::{BackendEvent, SessionStatus, SessionSummary};
use crate::protocol::{SendReceiptDto, SessionDto, SseDecoder, StatusMap, decode_stream_event};
use crate::{Error, Result};

/// Operator response to a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Allow this invocation only
    AllowOnce,
    /// Allow this tool for the rest of the session
    AllowAlways,
    /// Refuse
    Deny,
}

impl PermissionDecision {
    /// Wire spelling of the decision.
    #[must_use]
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::AllowOnce => "allow_once",
            Self::AllowAlways => "allow_always",
            Self::Deny => "deny",
        }
    }
}

/// Outcome of a send-message command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The backend started processing the message
    Accepted,
    /// The backend queued it behind the current turn
    Queued,
}

/// Receipt for an accepted send-message command.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    /// Id the backend assigned to the message
    pub message_id: Option<String>,
    /// Accepted or queued
    pub outcome: SendOutcome,
}

/// HTTP client for one backend server.
pub struct BackendClient {
    /// HTTP client
    http: Client,
    /// Normalized base URL
    base_url: String,
    /// Per-request timeout
    timeout: Duration,
}

impl BackendClient {
    /// Create a client for a normalized base URL.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        // No client-wide timeout: the event stream request must be allowed
        // to live indefinitely. Regular requests set one per call.
        let http = Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// The normalized base URL this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Fetch the current session list.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let dtos: Vec<SessionDto> = self.get_json("/api/sessions").await?;
        let now = Utc::now();
        Ok(dtos.into_iter().map(|d| d.into_summary(now)).collect())
    }

    /// Fetch the runtime status of every session, keyed by session id.
    pub async fn session_statuses(&self) -> Result<HashMap<String, SessionStatus>> {
        let map: StatusMap = self.get_json("/api/sessions/status").await?;
        Ok(map
            .into_iter()
            .map(|(id, tag)| (id, SessionStatus::from_wire(&tag)))
            .collect())
    }

    /// Fetch one session in full, messages included.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionSummary> {
        let dto: SessionDto = self
            .get_json(&format!("/api/sessions/{session_id}"))
            .await?;
        let mut summary = dto.into_summary(Utc::now());
        // The detail endpoint is authoritative for messages even when the
        // list is empty.
        summary.messages.get_or_insert_with(Vec::new);
        Ok(summary)
    }

    /// Send a message into a session.
    #[tracing::instrument(
        skip(self, content),
        fields(
            url = %self.base_url,
            session = %session_id,
            request_id = %uuid::Uuid::new_v4()
        )
    )]
    pub async fn send_message(&self, session_id: &str, content: &str) -> Result<SendReceipt> {
        let dto: SendReceiptDto = self
            .post_json(
                &format!("/api/sessions/{session_id}/message"),
                &serde_json::json!({ "content": content }),
            )
            .await?;

        let outcome = match dto.status.as_deref() {
            Some("queued") => SendOutcome::Queued,
            Some("error") => {
                return Err(Error::InvalidResponse(format!(
                    "{session_id}: backend rejected message"
                )));
            }
            _ => SendOutcome::Accepted,
        };

        Ok(SendReceipt {
            message_id: dto.message_id,
            outcome,
        })
    }

    /// Abort a session's current turn.
    #[tracing::instrument(
        skip(self),
        fields(url = %self.base_url, session = %session_id, request_id = %uuid::Uuid::new_v4())
    )]
    pub async fn abort(&self, session_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/api/sessions/{session_id}/abort")))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify(&e, session_id))?;
        check_status(&response, session_id)?;
        Ok(())
    }

    /// Resolve a permission prompt.
    #[tracing::instrument(
        skip(self),
        fields(
            url = %self.base_url,
            session = %session_id,
            permission = %permission_id,
            request_id = %uuid::Uuid::new_v4()
        )
    )]
    pub async fn resolve_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        decision: PermissionDecision,
    ) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!(
                "/api/sessions/{session_id}/permissions/{permission_id}"
            )))
            .timeout(self.timeout)
            .json(&serde_json::json!({ "decision": decision.as_wire() }))
            .send()
            .await
            .map_err(|e| classify(&e, session_id))?;
        check_status(&response, permission_id)?;
        Ok(())
    }

    /// Open the long-lived event stream.
    ///
    /// The returned stream yields decoded events until the server closes
    /// the connection or a transport error occurs.
    pub async fn subscribe(&self) -> Result<EventStream> {
        let response = self
            .http
            .get(self.url("/api/events"))
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| classify(&e, &self.base_url))?;
        check_status(&response, "/api/events")?;

        Ok(EventStream {
            inner: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::new(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify(&e, path))?;
        check_status(&response, path)?;
        decode_body(response, path).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(self.url(path))
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| classify(&e, path))?;
        check_status(&response, path)?;
        decode_body(response, path).await
    }
}

/// Decoded event stream over one backend's SSE endpoint.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    decoder: SseDecoder,
}

impl EventStream {
    /// Next decoded event; `Ok(None)` when the server closed the stream.
    ///
    /// Unknown event kinds and undecodable payloads of known kinds are
    /// skipped (the next snapshot corrects any resulting drift).
    pub async fn next_event(&mut self) -> Result<Option<BackendEvent>> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                match decode_stream_event(&frame, Utc::now()) {
                    Ok(Some(event)) => return Ok(Some(event)),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable stream event");
                        continue;
                    }
                }
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(e)) => return Err(classify(&e, "event stream")),
                None => return Ok(None),
            }
        }
    }
}

fn classify(error: &reqwest::Error, context: &str) -> Error {
    if error.is_timeout() {
        Error::Timeout(format!("{context}: {error}"))
    } else {
        Error::Network(format!("{context}: {error}"))
    }
}

fn check_status(response: &reqwest::Response, context: &str) -> Result<()> {
    match map_status(response.status().as_u16(), context) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn map_status(status: u16, context: &str) -> Option<Error> {
    match status {
        200..=299 => None,
        404 => Some(Error::SessionNotFound(context.to_string())),
        403 => Some(Error::PermissionDenied(context.to_string())),
        _ => Some(Error::Unreachable(format!("{context}: HTTP {status}"))),
    }
}

async fn decode_body<T: DeserializeOwned>(response: reqwest::Response, path: &str) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::InvalidResponse(format!("{path}: {e}")))
}
