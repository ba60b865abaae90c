//! Wire formats: UDP discovery datagrams, backend REST payloads, and the
//! server-sent event stream.
//!
//! Backends emit snake_case JSON, except that timestamps and the
//! long-running flag have historically arrived in camelCase from some
//! versions; every DTO here accepts both spellings. Unknown fields, unknown
//! datagram types, and unknown stream event kinds are ignored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::{
    BackendEvent, Message, MessageKind, MessageMeta, MessagePart, Role, SessionStatus,
    SessionSummary, TokenUsage,
};
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// UDP discovery
// ---------------------------------------------------------------------------

/// A decoded discovery datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryPacket {
    /// A backend advertising its presence
    Announce(AnnouncePacket),
    /// A backend announcing orderly shutdown
    Shutdown(ShutdownPacket),
}

impl DiscoveryPacket {
    /// The server id the packet refers to.
    #[must_use]
    pub fn server_id(&self) -> &str {
        match self {
            Self::Announce(a) => &a.server_id,
            Self::Shutdown(s) => &s.server_id,
        }
    }
}

/// Announce datagram payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePacket {
    /// Stable server id
    pub server_id: String,
    /// Reachable base URL (normalized during decode)
    pub server_url: String,
    /// Human name
    pub server_name: String,
    /// Project tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Branch tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Backend version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Millisecond epoch at which the backend sent the announcement
    pub timestamp: i64,
}

/// Shutdown datagram payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownPacket {
    /// Stable server id
    pub server_id: String,
    /// Millisecond epoch
    pub timestamp: i64,
}

/// Decode one datagram.
///
/// Returns `Ok(None)` for packets with an unknown `type` (ignored by
/// contract) and `Err` for malformed payloads, which callers log and drop.
pub fn decode_datagram(payload: &[u8]) -> Result<Option<DiscoveryPacket>> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| Error::Packet(format!("not json: {e}")))?;

    let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Err(Error::Packet("missing type field".into()));
    };

    match kind {
        "announce" | "shutdown" => {
            let mut packet: DiscoveryPacket =
                serde_json::from_value(value).map_err(|e| Error::Packet(e.to_string()))?;
            validate_packet(&mut packet)?;
            Ok(Some(packet))
        }
        _ => Ok(None),
    }
}

/// Encode a packet the way backends frame it.
pub fn encode_datagram(packet: &DiscoveryPacket) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(packet)?)
}

fn validate_packet(packet: &mut DiscoveryPacket) -> Result<()> {
    match packet {
        DiscoveryPacket::Announce(a) => {
            for (field, value) in [
                ("serverId", &a.server_id),
                ("serverUrl", &a.server_url),
                ("serverName", &a.server_name),
            ] {
                if value.trim().is_empty() {
                    return Err(Error::Packet(format!("empty {field}")));
                }
            }
            a.server_url = normalize_base_url(&a.server_url)?;
        }
        DiscoveryPacket::Shutdown(s) => {
            if s.server_id.trim().is_empty() {
                return Err(Error::Packet("empty serverId".into()));
            }
        }
    }
    Ok(())
}

/// Normalize an announced base URL.
///
/// The scheme must be `http` or `https`; a missing port defaults from the
/// scheme; trailing slashes are stripped and duplicate internal slashes
/// collapsed (the scheme separator is untouched).
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw).map_err(|e| Error::Packet(format!("invalid url {raw:?}: {e}")))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::Packet(format!("unsupported scheme {scheme:?}")));
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::Packet(format!("url {raw:?} has no host")))?;
    let port = url
        .port_or_known_default()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });

    let mut path = String::new();
    for segment in url.path().split('/').filter(|s| !s.is_empty()) {
        path.push('/');
        path.push_str(segment);
    }

    Ok(format!("{scheme}://{host}:{port}{path}"))
}

// ---------------------------------------------------------------------------
// Backend REST payloads
// ---------------------------------------------------------------------------

/// Session record as the list and detail endpoints report it.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionDto {
    /// Session id
    pub id: String,
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) status: Option<String>,
    #[serde(default, alias = "createdAt")]
    pub(crate) created_at: Option<i64>,
    #[serde(default, alias = "lastActivity")]
    pub(crate) last_activity: Option<i64>,
    #[serde(default, alias = "longRunning")]
    pub(crate) long_running: Option<bool>,
    #[serde(default, alias = "parentId")]
    pub(crate) parent_id: Option<String>,
    #[serde(default)]
    pub(crate) project: Option<String>,
    #[serde(default)]
    pub(crate) branch: Option<String>,
    #[serde(default)]
    pub(crate) cost: Option<f64>,
    #[serde(default)]
    pub(crate) tokens: Option<TokenUsage>,
    #[serde(default)]
    pub(crate) messages: Option<Vec<MessageDto>>,
}

impl SessionDto {
    /// Convert into the internal summary form.
    ///
    /// Missing timestamps fall back to `now` (and activity to creation, so
    /// the `last_activity >= created_at` invariant holds from the start).
    #[must_use]
    pub fn into_summary(self, now: DateTime<Utc>) -> SessionSummary {
        let created_at = self.created_at.and_then(millis_to_utc).unwrap_or(now);
        let last_activity = self
            .last_activity
            .and_then(millis_to_utc)
            .unwrap_or(created_at)
            .max(created_at);
        let id = self.id;
        let messages = self.messages.map(|ms| {
            ms.into_iter()
                .map(|m| m.into_message(&id, now))
                .collect::<Vec<_>>()
        });

        SessionSummary {
            name: self.name,
            status: self
                .status
                .as_deref()
                .map_or(SessionStatus::Idle, SessionStatus::from_wire),
            created_at,
            last_activity,
            long_running: self.long_running.unwrap_or(false),
            parent_id: self.parent_id,
            project: self.project,
            branch: self.branch,
            cost: self.cost,
            tokens: self.tokens,
            messages,
            id,
        }
    }
}

/// Message record as the detail endpoint reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageDto {
    /// Message id
    pub id: String,
    #[serde(default, alias = "createdAt")]
    pub(crate) timestamp: Option<i64>,
    #[serde(default)]
    pub(crate) role: Option<String>,
    #[serde(default, alias = "type")]
    pub(crate) kind: Option<String>,
    #[serde(default)]
    pub(crate) content: Option<String>,
    #[serde(default)]
    pub(crate) parts: Option<Vec<MessagePart>>,
    #[serde(default)]
    pub(crate) meta: Option<MessageMeta>,
}

impl MessageDto {
    /// Convert into the internal message form.
    #[must_use]
    pub fn into_message(self, session_id: &str, now: DateTime<Utc>) -> Message {
        let role = self.role.as_deref().map_or(Role::System, Role::from_wire);
        let kind = self
            .kind
            .as_deref()
            .and_then(parse_message_kind)
            .unwrap_or_else(|| MessageKind::for_role(role));

        Message {
            id: self.id,
            session_id: session_id.to_string(),
            timestamp: self.timestamp.and_then(millis_to_utc).unwrap_or(now),
            role,
            kind,
            content: self.content.unwrap_or_default(),
            parts: self.parts.unwrap_or_default(),
            meta: self.meta.unwrap_or_default(),
        }
    }
}

/// Per-session status tags from the status endpoint, keyed by session id.
pub type StatusMap = HashMap<String, String>;

/// Response to a send-message command.
#[derive(Debug, Clone, Deserialize)]
pub struct SendReceiptDto {
    /// Id the backend assigned to the accepted message
    #[serde(default, alias = "messageId")]
    pub message_id: Option<String>,
    /// `accepted`, `queued`, or an error marker
    #[serde(default)]
    pub status: Option<String>,
}

fn parse_message_kind(kind: &str) -> Option<MessageKind> {
    match kind {
        "user_input" => Some(MessageKind::UserInput),
        "assistant_response" => Some(MessageKind::AssistantResponse),
        "tool_execution" => Some(MessageKind::ToolExecution),
        "permission_request" => Some(MessageKind::PermissionRequest),
        "system_message" => Some(MessageKind::SystemMessage),
        "error_message" => Some(MessageKind::ErrorMessage),
        _ => None,
    }
}

/// Millisecond epoch to UTC; `None` when out of chrono's range.
#[must_use]
pub fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

// ---------------------------------------------------------------------------
// Server-sent event stream
// ---------------------------------------------------------------------------

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    /// `event:` field
    pub event: Option<String>,
    /// `id:` field
    pub id: Option<String>,
    /// Joined `data:` lines
    pub data: String,
}

/// Incremental SSE frame decoder over a byte stream.
///
/// Frames are delimited by a blank line; comment lines (`:` prefix, used by
/// backends as keepalives) are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<SseFrame> {
        loop {
            let (end, delim) = find_frame_end(&self.buf)?;
            let block: Vec<u8> = self.buf.drain(..end + delim).collect();
            if let Some(frame) = parse_frame(&block[..end]) {
                return Some(frame);
            }
        }
    }
}

fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        i += 1;
    }
    None
}

fn parse_frame(block: &[u8]) -> Option<SseFrame> {
    let text = std::str::from_utf8(block).ok()?;

    let mut event = None;
    let mut id = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            "id" => id = Some(value.to_string()),
            _ => {}
        }
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }

    Some(SseFrame {
        event,
        id,
        data: data_lines.join("\n"),
    })
}

#[derive(Debug, Deserialize)]
struct StatusEventDto {
    #[serde(alias = "sessionId")]
    session_id: String,
    status: String,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MessageEventDto {
    #[serde(alias = "sessionId")]
    session_id: String,
    #[serde(alias = "messageId")]
    message_id: String,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PermissionEventDto {
    #[serde(alias = "sessionId")]
    session_id: String,
    #[serde(alias = "permissionId")]
    permission_id: String,
    #[serde(default, alias = "toolName")]
    tool_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Decode one stream frame into an internal event.
///
/// Returns `Ok(None)` for frames without an event name and for unknown
/// event kinds; `Err(InvalidResponse)` when a known kind carries an
/// undecodable payload.
pub fn decode_stream_event(frame: &SseFrame, now: DateTime<Utc>) -> Result<Option<BackendEvent>> {
    let Some(kind) = frame.event.as_deref() else {
        return Ok(None);
    };

    match kind {
        "session.status" => {
            let dto: StatusEventDto = serde_json::from_str(&frame.data)
                .map_err(|e| Error::InvalidResponse(format!("session.status: {e}")))?;
            Ok(Some(BackendEvent::SessionUpdate {
                session_id: dto.session_id,
                status: SessionStatus::from_wire(&dto.status),
                observed_at: dto.timestamp.and_then(millis_to_utc).unwrap_or(now),
            }))
        }
        "message.updated" => {
            let dto: MessageEventDto = serde_json::from_str(&frame.data)
                .map_err(|e| Error::InvalidResponse(format!("message.updated: {e}")))?;
            let role = dto.role.as_deref().map_or(Role::System, Role::from_wire);
            let message = Message {
                id: dto.message_id,
                session_id: dto.session_id.clone(),
                timestamp: dto.timestamp.and_then(millis_to_utc).unwrap_or(now),
                role,
                kind: dto
                    .kind
                    .as_deref()
                    .and_then(parse_message_kind)
                    .unwrap_or_else(|| MessageKind::for_role(role)),
                // The stream often omits content; a detail fetch fills it.
                content: dto.content.unwrap_or_default(),
                parts: Vec::new(),
                meta: MessageMeta::default(),
            };
            Ok(Some(BackendEvent::MessageArrived {
                session_id: dto.session_id,
                message,
            }))
        }
        "permission.updated" => {
            let dto: PermissionEventDto = serde_json::from_str(&frame.data)
                .map_err(|e| Error::InvalidResponse(format!("permission.updated: {e}")))?;
            Ok(Some(BackendEvent::PermissionRequested {
                session_id: dto.session_id,
                permission_id: dto.permission_id,
                tool_name: dto.tool_name,
                description: dto.description,
            }))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn announce_round_trip() {
        let packet = DiscoveryPacket::Announce(AnnouncePacket {
            server_id: "A".into(),
            server_url: "http://localhost:9000".into(),
            server_name: "S1".into(),
            project: Some("demo".into()),
            branch: None,
            version: Some("0.9.1".into()),
            timestamp: 1000,
        });

        let bytes = encode_datagram(&packet).unwrap();
        let decoded = decode_datagram(&bytes).unwrap().unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn shutdown_round_trip() {
        let packet = DiscoveryPacket::Shutdown(ShutdownPacket {
            server_id: "A".into(),
            timestamp: 42,
        });
        let bytes = encode_datagram(&packet).unwrap();
        assert_eq!(decode_datagram(&bytes).unwrap().unwrap(), packet);
    }

    #[test]
    fn packets_use_camel_case_on_the_wire() {
        let bytes = encode_datagram(&DiscoveryPacket::Shutdown(ShutdownPacket {
            server_id: "A".into(),
            timestamp: 1,
        }))
        .unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["type"], "shutdown");
        assert_eq!(raw["serverId"], "A");
    }

    #[test]
    fn unknown_packet_type_is_ignored() {
        let out = decode_datagram(br#"{"type":"heartbeat","serverId":"A"}"#).unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let out = decode_datagram(
            br#"{"type":"shutdown","serverId":"A","timestamp":1,"extra":{"x":1}}"#,
        )
        .unwrap();
        assert!(out.is_some());
    }

    #[test]
    fn malformed_datagrams_error() {
        assert!(decode_datagram(b"not json").is_err());
        assert!(decode_datagram(br#"{"serverId":"A"}"#).is_err());
        assert!(decode_datagram(br#"{"type":"announce","serverId":"A"}"#).is_err());
        // Empty required field
        assert!(
            decode_datagram(
                br#"{"type":"announce","serverId":" ","serverUrl":"http://h","serverName":"n","timestamp":1}"#
            )
            .is_err()
        );
    }

    #[test]
    fn url_normalization() {
        assert_eq!(
            normalize_base_url("http://localhost:9000").unwrap(),
            "http://localhost:9000"
        );
        assert_eq!(
            normalize_base_url("http://localhost").unwrap(),
            "http://localhost:80"
        );
        assert_eq!(
            normalize_base_url("https://box.local/").unwrap(),
            "https://box.local:443"
        );
        assert_eq!(
            normalize_base_url("http://h//api///v1/").unwrap(),
            "http://h:80/api/v1"
        );
        assert!(normalize_base_url("ftp://h").is_err());
        assert!(normalize_base_url("not a url").is_err());
    }

    #[test]
    fn sse_decoder_reassembles_split_frames() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"event: session.status\nda");
        assert!(decoder.next_frame().is_none());
        decoder.push(b"ta: {\"sessionId\":\"s1\",\"status\":\"busy\"}\n\nevent: x\n");
        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.event.as_deref(), Some("session.status"));
        assert_eq!(frame.data, r#"{"sessionId":"s1","status":"busy"}"#);
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn sse_decoder_skips_keepalive_comments() {
        let mut decoder = SseDecoder::new();
        decoder.push(b": ping\n\nevent: e\ndata: 1\n\n");
        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.event.as_deref(), Some("e"));
    }

    #[test]
    fn sse_decoder_handles_crlf() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"event: e\r\ndata: hi\r\n\r\n");
        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.data, "hi");
    }

    #[test]
    fn sse_multiple_data_lines_join() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: a\ndata: b\n\n");
        assert_eq!(decoder.next_frame().unwrap().data, "a\nb");
    }

    #[test]
    fn decode_status_event() {
        let now = Utc::now();
        let frame = SseFrame {
            event: Some("session.status".into()),
            id: None,
            data: r#"{"session_id":"s1","status":"pending","timestamp":5000}"#.into(),
        };
        let event = decode_stream_event(&frame, now).unwrap().unwrap();
        assert_eq!(
            event,
            BackendEvent::SessionUpdate {
                session_id: "s1".into(),
                status: SessionStatus::WaitingForPermission,
                observed_at: millis_to_utc(5000).unwrap(),
            }
        );
    }

    #[test]
    fn decode_message_event_without_content() {
        let now = Utc::now();
        let frame = SseFrame {
            event: Some("message.updated".into()),
            id: None,
            data: r#"{"sessionId":"s1","messageId":"m1","timestamp":7000,"role":"assistant"}"#
                .into(),
        };
        match decode_stream_event(&frame, now).unwrap().unwrap() {
            BackendEvent::MessageArrived {
                session_id,
                message,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(message.id, "m1");
                assert_eq!(message.role, Role::Assistant);
                assert_eq!(message.kind, MessageKind::AssistantResponse);
                assert!(message.content.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn decode_permission_event() {
        let now = Utc::now();
        let frame = SseFrame {
            event: Some("permission.updated".into()),
            id: None,
            data: r#"{"sessionId":"s1","permissionId":"p1","toolName":"bash"}"#.into(),
        };
        match decode_stream_event(&frame, now).unwrap().unwrap() {
            BackendEvent::PermissionRequested {
                permission_id,
                tool_name,
                ..
            } => {
                assert_eq!(permission_id, "p1");
                assert_eq!(tool_name.as_deref(), Some("bash"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_event_kinds_are_ignored() {
        let frame = SseFrame {
            event: Some("telemetry.tick".into()),
            id: None,
            data: "{}".into(),
        };
        assert_eq!(decode_stream_event(&frame, Utc::now()).unwrap(), None);
    }

    #[test]
    fn session_dto_accepts_both_spellings() {
        let now = Utc::now();
        let snake: SessionDto = serde_json::from_str(
            r#"{"id":"s1","status":"busy","created_at":1000,"last_activity":2000,"long_running":true}"#,
        )
        .unwrap();
        let camel: SessionDto = serde_json::from_str(
            r#"{"id":"s1","status":"busy","createdAt":1000,"lastActivity":2000,"longRunning":true}"#,
        )
        .unwrap();
        assert_eq!(snake.into_summary(now), camel.into_summary(now));
    }

    #[test]
    fn session_dto_clamps_activity_to_creation() {
        let dto: SessionDto =
            serde_json::from_str(r#"{"id":"s1","created_at":5000,"last_activity":1000}"#).unwrap();
        let summary = dto.into_summary(Utc::now());
        assert_eq!(summary.last_activity, summary.created_at);
    }
}
