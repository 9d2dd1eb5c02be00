use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Namespace for deriving stable internal IDs from platform-native ones.
const SESSION_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5b, 0x1e, 0x90, 0x2f, 0x6a, 0xd4, 0x4c, 0x11, 0xb3, 0x7e, 0x02, 0x48, 0x9c, 0xe5, 0x71, 0xaa,
]);

/// Deterministic internal UUID for an external session identifier.
pub fn stable_session_uuid(external_id: &str) -> Uuid {
    Uuid::new_v5(&SESSION_NAMESPACE, external_id.as_bytes())
}

/// Deterministic event id from a natural key.
///
/// Monitor- and tailer-produced events derive their id from what they
/// observed, not from randomness, so a crash-replay or restart re-emission
/// lands on the store's `event_id` unique index instead of duplicating rows.
pub fn stable_event_uuid(parts: &[&str]) -> Uuid {
    Uuid::new_v5(&SESSION_NAMESPACE, parts.join("\u{1f}").as_bytes())
}

/// 16-hex truncation of SHA-256 of the workspace path.
///
/// Identifies a workspace without recording the path itself anywhere it is
/// not needed; the full path stays only in `cursor_sessions`.
pub fn workspace_hash(workspace_path: &str) -> String {
    let digest = Sha256::digest(workspace_path.as_bytes());
    let mut out = String::with_capacity(16);
    for b in &digest[..8] {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// SHA-256 hex of a canonical JSON rendering, for snapshot change detection
/// on sources that carry no timestamps.
pub fn snapshot_hash(value: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(value).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Cursor,
    ClaudeCode,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Cursor => "cursor",
            Platform::ClaudeCode => "claude_code",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cursor" => Some(Platform::Cursor),
            "claude_code" => Some(Platform::ClaudeCode),
            _ => None,
        }
    }
}

/// Canonical telemetry event, produced by every ingress path.
///
/// The payload is the source of truth; the flattened scalar projections are
/// derived from it and exist only to be indexed. They may be absent but are
/// never allowed to disagree with the payload: the store re-extracts them
/// from the payload at insert time.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Event {
    pub event_id: Uuid,
    pub platform: Platform,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub external_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,

    // Indexed scalar projections (flattened for a flat JSON envelope)
    #[serde(default, flatten)]
    pub claude: ClaudeProjection,
    #[serde(default, flatten)]
    pub cursor: CursorProjection,
}

impl Event {
    pub fn new(
        platform: Platform,
        event_type: impl Into<String>,
        external_session_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut event = Event {
            event_id: Uuid::new_v4(),
            platform,
            event_type: event_type.into(),
            timestamp: Utc::now(),
            external_session_id: external_session_id.into(),
            workspace_hash: None,
            enqueued_at: None,
            payload,
            metadata: serde_json::Value::Null,
            claude: ClaudeProjection::default(),
            cursor: CursorProjection::default(),
        };
        event.refresh_projections();
        event
    }

    /// Re-derive the scalar projections from the payload.
    pub fn refresh_projections(&mut self) {
        match self.platform {
            Platform::ClaudeCode => self.claude = ClaudeProjection::from_payload(&self.payload),
            Platform::Cursor => self.cursor = CursorProjection::from_payload(&self.payload),
        }
    }
}

/// Scalar projections for Claude Code transcript records.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ClaudeProjection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
}

impl ClaudeProjection {
    /// Extract the indexed scalars from a raw transcript record.
    ///
    /// Absent fields stay `None`, never zero, and are never synthesised.
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        let message = &payload["message"];
        let usage = &message["usage"];
        ClaudeProjection {
            message_role: message["role"].as_str().map(str::to_string),
            message_model: message["model"].as_str().map(str::to_string),
            input_tokens: usage["input_tokens"].as_i64(),
            output_tokens: usage["output_tokens"].as_i64(),
            cache_creation_input_tokens: usage["cache_creation_input_tokens"].as_i64(),
            cache_read_input_tokens: usage["cache_read_input_tokens"].as_i64(),
            record_uuid: payload["uuid"].as_str().map(str::to_string),
            parent_uuid: payload["parentUuid"].as_str().map(str::to_string),
            request_id: payload["requestId"].as_str().map(str::to_string),
            agent_id: payload["agentId"].as_str().map(str::to_string),
            cwd: payload["cwd"].as_str().map(str::to_string),
            git_branch: payload["gitBranch"].as_str().map(str::to_string),
            user_type: payload["userType"].as_str().map(str::to_string),
        }
    }

    /// input + output when both present; the store keeps a `tokens_used`
    /// column for analytics convenience.
    pub fn tokens_used(&self) -> Option<i64> {
        match (self.input_tokens, self.output_tokens) {
            (Some(i), Some(o)) => Some(i + o),
            _ => None,
        }
    }
}

/// Scalar projections for Cursor workspace-store objects.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CursorProjection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bubble_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines_added: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines_removed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count_up_until_here: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevant_files: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities_ran: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_statuses: Option<serde_json::Value>,
}

impl CursorProjection {
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        CursorProjection {
            composer_id: payload["composerId"].as_str().map(str::to_string),
            bubble_id: payload["bubbleId"].as_str().map(str::to_string),
            generation_uuid: payload["generationUUID"].as_str().map(str::to_string),
            lines_added: payload["linesAdded"]
                .as_i64()
                .or_else(|| payload["totalLinesAdded"].as_i64()),
            lines_removed: payload["linesRemoved"]
                .as_i64()
                .or_else(|| payload["totalLinesRemoved"].as_i64()),
            token_count_up_until_here: payload["tokenCountUpUntilHere"].as_i64(),
            relevant_files: non_null(&payload["relevantFiles"]),
            capabilities_ran: non_null(&payload["capabilitiesRan"]),
            capability_statuses: non_null(&payload["capabilityStatuses"]),
        }
    }
}

fn non_null(v: &serde_json::Value) -> Option<serde_json::Value> {
    if v.is_null() {
        None
    } else {
        Some(v.clone())
    }
}
