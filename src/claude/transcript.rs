use chrono::{DateTime, Utc};

use crate::models::{stable_event_uuid, Event, Platform};

/// Record types Claude Code writes today. Anything else still flows through
/// verbatim; schema drift is data, not an error.
pub const KNOWN_TYPES: &[&str] = &[
    "user",
    "assistant",
    "tool_use",
    "tool_result",
    "queue-operation",
    "system",
    "summary",
];

/// A parsed transcript line with enough context to become an event.
pub struct TranscriptRecord {
    pub record: serde_json::Value,
    pub record_type: String,
}

/// Parse one complete JSONL line. `None` means the line is malformed and
/// should be skipped (offset still advances past it).
pub fn parse_line(line: &str) -> Option<TranscriptRecord> {
    let record: serde_json::Value = serde_json::from_str(line).ok()?;
    let record_type = record["type"].as_str()?.to_string();
    if record_type.is_empty() {
        return None;
    }
    Some(TranscriptRecord {
        record,
        record_type,
    })
}

pub fn record_timestamp(record: &serde_json::Value) -> Option<DateTime<Utc>> {
    record["timestamp"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// The session a record belongs to: its own `sessionId` when present,
/// otherwise the transcript file's stem (the session UUID).
pub fn session_id_for(record: &serde_json::Value, file_stem: &str) -> String {
    record["sessionId"]
        .as_str()
        .unwrap_or(file_stem)
        .to_string()
}

/// Assemble the canonical event for one transcript record.
///
/// The event id derives from the record's `uuid` when it has one (re-reads
/// after a crash dedupe in the store), falling back to file + offset for
/// records without identity.
pub fn build_event(
    parsed: TranscriptRecord,
    file_stem: &str,
    file_path: &str,
    line_offset: u64,
) -> Event {
    let session_id = session_id_for(&parsed.record, file_stem);
    let timestamp = record_timestamp(&parsed.record);

    let mut event = Event::new(
        Platform::ClaudeCode,
        parsed.record_type.clone(),
        session_id.clone(),
        parsed.record,
    );
    event.event_id = match event.payload["uuid"].as_str() {
        Some(uuid) => stable_event_uuid(&["claude", &session_id, uuid]),
        None => stable_event_uuid(&["claude", file_path, &line_offset.to_string()]),
    };
    if let Some(ts) = timestamp {
        event.timestamp = ts;
    }
    event
}
