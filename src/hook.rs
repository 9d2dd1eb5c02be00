use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::health::Metrics;
use crate::ingress::publish_event;
use crate::models::{Event, Platform};
use crate::queue::{MessageQueue, RedisQueue};
use crate::store::Store;

/// Which AI client sent this hook payload.
/// Add a new variant here when supporting a new client.
#[derive(Debug, PartialEq)]
enum HookClient {
    Cursor,
    ClaudeCode,
}

/// Identify the client from the raw payload.
///
/// Rules (in priority order):
///   1. `conversation_id` present  → Cursor extension hook.
///      Claude Code never sends it.
///   2. Everything else            → Claude Code hook.
fn detect_client(payload: &serde_json::Value) -> HookClient {
    if payload.get("conversation_id").is_some() {
        return HookClient::Cursor;
    }
    HookClient::ClaudeCode
}

/// Map a Claude Code hook name onto the unified event taxonomy.
fn claude_event_type(hook_event_name: &str) -> &'static str {
    match hook_event_name {
        "PostToolUse" | "PreToolUse" => "tool_use",
        "Stop" | "SessionEnd" => "session_end",
        "SessionStart" => "session_start",
        "UserPromptSubmit" => "user",
        _ => "hook",
    }
}

/// `blueplane hook`: read one JSON payload from stdin and enqueue it.
///
/// Strictly fire-and-forget: the editor-side hook script must never see an
/// error, so every failure path logs, counts, and still exits 0.
pub async fn run(config: &Config) -> Result<()> {
    use std::io::Read;
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let Ok(payload) = serde_json::from_str::<serde_json::Value>(&input) else {
        eprintln!("[blueplane hook] ignoring non-JSON input");
        return Ok(());
    };

    let event = match build_hook_event(&payload) {
        Some(event) => event,
        None => {
            eprintln!("[blueplane hook] payload has no usable session id, dropping");
            return Ok(());
        }
    };

    // A Stop hook is the only signal that a transcript is finished; use it
    // to clear that session's offset rows.
    if event.platform == Platform::ClaudeCode && event.event_type == "session_end" {
        if let Ok(store) = Store::open(&config.store_path()) {
            let _ = store.delete_offsets_for_session(&event.external_session_id);
        }
    }

    let metrics = Metrics::default();
    match RedisQueue::connect(&config.redis_url()).await {
        Ok(queue) => {
            let queue: Arc<dyn MessageQueue> = Arc::new(queue);
            if let Err(e) = publish_event(&queue, &metrics, &event).await {
                eprintln!("[blueplane hook] enqueue failed, event dropped: {e}");
            }
        }
        Err(e) => {
            eprintln!("[blueplane hook] queue unreachable, event dropped: {e}");
        }
    }
    Ok(())
}

/// Assemble a canonical event from a raw hook payload, or `None` when no
/// session identity can be found.
fn build_hook_event(payload: &serde_json::Value) -> Option<Event> {
    match detect_client(payload) {
        HookClient::ClaudeCode => {
            let session_id = payload["session_id"].as_str()?;
            let hook_name = payload["hook_event_name"].as_str().unwrap_or("");
            let mut event = Event::new(
                Platform::ClaudeCode,
                claude_event_type(hook_name),
                session_id,
                payload.clone(),
            );
            event.enqueued_at = Some(chrono::Utc::now());
            Some(event)
        }
        HookClient::Cursor => {
            let session_id = payload["conversation_id"].as_str()?;
            let event_type = payload["hook_event_name"]
                .as_str()
                .map(|n| n.to_ascii_lowercase())
                .unwrap_or_else(|| "hook".to_string());
            let mut event =
                Event::new(Platform::Cursor, event_type, session_id, payload.clone());
            event.enqueued_at = Some(chrono::Utc::now());
            Some(event)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conversation_id_marks_cursor() {
        assert_eq!(
            detect_client(&json!({"conversation_id": "c1"})),
            HookClient::Cursor
        );
        assert_eq!(
            detect_client(&json!({"session_id": "s1", "tool_name": "Read"})),
            HookClient::ClaudeCode
        );
    }

    #[test]
    fn claude_hook_names_map_to_event_types() {
        assert_eq!(claude_event_type("PostToolUse"), "tool_use");
        assert_eq!(claude_event_type("Stop"), "session_end");
        assert_eq!(claude_event_type("UserPromptSubmit"), "user");
        assert_eq!(claude_event_type("SomethingNew"), "hook");
    }

    #[test]
    fn claude_payload_becomes_event() {
        let payload = json!({
            "session_id": "4be0ac86-21f1-4c34-9ddb-d95b3c6b0f8a",
            "hook_event_name": "PostToolUse",
            "tool_name": "Bash",
            "cwd": "/home/dev/api"
        });
        let event = build_hook_event(&payload).unwrap();
        assert_eq!(event.platform, Platform::ClaudeCode);
        assert_eq!(event.event_type, "tool_use");
        assert_eq!(
            event.external_session_id,
            "4be0ac86-21f1-4c34-9ddb-d95b3c6b0f8a"
        );
        assert_eq!(event.claude.cwd.as_deref(), Some("/home/dev/api"));
    }

    #[test]
    fn cursor_payload_becomes_event() {
        let payload = json!({
            "conversation_id": "curs_1700000000_ab12",
            "hook_event_name": "AfterEdit",
            "generation_id": "gen_1"
        });
        let event = build_hook_event(&payload).unwrap();
        assert_eq!(event.platform, Platform::Cursor);
        assert_eq!(event.event_type, "afteredit");
        assert_eq!(event.external_session_id, "curs_1700000000_ab12");
    }

    #[test]
    fn payload_without_session_identity_is_dropped() {
        assert!(build_hook_event(&json!({"tool_name": "Read"})).is_none());
    }
}
