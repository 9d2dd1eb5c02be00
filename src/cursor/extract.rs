use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::PipelineError;

/// Busy backoff: 100 ms growing 4x per attempt, capped at 1.6 s.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_millis(1_600);
const OPEN_ATTEMPTS: u32 = 3;

/// Open one of Cursor's databases strictly read-only.
///
/// The IDE owns these files; a very short busy timeout keeps us from ever
/// stalling it under lock contention.
pub fn open_readonly(path: &Path) -> Result<Connection, PipelineError> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    conn.execute_batch("PRAGMA busy_timeout = 100;")?;
    Ok(conn)
}

/// Open with the lock-contention backoff schedule, then give up for this
/// cycle.
pub async fn open_with_backoff(path: &Path) -> Result<Connection, PipelineError> {
    let mut last_err = None;
    for attempt in 0..OPEN_ATTEMPTS {
        match open_readonly(path) {
            Ok(conn) => return Ok(conn),
            Err(e) if e.is_transient() => {
                let backoff = backoff_for(attempt);
                debug!(path = %path.display(), attempt, backoff_ms = backoff.as_millis() as u64,
                       "cursor db locked, backing off");
                tokio::time::sleep(backoff).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| PipelineError::TransientIo("cursor db busy".into())))
}

fn backoff_for(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE.as_millis() as u64 * 4u64.pow(attempt);
    Duration::from_millis(ms).min(BACKOFF_CAP)
}

fn parse_db_value(value: rusqlite::types::Value) -> Option<serde_json::Value> {
    match value {
        rusqlite::types::Value::Text(s) => serde_json::from_str(&s).ok(),
        rusqlite::types::Value::Blob(b) => serde_json::from_slice(&b).ok(),
        _ => None,
    }
}

/// Read a JSON blob from the workspace store's `ItemTable`.
///
/// Missing keys and unparseable values are schema drift, not errors: both
/// come back as `None`.
pub fn read_item(conn: &Connection, key: &str) -> Result<Option<serde_json::Value>, PipelineError> {
    let value: Option<rusqlite::types::Value> = conn
        .query_row("SELECT value FROM ItemTable WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value.and_then(parse_db_value))
}

/// Read a JSON blob from the global store's `cursorDiskKV`.
pub fn read_disk_kv(
    conn: &Connection,
    key: &str,
) -> Result<Option<serde_json::Value>, PipelineError> {
    let value: Option<rusqlite::types::Value> = conn
        .query_row(
            "SELECT value FROM cursorDiskKV WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(parse_db_value))
}

/// Generations newer than the watermark, in `unixMs` order.
///
/// Arrays are replaced wholesale by the IDE (`ON CONFLICT REPLACE`), so a
/// shorter-than-before array is not a signal to re-emit by position; the
/// watermark alone decides.
pub fn new_generations(
    generations: &serde_json::Value,
    last_seen_unix_ms: i64,
) -> Vec<serde_json::Value> {
    let Some(items) = generations.as_array() else {
        return Vec::new();
    };
    let mut fresh: Vec<serde_json::Value> = items
        .iter()
        .filter(|g| g["unixMs"].as_i64().map(|ms| ms > last_seen_unix_ms) == Some(true))
        .cloned()
        .collect();
    fresh.sort_by_key(|g| g["unixMs"].as_i64().unwrap_or(0));
    fresh
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComposerChange {
    Created(serde_json::Value),
    Updated(serde_json::Value),
    Archived(serde_json::Value),
}

impl ComposerChange {
    pub fn event_type(&self) -> &'static str {
        match self {
            ComposerChange::Created(_) => "composer_created",
            ComposerChange::Updated(_) => "composer_updated",
            ComposerChange::Archived(_) => "composer_archived",
        }
    }

    pub fn composer(&self) -> &serde_json::Value {
        match self {
            ComposerChange::Created(c) | ComposerChange::Updated(c) | ComposerChange::Archived(c) => c,
        }
    }
}

/// Composer metadata list from `composer.composerData`, which nests the list
/// under `allComposers` in current schemas but has carried a bare array too.
pub fn composer_list(data: &serde_json::Value) -> Vec<serde_json::Value> {
    data["allComposers"]
        .as_array()
        .or_else(|| data.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Diff composer metadata against the previous snapshot by `composerId`.
pub fn diff_composers(
    previous: &HashMap<String, serde_json::Value>,
    current: &[serde_json::Value],
) -> Vec<ComposerChange> {
    let mut changes = Vec::new();
    for composer in current {
        let Some(id) = composer["composerId"].as_str() else {
            continue;
        };
        match previous.get(id) {
            None => changes.push(ComposerChange::Created(composer.clone())),
            Some(old) if old != composer => {
                let was_archived = old["isArchived"].as_bool().unwrap_or(false);
                let is_archived = composer["isArchived"].as_bool().unwrap_or(false);
                if is_archived && !was_archived {
                    changes.push(ComposerChange::Archived(composer.clone()));
                } else {
                    changes.push(ComposerChange::Updated(composer.clone()));
                }
            }
            Some(_) => {}
        }
    }
    changes
}

/// Bubbles in `conversation` array order whose `bubbleId` is not yet seen.
pub fn new_bubbles(
    seen: &HashSet<String>,
    conversation: &serde_json::Value,
) -> Vec<serde_json::Value> {
    let Some(items) = conversation.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|b| {
            b["bubbleId"]
                .as_str()
                .map(|id| !seen.contains(id))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// History entries not present in the previous snapshot, keyed by resource.
pub fn new_history_entries(
    seen: &HashSet<String>,
    entries: &serde_json::Value,
) -> Vec<(String, serde_json::Value)> {
    let Some(items) = entries.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|entry| {
            let resource = entry["editor"]["resource"].as_str()?;
            (!seen.contains(resource)).then(|| (resource.to_string(), entry.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded_workspace_db(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("state.vscdb");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE ItemTable (key TEXT PRIMARY KEY, value BLOB);
             INSERT INTO ItemTable VALUES
                ('aiService.generations',
                 '[{\"unixMs\": 1700000000000, \"generationUUID\": \"a\", \"type\": \"composer\"}]'),
                ('broken.key', 'not json');",
        )
        .unwrap();
        path
    }

    #[test]
    fn read_item_parses_json_and_tolerates_drift() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_workspace_db(dir.path());
        let conn = open_readonly(&path).unwrap();

        let generations = read_item(&conn, "aiService.generations").unwrap().unwrap();
        assert_eq!(generations[0]["generationUUID"], "a");

        // missing key and unparseable value are both absent data
        assert!(read_item(&conn, "no.such.key").unwrap().is_none());
        assert!(read_item(&conn, "broken.key").unwrap().is_none());
    }

    #[test]
    fn readonly_connection_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_workspace_db(dir.path());
        let conn = open_readonly(&path).unwrap();
        let res = conn.execute("INSERT INTO ItemTable VALUES ('x', 'y')", []);
        assert!(res.is_err());
    }

    #[test]
    fn backoff_schedule_grows_and_caps() {
        assert_eq!(backoff_for(0), Duration::from_millis(100));
        assert_eq!(backoff_for(1), Duration::from_millis(400));
        assert_eq!(backoff_for(2), Duration::from_millis(1_600));
        assert_eq!(backoff_for(3), Duration::from_millis(1_600));
    }

    #[test]
    fn new_generations_respects_watermark_and_orders_by_time() {
        let generations = json!([
            {"unixMs": 300, "generationUUID": "c"},
            {"unixMs": 100, "generationUUID": "a"},
            {"unixMs": 200, "generationUUID": "b"}
        ]);
        let fresh = new_generations(&generations, 100);
        let ids: Vec<_> = fresh
            .iter()
            .map(|g| g["generationUUID"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn new_generations_empty_for_replaced_shorter_array() {
        // array shrank (ON CONFLICT REPLACE): positions are meaningless,
        // only the watermark decides
        let generations = json!([{"unixMs": 50, "generationUUID": "old"}]);
        assert!(new_generations(&generations, 100).is_empty());
    }

    #[test]
    fn new_generations_handles_non_array_input() {
        assert!(new_generations(&json!(null), 0).is_empty());
        assert!(new_generations(&json!({"k": "v"}), 0).is_empty());
    }

    #[test]
    fn diff_composers_classifies_changes() {
        let mut previous = HashMap::new();
        previous.insert(
            "c1".to_string(),
            json!({"composerId": "c1", "totalLinesAdded": 1, "isArchived": false}),
        );
        previous.insert(
            "c2".to_string(),
            json!({"composerId": "c2", "isArchived": false}),
        );

        let current = vec![
            json!({"composerId": "c1", "totalLinesAdded": 5, "isArchived": false}),
            json!({"composerId": "c2", "isArchived": true}),
            json!({"composerId": "c3", "unifiedMode": "agent"}),
        ];

        let changes = diff_composers(&previous, &current);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].event_type(), "composer_updated");
        assert_eq!(changes[1].event_type(), "composer_archived");
        assert_eq!(changes[2].event_type(), "composer_created");
    }

    #[test]
    fn diff_composers_ignores_unchanged() {
        let mut previous = HashMap::new();
        previous.insert("c1".to_string(), json!({"composerId": "c1"}));
        let current = vec![json!({"composerId": "c1"})];
        assert!(diff_composers(&previous, &current).is_empty());
    }

    #[test]
    fn composer_list_accepts_both_shapes() {
        let nested = json!({"allComposers": [{"composerId": "c1"}]});
        assert_eq!(composer_list(&nested).len(), 1);
        let bare = json!([{"composerId": "c1"}, {"composerId": "c2"}]);
        assert_eq!(composer_list(&bare).len(), 2);
        assert!(composer_list(&json!(null)).is_empty());
    }

    #[test]
    fn new_bubbles_returns_array_order() {
        let mut seen = HashSet::new();
        seen.insert("b1".to_string());
        let conversation = json!([
            {"bubbleId": "b1", "type": 1},
            {"bubbleId": "b2", "type": 2},
            {"bubbleId": "b3", "type": 1},
            {"noBubbleId": true}
        ]);
        let fresh = new_bubbles(&seen, &conversation);
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0]["bubbleId"], "b2");
        assert_eq!(fresh[1]["bubbleId"], "b3");
    }

    #[test]
    fn new_history_entries_keyed_by_resource() {
        let mut seen = HashSet::new();
        seen.insert("file:///a.rs".to_string());
        let entries = json!([
            {"editor": {"resource": "file:///a.rs"}},
            {"editor": {"resource": "file:///b.rs"}}
        ]);
        let fresh = new_history_entries(&seen, &entries);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].0, "file:///b.rs");
    }
}
