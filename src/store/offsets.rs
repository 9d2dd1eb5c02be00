use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::error::PipelineError;
use crate::models::Platform;

use super::traces::fmt_ts;
use super::Store;

/// Durable read position for one JSONL transcript file.
///
/// `line_offset` is a byte offset that always lands on a line boundary: the
/// tailer only advances it past fully-consumed lines, so partial trailing
/// bytes are re-read on the next cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileState {
    pub line_offset: u64,
    pub last_size: u64,
    /// mtime in unix milliseconds.
    pub last_mtime: i64,
    pub last_read_time: Option<DateTime<Utc>>,
}

/// Persisted change-detection watermark for one Cursor source key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorState {
    pub last_seen_unix_ms: i64,
    pub last_hash: Option<String>,
}

impl Store {
    pub fn get_file_state(&self, file_path: &str) -> Result<Option<FileState>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT line_offset, last_size, last_mtime, last_read_time
                 FROM claude_jsonl_offsets WHERE file_path = ?1",
                [file_path],
                |row| {
                    Ok(FileState {
                        line_offset: row.get::<_, i64>(0)? as u64,
                        last_size: row.get::<_, i64>(1)? as u64,
                        last_mtime: row.get(2)?,
                        last_read_time: row
                            .get::<_, Option<String>>(3)?
                            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                            .map(|dt| dt.with_timezone(&Utc)),
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Single-row atomic upsert; the tailer calls this once per consumed
    /// batch, after all events from that batch are enqueued.
    pub fn upsert_file_state(
        &self,
        file_path: &str,
        session_id: &str,
        agent_id: Option<&str>,
        state: &FileState,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO claude_jsonl_offsets
                (file_path, session_id, agent_id, line_offset, last_size,
                 last_mtime, last_read_time, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(file_path) DO UPDATE SET
                session_id = ?2,
                agent_id = ?3,
                line_offset = ?4,
                last_size = ?5,
                last_mtime = ?6,
                last_read_time = ?7,
                updated_at = ?8",
            params![
                file_path,
                session_id,
                agent_id,
                state.line_offset as i64,
                state.last_size as i64,
                state.last_mtime,
                state.last_read_time.as_ref().map(fmt_ts),
                fmt_ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Drop all offset rows for an ended session.
    pub fn delete_offsets_for_session(&self, session_id: &str) -> Result<usize, PipelineError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(
            "DELETE FROM claude_jsonl_offsets WHERE session_id = ?1",
            [session_id],
        )?)
    }

    pub fn get_last_sequence(&self, platform: Platform) -> Result<i64, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let seq = conn
            .query_row(
                "SELECT last_processed_sequence FROM analytics_processing_state
                 WHERE platform = ?1",
                [platform.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0))
    }

    pub fn set_last_sequence(&self, platform: Platform, seq: i64) -> Result<(), PipelineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO analytics_processing_state
                (platform, last_processed_sequence, last_processed_timestamp, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(platform) DO UPDATE SET
                last_processed_sequence = ?2,
                last_processed_timestamp = ?3,
                updated_at = ?3",
            params![platform.as_str(), seq, fmt_ts(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_monitor_state(
        &self,
        workspace_hash: &str,
        source_key: &str,
    ) -> Result<Option<MonitorState>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT last_seen_unix_ms, last_hash FROM cursor_monitor_state
                 WHERE workspace_hash = ?1 AND source_key = ?2",
                [workspace_hash, source_key],
                |row| {
                    Ok(MonitorState {
                        last_seen_unix_ms: row.get(0)?,
                        last_hash: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    pub fn upsert_monitor_state(
        &self,
        workspace_hash: &str,
        source_key: &str,
        state: &MonitorState,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cursor_monitor_state
                (workspace_hash, source_key, last_seen_unix_ms, last_hash, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(workspace_hash, source_key) DO UPDATE SET
                last_seen_unix_ms = ?3,
                last_hash = ?4,
                updated_at = ?5",
            params![
                workspace_hash,
                source_key,
                state.last_seen_unix_ms,
                state.last_hash,
                fmt_ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_state_round_trips() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_file_state("/tmp/a.jsonl").unwrap().is_none());

        let state = FileState {
            line_offset: 120,
            last_size: 140,
            last_mtime: 1_700_000_000_000,
            last_read_time: Some(Utc::now()),
        };
        store
            .upsert_file_state("/tmp/a.jsonl", "sess-1", None, &state)
            .unwrap();

        let read = store.get_file_state("/tmp/a.jsonl").unwrap().unwrap();
        assert_eq!(read.line_offset, 120);
        assert_eq!(read.last_size, 140);
        assert_eq!(read.last_mtime, 1_700_000_000_000);
        assert!(read.last_read_time.is_some());
    }

    #[test]
    fn upsert_overwrites_existing_row() {
        let store = Store::open_in_memory().unwrap();
        let mut state = FileState {
            line_offset: 10,
            ..Default::default()
        };
        store
            .upsert_file_state("/tmp/a.jsonl", "sess-1", None, &state)
            .unwrap();
        state.line_offset = 99;
        store
            .upsert_file_state("/tmp/a.jsonl", "sess-1", Some("agent-7"), &state)
            .unwrap();

        let read = store.get_file_state("/tmp/a.jsonl").unwrap().unwrap();
        assert_eq!(read.line_offset, 99);
    }

    #[test]
    fn delete_for_session_drops_only_that_session() {
        let store = Store::open_in_memory().unwrap();
        let state = FileState::default();
        store
            .upsert_file_state("/tmp/a.jsonl", "sess-1", None, &state)
            .unwrap();
        store
            .upsert_file_state("/tmp/b.jsonl", "sess-1", None, &state)
            .unwrap();
        store
            .upsert_file_state("/tmp/c.jsonl", "sess-2", None, &state)
            .unwrap();

        assert_eq!(store.delete_offsets_for_session("sess-1").unwrap(), 2);
        assert!(store.get_file_state("/tmp/a.jsonl").unwrap().is_none());
        assert!(store.get_file_state("/tmp/c.jsonl").unwrap().is_some());
    }

    #[test]
    fn last_sequence_defaults_to_zero_and_persists() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_last_sequence(Platform::Cursor).unwrap(), 0);
        store.set_last_sequence(Platform::Cursor, 42).unwrap();
        assert_eq!(store.get_last_sequence(Platform::Cursor).unwrap(), 42);
        assert_eq!(store.get_last_sequence(Platform::ClaudeCode).unwrap(), 0);
    }

    #[test]
    fn monitor_state_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let ws = "0123456789abcdef";
        assert!(store
            .get_monitor_state(ws, "aiService.generations")
            .unwrap()
            .is_none());

        store
            .upsert_monitor_state(
                ws,
                "aiService.generations",
                &MonitorState {
                    last_seen_unix_ms: 1_700_000_000_000,
                    last_hash: None,
                },
            )
            .unwrap();
        store
            .upsert_monitor_state(
                ws,
                "composer.composerData",
                &MonitorState {
                    last_seen_unix_ms: 0,
                    last_hash: Some("abc".into()),
                },
            )
            .unwrap();

        let gen = store
            .get_monitor_state(ws, "aiService.generations")
            .unwrap()
            .unwrap();
        assert_eq!(gen.last_seen_unix_ms, 1_700_000_000_000);
        let composers = store
            .get_monitor_state(ws, "composer.composerData")
            .unwrap()
            .unwrap();
        assert_eq!(composers.last_hash.as_deref(), Some("abc"));
    }
}
