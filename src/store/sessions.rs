use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::error::PipelineError;

use super::traces::fmt_ts;
use super::Store;

/// One `cursor_sessions` row.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub id: String,
    pub external_session_id: String,
    pub workspace_hash: String,
    pub workspace_path: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub pid: Option<i64>,
    pub metadata: Option<String>,
}

impl Store {
    pub fn upsert_session(&self, row: &SessionRow) -> Result<(), PipelineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cursor_sessions
                (id, external_session_id, workspace_hash, workspace_path,
                 started_at, ended_at, pid, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(external_session_id) DO UPDATE SET
                workspace_hash = ?3,
                workspace_path = ?4,
                ended_at = ?6,
                pid = ?7,
                metadata = COALESCE(?8, metadata)",
            params![
                row.id,
                row.external_session_id,
                row.workspace_hash,
                row.workspace_path,
                row.started_at,
                row.ended_at,
                row.pid,
                row.metadata,
            ],
        )?;
        Ok(())
    }

    /// Mark a session ended now. Returns false when the session is unknown
    /// or already ended. The reason lands in the metadata JSON.
    pub fn end_session(
        &self,
        external_session_id: &str,
        reason: Option<&str>,
    ) -> Result<bool, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let metadata: Option<Option<String>> = conn
            .query_row(
                "SELECT metadata FROM cursor_sessions
                 WHERE external_session_id = ?1 AND ended_at IS NULL",
                [external_session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(metadata) = metadata else {
            return Ok(false);
        };

        let metadata = match reason {
            Some(reason) => {
                let mut value: serde_json::Value = metadata
                    .as_deref()
                    .and_then(|m| serde_json::from_str(m).ok())
                    .unwrap_or_else(|| serde_json::json!({}));
                value["end_reason"] = serde_json::Value::String(reason.to_string());
                Some(value.to_string())
            }
            None => metadata,
        };

        conn.execute(
            "UPDATE cursor_sessions SET ended_at = ?2, metadata = ?3
             WHERE external_session_id = ?1 AND ended_at IS NULL",
            params![external_session_id, fmt_ts(&Utc::now()), metadata],
        )?;
        Ok(true)
    }

    /// Close every still-open session for a workspace except the named one.
    /// Enforces the one-active-session-per-workspace invariant on conflict.
    pub fn close_other_workspace_sessions(
        &self,
        workspace_hash: &str,
        keep_external_id: &str,
    ) -> Result<usize, PipelineError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(
            "UPDATE cursor_sessions SET ended_at = ?3
             WHERE workspace_hash = ?1
               AND external_session_id != ?2
               AND ended_at IS NULL",
            params![workspace_hash, keep_external_id, fmt_ts(&Utc::now())],
        )?)
    }

    pub fn active_sessions(&self) -> Result<Vec<SessionRow>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, external_session_id, workspace_hash, workspace_path,
                    started_at, ended_at, pid, metadata
             FROM cursor_sessions WHERE ended_at IS NULL
             ORDER BY started_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SessionRow {
                    id: row.get(0)?,
                    external_session_id: row.get(1)?,
                    workspace_hash: row.get(2)?,
                    workspace_path: row.get(3)?,
                    started_at: row.get(4)?,
                    ended_at: row.get(5)?,
                    pid: row.get(6)?,
                    metadata: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn session_by_external_id(
        &self,
        external_session_id: &str,
    ) -> Result<Option<SessionRow>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, external_session_id, workspace_hash, workspace_path,
                        started_at, ended_at, pid, metadata
                 FROM cursor_sessions WHERE external_session_id = ?1",
                [external_session_id],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        external_session_id: row.get(1)?,
                        workspace_hash: row.get(2)?,
                        workspace_path: row.get(3)?,
                        started_at: row.get(4)?,
                        ended_at: row.get(5)?,
                        pid: row.get(6)?,
                        metadata: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(external: &str, workspace: &str) -> SessionRow {
        SessionRow {
            id: crate::models::stable_session_uuid(external).to_string(),
            external_session_id: external.to_string(),
            workspace_hash: workspace.to_string(),
            workspace_path: format!("/home/dev/{workspace}"),
            started_at: fmt_ts(&Utc::now()),
            ended_at: None,
            pid: Some(4242),
            metadata: None,
        }
    }

    #[test]
    fn upsert_and_fetch_by_external_id() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&row("curs_1_a", "ws1")).unwrap();

        let fetched = store.session_by_external_id("curs_1_a").unwrap().unwrap();
        assert_eq!(fetched.workspace_hash, "ws1");
        assert!(fetched.ended_at.is_none());
    }

    #[test]
    fn end_session_sets_ended_at_and_reason() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&row("curs_1_a", "ws1")).unwrap();

        assert!(store.end_session("curs_1_a", Some("stale_pid")).unwrap());
        let fetched = store.session_by_external_id("curs_1_a").unwrap().unwrap();
        assert!(fetched.ended_at.is_some());
        assert!(fetched.metadata.unwrap().contains("stale_pid"));

        // second end is a no-op
        assert!(!store.end_session("curs_1_a", None).unwrap());
    }

    #[test]
    fn end_unknown_session_returns_false() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.end_session("curs_none", None).unwrap());
    }

    #[test]
    fn workspace_conflict_closes_older_session() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&row("curs_1_a", "ws1")).unwrap();
        store.upsert_session(&row("curs_2_b", "ws1")).unwrap();

        let closed = store
            .close_other_workspace_sessions("ws1", "curs_2_b")
            .unwrap();
        assert_eq!(closed, 1);

        let active = store.active_sessions().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].external_session_id, "curs_2_b");
    }

    #[test]
    fn active_sessions_excludes_ended() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&row("curs_1_a", "ws1")).unwrap();
        store.upsert_session(&row("curs_2_b", "ws2")).unwrap();
        store.end_session("curs_1_a", None).unwrap();

        let active = store.active_sessions().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].workspace_hash, "ws2");
    }
}
