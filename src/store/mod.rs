//! Unified telemetry store.
//!
//! One SQLite database in WAL mode holds the raw traces for both platforms,
//! the session and conversation registries, and the durable offset/state
//! tables. All writes funnel through one mutex-guarded connection per
//! database file, respecting SQLite's single-writer model; readers may open
//! their own read-only connections.

mod offsets;
mod schema;
mod sessions;
mod traces;

pub use offsets::{FileState, MonitorState};
pub use sessions::SessionRow;
pub use traces::CommitSummary;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

use crate::error::PipelineError;

pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self, PipelineError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, PipelineError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, PipelineError> {
        // journal_mode returns a row; the rest are plain settings
        let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        schema::init_schema(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_dirs_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("telemetry.db");
        let store = Store::open(&path).unwrap();
        assert!(path.exists());

        let conn = store.conn.lock().unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(n >= 6, "expected full schema, found {n} tables");
    }

    #[test]
    fn pragmas_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("telemetry.db")).unwrap();
        let conn = store.conn.lock().unwrap();

        let journal: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal.to_lowercase(), "wal");

        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);

        let busy: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(busy, 5000);
    }

    #[test]
    fn conversations_check_constraint_enforced() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();

        // claude conversation with a session_id violates the CHECK
        let res = conn.execute(
            "INSERT INTO conversations (id, session_id, external_id, platform, started_at)
             VALUES ('c1', 'sess', 'x', 'claude_code', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(res.is_err());

        // claude conversation without a session is fine
        conn.execute(
            "INSERT INTO conversations (id, external_id, platform, started_at)
             VALUES ('c2', 'x', 'claude_code', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
    }
}
