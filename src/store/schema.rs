use rusqlite::Connection;

use crate::error::PipelineError;

// Schema version (increment when changing table definitions)
pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), PipelineError> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS cursor_sessions (
            id TEXT PRIMARY KEY,
            external_session_id TEXT NOT NULL UNIQUE,
            workspace_hash TEXT NOT NULL,
            workspace_path TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            pid INTEGER,
            metadata TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_workspace
            ON cursor_sessions(workspace_hash);

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            session_id TEXT REFERENCES cursor_sessions(id),
            external_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            message_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE (external_id, platform),
            CHECK (
                (platform = 'cursor' AND session_id IS NOT NULL)
                OR (platform = 'claude_code' AND session_id IS NULL)
            )
        );

        CREATE TABLE IF NOT EXISTS cursor_raw_traces (
            sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            external_session_id TEXT NOT NULL,
            workspace_hash TEXT,
            event_type TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            event_date TEXT,
            event_hour INTEGER,
            composer_id TEXT,
            bubble_id TEXT,
            generation_uuid TEXT,
            lines_added INTEGER,
            lines_removed INTEGER,
            token_count_up_until_here INTEGER,
            relevant_files TEXT,
            capabilities_ran TEXT,
            capability_statuses TEXT,
            event_data BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cursor_traces_ts ON cursor_raw_traces(timestamp);
        CREATE INDEX IF NOT EXISTS idx_cursor_traces_session
            ON cursor_raw_traces(external_session_id);
        CREATE INDEX IF NOT EXISTS idx_cursor_traces_composer
            ON cursor_raw_traces(composer_id);

        CREATE TABLE IF NOT EXISTS claude_raw_traces (
            sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            external_session_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            uuid TEXT,
            parent_uuid TEXT,
            request_id TEXT,
            agent_id TEXT,
            message_role TEXT,
            message_model TEXT,
            input_tokens INTEGER,
            output_tokens INTEGER,
            cache_creation_input_tokens INTEGER,
            cache_read_input_tokens INTEGER,
            tokens_used INTEGER,
            cwd TEXT,
            git_branch TEXT,
            user_type TEXT,
            event_data BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_claude_traces_ts ON claude_raw_traces(timestamp);
        CREATE INDEX IF NOT EXISTS idx_claude_traces_session
            ON claude_raw_traces(external_session_id);
        CREATE INDEX IF NOT EXISTS idx_claude_traces_uuid ON claude_raw_traces(uuid);

        CREATE TABLE IF NOT EXISTS claude_jsonl_offsets (
            file_path TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            agent_id TEXT,
            line_offset INTEGER NOT NULL DEFAULT 0,
            last_size INTEGER NOT NULL DEFAULT 0,
            last_mtime INTEGER NOT NULL DEFAULT 0,
            last_read_time TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_offsets_session
            ON claude_jsonl_offsets(session_id);

        CREATE TABLE IF NOT EXISTS analytics_processing_state (
            platform TEXT PRIMARY KEY,
            last_processed_sequence INTEGER NOT NULL DEFAULT 0,
            last_processed_timestamp TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cursor_monitor_state (
            workspace_hash TEXT NOT NULL,
            source_key TEXT NOT NULL,
            last_seen_unix_ms INTEGER NOT NULL DEFAULT 0,
            last_hash TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (workspace_hash, source_key)
        );
        "#,
    )?;

    if current_version != SCHEMA_VERSION {
        conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])?;
    }

    Ok(())
}
