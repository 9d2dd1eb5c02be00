use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, TransactionBehavior};
use tracing::warn;

use crate::codec;
use crate::error::PipelineError;
use crate::models::{stable_session_uuid, ClaudeProjection, CursorProjection, Event, Platform};

use super::Store;

/// Result of one batch commit.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommitSummary {
    pub inserted: usize,
    /// Redeliveries swallowed by the `event_id` unique index.
    pub conflicts: usize,
    pub cursor_sequences: Option<(i64, i64)>,
    pub claude_sequences: Option<(i64, i64)>,
}

pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn validate(event: &Event) -> Result<(), PipelineError> {
    if event.event_type.trim().is_empty() {
        return Err(PipelineError::Validation("empty event_type".into()));
    }
    if event.external_session_id.trim().is_empty() {
        return Err(PipelineError::Validation("empty external_session_id".into()));
    }
    Ok(())
}

impl Store {
    /// Write a batch of events in one `BEGIN IMMEDIATE` transaction.
    ///
    /// Idempotent on `event_id`: redelivered events count as conflicts, not
    /// inserts. A validation failure rolls the whole batch back so the
    /// consumer's redelivery/DLQ policy decides what happens next.
    pub fn commit_events(&self, events: &[Event]) -> Result<CommitSummary, PipelineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut summary = CommitSummary::default();
        for event in events {
            validate(event)?;
            let blob = codec::encode_row_blob(event)
                .map_err(|e| PipelineError::Validation(format!("encoding event_data: {e}")))?;

            let inserted = match event.platform {
                Platform::Cursor => insert_cursor_trace(&tx, event, &blob)?,
                Platform::ClaudeCode => insert_claude_trace(&tx, event, &blob)?,
            };

            match inserted {
                Some(sequence) => {
                    summary.inserted += 1;
                    let range = match event.platform {
                        Platform::Cursor => &mut summary.cursor_sequences,
                        Platform::ClaudeCode => &mut summary.claude_sequences,
                    };
                    *range = Some(match range {
                        Some((first, _)) => (*first, sequence),
                        None => (sequence, sequence),
                    });
                    upsert_conversation(&tx, event)?;
                }
                None => summary.conflicts += 1,
            }
        }

        tx.commit()?;
        Ok(summary)
    }

    /// Row count of a platform's raw-trace table.
    pub fn trace_count(&self, platform: Platform) -> Result<i64, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let table = trace_table(platform);
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?)
    }

    /// All sequences of a platform's raw-trace table in commit order.
    pub fn trace_sequences(&self, platform: Platform) -> Result<Vec<i64>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let table = trace_table(platform);
        let mut stmt =
            conn.prepare(&format!("SELECT sequence FROM {table} ORDER BY sequence"))?;
        let seqs = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(seqs)
    }

    /// The compressed envelope for a stored event, if present.
    pub fn trace_blob(
        &self,
        platform: Platform,
        event_id: &str,
    ) -> Result<Option<Vec<u8>>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let table = trace_table(platform);
        let mut stmt =
            conn.prepare(&format!("SELECT event_data FROM {table} WHERE event_id = ?1"))?;
        let mut rows = stmt.query([event_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// `(sequence, event_type, bubble_id)` for every trace of one composer,
    /// in commit order. Part of the read-only query surface downstream
    /// consumers use.
    pub fn cursor_traces_for_composer(
        &self,
        composer_id: &str,
    ) -> Result<Vec<(i64, String, Option<String>)>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sequence, event_type, bubble_id FROM cursor_raw_traces
             WHERE composer_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt
            .query_map([composer_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `(event_type, generation_uuid, timestamp)` projections for a cursor
    /// trace row, for verification in tests and doctor output.
    pub fn cursor_trace_projection(
        &self,
        event_id: &str,
    ) -> Result<Option<(String, Option<String>, String)>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_type, generation_uuid, timestamp
             FROM cursor_raw_traces WHERE event_id = ?1",
        )?;
        let mut rows = stmt.query([event_id])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?))),
            None => Ok(None),
        }
    }
}

fn trace_table(platform: Platform) -> &'static str {
    match platform {
        Platform::Cursor => "cursor_raw_traces",
        Platform::ClaudeCode => "claude_raw_traces",
    }
}

fn insert_cursor_trace(
    tx: &rusqlite::Transaction<'_>,
    event: &Event,
    blob: &[u8],
) -> Result<Option<i64>, PipelineError> {
    // Projections come from the payload, never from the envelope, so a stale
    // producer-side projection cannot disagree with the stored payload.
    let p = CursorProjection::from_payload(&event.payload);
    let json_col = |v: &Option<serde_json::Value>| -> Option<String> {
        v.as_ref().map(|v| v.to_string())
    };

    let changed = tx.execute(
        "INSERT INTO cursor_raw_traces (
            event_id, external_session_id, workspace_hash, event_type, timestamp,
            event_date, event_hour, composer_id, bubble_id, generation_uuid,
            lines_added, lines_removed, token_count_up_until_here,
            relevant_files, capabilities_ran, capability_statuses, event_data
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
         ON CONFLICT(event_id) DO NOTHING",
        params![
            event.event_id.to_string(),
            event.external_session_id,
            event.workspace_hash,
            event.event_type,
            fmt_ts(&event.timestamp),
            event.timestamp.format("%Y-%m-%d").to_string(),
            event.timestamp.format("%H").to_string().parse::<i64>().ok(),
            p.composer_id,
            p.bubble_id,
            p.generation_uuid,
            p.lines_added,
            p.lines_removed,
            p.token_count_up_until_here,
            json_col(&p.relevant_files),
            json_col(&p.capabilities_ran),
            json_col(&p.capability_statuses),
            blob,
        ],
    )?;
    Ok((changed == 1).then(|| tx.last_insert_rowid()))
}

fn insert_claude_trace(
    tx: &rusqlite::Transaction<'_>,
    event: &Event,
    blob: &[u8],
) -> Result<Option<i64>, PipelineError> {
    let p = ClaudeProjection::from_payload(&event.payload);
    let changed = tx.execute(
        "INSERT INTO claude_raw_traces (
            event_id, external_session_id, event_type, timestamp,
            uuid, parent_uuid, request_id, agent_id,
            message_role, message_model, input_tokens, output_tokens,
            cache_creation_input_tokens, cache_read_input_tokens, tokens_used,
            cwd, git_branch, user_type, event_data
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
         ON CONFLICT(event_id) DO NOTHING",
        params![
            event.event_id.to_string(),
            event.external_session_id,
            event.event_type,
            fmt_ts(&event.timestamp),
            p.record_uuid,
            p.parent_uuid,
            p.request_id,
            p.agent_id,
            p.message_role,
            p.message_model,
            p.input_tokens,
            p.output_tokens,
            p.cache_creation_input_tokens,
            p.cache_read_input_tokens,
            p.tokens_used(),
            p.cwd,
            p.git_branch,
            p.user_type,
            blob,
        ],
    )?;
    Ok((changed == 1).then(|| tx.last_insert_rowid()))
}

/// Ensure a conversation row exists for the event's logical conversation.
///
/// Cursor conversations hang off a registered session; when the session is
/// not (yet) known the row is skipped rather than violating the CHECK
/// constraint; the next batch after session_start picks it up.
fn upsert_conversation(
    tx: &rusqlite::Transaction<'_>,
    event: &Event,
) -> Result<(), PipelineError> {
    let (external_id, session_id) = match event.platform {
        Platform::ClaudeCode => (event.external_session_id.clone(), None),
        Platform::Cursor => {
            let Some(composer_id) = event.payload["composerId"].as_str() else {
                return Ok(());
            };
            let session_id: Option<String> = tx
                .query_row(
                    "SELECT id FROM cursor_sessions WHERE external_session_id = ?1",
                    [&event.external_session_id],
                    |row| row.get(0),
                )
                .ok();
            let Some(session_id) = session_id else {
                warn!(
                    external_session_id = %event.external_session_id,
                    "no registered session for cursor conversation, skipping"
                );
                return Ok(());
            };
            (composer_id.to_string(), Some(session_id))
        }
    };

    let conv_id = stable_session_uuid(&format!(
        "{}:{}",
        event.platform.as_str(),
        external_id
    ))
    .to_string();
    tx.execute(
        "INSERT INTO conversations (id, session_id, external_id, platform, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(external_id, platform) DO NOTHING",
        params![
            conv_id,
            session_id,
            external_id,
            event.platform.as_str(),
            fmt_ts(&event.timestamp),
        ],
    )?;
    tx.execute(
        "UPDATE conversations SET message_count = message_count + 1
         WHERE external_id = ?1 AND platform = ?2",
        params![external_id, event.platform.as_str()],
    )?;
    Ok(())
}
