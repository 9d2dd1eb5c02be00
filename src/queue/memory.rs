use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{Fields, MessageQueue, StreamMessage};
use crate::error::PipelineError;

/// In-process queue with the same group/PEL semantics as the Redis backend.
///
/// Entries stay in the log until trimmed; trimming never removes an entry
/// that is still pending in any group.
pub struct MemoryQueue {
    inner: Mutex<HashMap<String, StreamState>>,
    notify: tokio::sync::Notify,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<Entry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

struct Entry {
    seq: u64,
    id: String,
    fields: Fields,
}

#[derive(Default)]
struct GroupState {
    last_delivered_seq: u64,
    pel: HashMap<String, Pending>,
}

struct Pending {
    seq: u64,
    consumer: String,
    delivery_count: u64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue {
            inner: Mutex::new(HashMap::new()),
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Total entries currently retained in a stream (test observability).
    pub fn len(&self, stream: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Pending (delivered, un-acked) count across all consumers of a group.
    pub fn pending_len(&self, stream: &str, group: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pel.len())
            .unwrap_or(0)
    }

    /// Deliver new entries past the group's read position.
    fn try_read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.entry(stream.to_string()).or_default();

        // split-borrow: group bookkeeping needs the entry list for lookups
        let entries = &state.entries;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| PipelineError::Validation(format!("no such group '{group}'")))?;

        let mut out = Vec::new();
        let start = group_state.last_delivered_seq;
        let mut last = start;
        for entry in entries.iter().filter(|e| e.seq > start).take(count) {
            group_state.pel.insert(
                entry.id.clone(),
                Pending {
                    seq: entry.seq,
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                },
            );
            last = entry.seq;
            out.push(StreamMessage {
                id: entry.id.clone(),
                fields: entry.fields.clone(),
            });
        }
        group_state.last_delivered_seq = last;
        Ok(out)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn append(&self, stream: &str, fields: Fields) -> Result<String, PipelineError> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.entry(stream.to_string()).or_default();
            state.next_seq += 1;
            let seq = state.next_seq;
            let id = format!("{}-{}", chrono::Utc::now().timestamp_millis(), seq);
            state.entries.push(Entry {
                seq,
                id: id.clone(),
                fields,
            });
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, PipelineError> {
        let messages = self.try_read_new(stream, group, consumer, count)?;
        if !messages.is_empty() || block_ms == 0 {
            return Ok(messages);
        }
        // One bounded wait, then a final attempt, mirroring XREADGROUP BLOCK.
        let _ = tokio::time::timeout(Duration::from_millis(block_ms), self.notify.notified()).await;
        self.try_read_new(stream, group, consumer, count)
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let entries = &state.entries;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| PipelineError::Validation(format!("no such group '{group}'")))?;

        let mut pending: Vec<(u64, String)> = group_state
            .pel
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .map(|(id, p)| (p.seq, id.clone()))
            .collect();
        pending.sort();

        let mut out = Vec::new();
        for (seq, id) in pending.into_iter().take(count) {
            let Some(entry) = entries.iter().find(|e| e.seq == seq) else {
                continue;
            };
            if let Some(p) = group_state.pel.get_mut(&id) {
                p.delivery_count += 1;
            }
            out.push(StreamMessage {
                id,
                fields: entry.fields.clone(),
            });
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(group_state) = inner
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            group_state.pel.remove(id);
        }
        Ok(())
    }

    async fn delivery_count(
        &self,
        stream: &str,
        group: &str,
        id: &str,
    ) -> Result<u64, PipelineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pel.get(id))
            .map(|p| p.delivery_count)
            .unwrap_or(0))
    }

    async fn trim(&self, stream: &str, maxlen: usize) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.get_mut(stream) else {
            return Ok(());
        };
        let excess = state.entries.len().saturating_sub(maxlen);
        if excess == 0 {
            return Ok(());
        }
        let protected: std::collections::HashSet<u64> = state
            .groups
            .values()
            .flat_map(|g| g.pel.values().map(|p| p.seq))
            .collect();
        let mut removed = 0;
        state.entries.retain(|e| {
            if removed < excess && !protected.contains(&e.seq) {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }
}
