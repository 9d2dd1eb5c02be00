//! Stream abstraction over the telemetry message queue.
//!
//! Production runs on Redis Streams; tests run on an in-process
//! implementation with the same at-least-once contract: per-group Pending
//! Entries Lists, broker-side delivery counters, approximate trimming.

mod memory;
mod redis;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::PipelineError;

pub const STREAM_EVENTS: &str = "telemetry:message_queue";
pub const STREAM_CDC: &str = "telemetry:cdc";
pub const STREAM_DLQ: &str = "telemetry:dlq";
pub const GROUP_PROCESSORS: &str = "processors";

/// Approximate per-stream retention.
pub const STREAM_MAXLEN: usize = 10_000;

/// Producers never wait longer than this for an append.
pub const APPEND_TIMEOUT: Duration = Duration::from_secs(1);

pub type Fields = Vec<(String, Vec<u8>)>;

#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: String,
    pub fields: Fields,
}

impl StreamMessage {
    pub fn field(&self, key: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }
}

/// Append-only log with consumer groups.
///
/// Delivery is at-least-once: a message read through a group stays in that
/// group's PEL until acked, and un-acked messages are redelivered to the
/// same consumer on its next read. The delivery counter lives broker-side so
/// it survives worker restarts.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Append fields to a stream; returns the assigned, strictly increasing
    /// stream id. Bounded by [`APPEND_TIMEOUT`].
    async fn append(&self, stream: &str, fields: Fields) -> Result<String, PipelineError>;

    /// Read up to `count` *new* messages for `consumer` in `group`, blocking
    /// up to `block_ms` when nothing is available. Delivered messages enter
    /// the group's PEL until acked.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, PipelineError>;

    /// Redeliver up to `count` of the consumer's own pending (delivered,
    /// un-acked) messages, oldest first, bumping their delivery counters.
    /// Consumers call this before reading new messages so nothing acked-less
    /// is left behind after a failed commit or a crash.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, PipelineError>;

    /// Remove a message from the group's PEL.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), PipelineError>;

    /// How many times a pending message has been delivered; 0 once acked or
    /// never delivered.
    async fn delivery_count(
        &self,
        stream: &str,
        group: &str,
        id: &str,
    ) -> Result<u64, PipelineError>;

    /// Approximate bounded retention of the fully-acked tail.
    async fn trim(&self, stream: &str, maxlen: usize) -> Result<(), PipelineError>;

    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), PipelineError>;
}
