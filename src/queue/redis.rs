use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamMaxlen, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tracing::debug;

use super::{Fields, MessageQueue, StreamMessage, APPEND_TIMEOUT};
use crate::error::PipelineError;

/// Redis Streams backend.
///
/// `ConnectionManager` reconnects on its own; every failure surfaces as a
/// transient error so callers apply their own drop/retry policy.
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let client = redis::Client::open(url)
            .map_err(|e| PipelineError::Config(format!("bad redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| PipelineError::TransientIo(format!("redis connect: {e}")))?;
        Ok(RedisQueue { conn })
    }

    fn transient(context: &str, e: redis::RedisError) -> PipelineError {
        PipelineError::TransientIo(format!("{context}: {e}"))
    }

    fn messages_from_reply(reply: StreamReadReply) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let mut fields: Fields = Vec::with_capacity(entry.map.len());
                for (name, value) in entry.map {
                    let bytes: Vec<u8> = redis::from_redis_value(value).unwrap_or_default();
                    fields.push((name, bytes));
                }
                out.push(StreamMessage {
                    id: entry.id,
                    fields,
                });
            }
        }
        out
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn append(&self, stream: &str, fields: Fields) -> Result<String, PipelineError> {
        let mut conn = self.conn.clone();
        let write = async move {
            conn.xadd::<_, _, _, _, String>(stream, "*", &fields)
                .await
        };
        match tokio::time::timeout(APPEND_TIMEOUT, write).await {
            Ok(Ok(id)) => Ok(id),
            Ok(Err(e)) => Err(Self::transient("xadd", e)),
            Err(_) => Err(PipelineError::TransientIo(format!(
                "xadd to {stream} timed out after {}ms",
                APPEND_TIMEOUT.as_millis()
            ))),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, PipelineError> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(|e| Self::transient("xreadgroup", e))?;
        Ok(Self::messages_from_reply(reply))
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, PipelineError> {
        let mut conn = self.conn.clone();
        // "0" reads this consumer's own history: the PEL, oldest first
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &["0"], &opts)
            .await
            .map_err(|e| Self::transient("xreadgroup pending", e))?;
        let pending = Self::messages_from_reply(reply);
        if !pending.is_empty() {
            debug!(stream, count = pending.len(), "redelivering pending entries");
        }
        Ok(pending)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(stream, group, &[id])
            .await
            .map_err(|e| Self::transient("xack", e))?;
        Ok(())
    }

    async fn delivery_count(
        &self,
        stream: &str,
        group: &str,
        id: &str,
    ) -> Result<u64, PipelineError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, id, id, 1)
            .await
            .map_err(|e| Self::transient("xpending", e))?;
        Ok(reply
            .ids
            .first()
            .map(|p| p.times_delivered as u64)
            .unwrap_or(0))
    }

    async fn trim(&self, stream: &str, maxlen: usize) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xtrim(stream, StreamMaxlen::Approx(maxlen))
            .await
            .map_err(|e| Self::transient("xtrim", e))?;
        Ok(())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        let created: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        match created {
            Ok(_) => Ok(()),
            // group already exists, we are re-attaching
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(Self::transient("xgroup create", e)),
        }
    }
}
