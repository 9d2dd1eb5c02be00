use chrono::{SecondsFormat, Utc};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::error::PipelineError;
use crate::health::{HealthGate, Metrics};
use crate::models::Event;
use crate::queue::{
    MessageQueue, StreamMessage, GROUP_PROCESSORS, STREAM_CDC, STREAM_DLQ, STREAM_EVENTS,
    STREAM_MAXLEN,
};
use crate::store::Store;

const READ_COUNT: usize = 100;
const REDUCED_COUNT: usize = 50;
const BLOCK_MS: u64 = 1_000;

/// The batcher never holds a message longer than this before committing.
const BATCH_WINDOW: Duration = Duration::from_millis(50);

/// Delivery budget before a message is declared poison.
const MAX_DELIVERIES: u64 = 3;

const LATENCY_WINDOW: usize = 20;
const LATENCY_P95_TARGET: Duration = Duration::from_millis(50);
const PRESSURE_PAUSE: Duration = Duration::from_millis(500);

/// How many committed batches between stream trims.
const TRIM_EVERY: u64 = 64;

/// Fast-path consumer: pulls from the message queue, batches, and commits to
/// the unified store with ack/retry/DLQ semantics.
pub struct Consumer {
    queue: Arc<dyn MessageQueue>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    gate: HealthGate,
    name: String,
    read_count: usize,
    latencies: VecDeque<Duration>,
    last_error: Option<String>,
    commits: u64,
}

impl Consumer {
    pub fn new(queue: Arc<dyn MessageQueue>, store: Arc<Store>, metrics: Arc<Metrics>) -> Self {
        Consumer {
            queue,
            store,
            metrics,
            gate: HealthGate::new(),
            name: format!("consumer-{}", std::process::id()),
            read_count: READ_COUNT,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            last_error: None,
            commits: 0,
        }
    }

    pub async fn run(mut self, shutdown: tokio::sync::watch::Receiver<bool>) {
        if let Err(e) = self.queue.ensure_group(STREAM_EVENTS, GROUP_PROCESSORS).await {
            error!(error = %e, "cannot create consumer group");
        }
        info!(consumer = %self.name, "fast-path consumer started");

        while !*shutdown.borrow() {
            if self.gate.is_cooling() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            match self.run_cycle().await {
                Ok(_) => self.gate.record_success(),
                Err(e) => {
                    warn!(error = %e, "consumer cycle failed");
                    Metrics::incr(&self.metrics.poll_errors);
                    self.gate.record_failure();
                    self.last_error = Some(e.to_string());
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
        info!(consumer = %self.name, "fast-path consumer stopped");
    }

    /// One read-batch-commit cycle. Public so tests can drive the consumer
    /// deterministically without the run loop.
    pub async fn run_cycle(&mut self) -> Result<usize, PipelineError> {
        // Own un-acked messages first: a failed commit or a predecessor's
        // crash left them in the PEL.
        let redelivered = self
            .queue
            .read_pending(STREAM_EVENTS, GROUP_PROCESSORS, &self.name, self.read_count)
            .await?;
        if !redelivered.is_empty() {
            return self.process_batch(redelivered).await;
        }

        let mut messages = self
            .queue
            .read_group(
                STREAM_EVENTS,
                GROUP_PROCESSORS,
                &self.name,
                self.read_count,
                BLOCK_MS,
            )
            .await?;
        if messages.is_empty() {
            return Ok(0);
        }

        // Top up with new messages until the batch window closes or the
        // batch is full; nothing is held past the window before commit.
        let window_opened = Instant::now();
        while messages.len() < self.read_count {
            let remaining = BATCH_WINDOW.saturating_sub(window_opened.elapsed());
            if remaining.is_zero() {
                break;
            }
            let more = self
                .queue
                .read_group(
                    STREAM_EVENTS,
                    GROUP_PROCESSORS,
                    &self.name,
                    self.read_count - messages.len(),
                    remaining.as_millis() as u64,
                )
                .await?;
            if more.is_empty() {
                break;
            }
            messages.extend(more);
        }

        self.process_batch(messages).await
    }

    async fn process_batch(
        &mut self,
        messages: Vec<StreamMessage>,
    ) -> Result<usize, PipelineError> {
        // Messages over their delivery budget go terminal before we try again.
        let mut batch: Vec<(StreamMessage, Option<Event>)> = Vec::with_capacity(messages.len());
        for message in messages {
            let deliveries = self
                .queue
                .delivery_count(STREAM_EVENTS, GROUP_PROCESSORS, &message.id)
                .await?;
            if deliveries >= MAX_DELIVERIES {
                self.move_to_dlq(message, deliveries).await?;
                continue;
            }
            let event = match codec::decode_wire(&message.fields) {
                Ok(event) => Some(event),
                Err(e) => {
                    // undecodable: leave pending so the delivery counter
                    // climbs toward the DLQ budget
                    debug!(id = %message.id, error = %e, "wire decode failed");
                    self.last_error = Some(format!("decode: {e}"));
                    None
                }
            };
            batch.push((message, event));
        }

        let events: Vec<Event> = batch
            .iter()
            .filter_map(|(_, event)| event.clone())
            .collect();
        if events.is_empty() {
            self.metrics
                .consumer_lag
                .store(batch.len() as i64, Ordering::Relaxed);
            return Ok(0);
        }

        let started = Instant::now();
        let summary = match self.store.commit_events(&events) {
            Ok(summary) => summary,
            Err(e) => {
                // no ack: the whole batch stays pending for redelivery
                self.last_error = Some(e.to_string());
                self.metrics
                    .consumer_lag
                    .store(batch.len() as i64, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.observe_latency(started.elapsed());

        for (message, event) in &batch {
            if event.is_some() {
                self.queue
                    .ack(STREAM_EVENTS, GROUP_PROCESSORS, &message.id)
                    .await?;
            }
        }
        Metrics::add(&self.metrics.events_out, summary.inserted as u64);
        self.metrics.consumer_lag.store(0, Ordering::Relaxed);

        self.append_cdc(&summary).await;
        self.commits += 1;
        if self.commits % TRIM_EVERY == 0 {
            let _ = self.queue.trim(STREAM_EVENTS, STREAM_MAXLEN).await;
            let _ = self.queue.trim(STREAM_CDC, STREAM_MAXLEN).await;
        }

        if self.pressure_pause() {
            tokio::time::sleep(PRESSURE_PAUSE).await;
        }
        Ok(summary.inserted)
    }

    async fn move_to_dlq(
        &mut self,
        message: StreamMessage,
        deliveries: u64,
    ) -> Result<(), PipelineError> {
        warn!(id = %message.id, deliveries, "delivery budget exhausted, moving to DLQ");
        let mut fields = message.fields.clone();
        let error = self
            .last_error
            .clone()
            .unwrap_or_else(|| "delivery count exceeded".to_string());
        fields.push(("error".into(), error.into_bytes()));
        fields.push((
            "failed_at".into(),
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .into_bytes(),
        ));
        self.queue.append(STREAM_DLQ, fields).await?;
        self.queue
            .ack(STREAM_EVENTS, GROUP_PROCESSORS, &message.id)
            .await?;
        Metrics::incr(&self.metrics.events_to_dlq);
        Ok(())
    }

    /// Compact change record for downstream analytics consumers.
    async fn append_cdc(&self, summary: &crate::store::CommitSummary) {
        for (platform, range) in [
            ("cursor", summary.cursor_sequences),
            ("claude_code", summary.claude_sequences),
        ] {
            let Some((first, last)) = range else { continue };
            let fields = vec![
                ("platform".to_string(), platform.as_bytes().to_vec()),
                ("first_sequence".to_string(), first.to_string().into_bytes()),
                ("last_sequence".to_string(), last.to_string().into_bytes()),
            ];
            if let Err(e) = self.queue.append(STREAM_CDC, fields).await {
                debug!(error = %e, "cdc append failed");
            }
        }
    }

    fn observe_latency(&mut self, latency: Duration) {
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);

        let p95 = self.latency_p95();
        if p95 > LATENCY_P95_TARGET {
            if self.read_count != REDUCED_COUNT {
                warn!(p95_ms = p95.as_millis() as u64, "store latency high, reducing read count");
            }
            self.read_count = REDUCED_COUNT;
        } else {
            self.read_count = READ_COUNT;
        }
    }

    fn latency_p95(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<Duration> = self.latencies.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() * 95) / 100;
        sorted[idx.min(sorted.len() - 1)]
    }

    /// Latency climbing past twice the target pauses reads for a beat.
    fn pressure_pause(&self) -> bool {
        self.latency_p95() > LATENCY_P95_TARGET * 2
    }
}
