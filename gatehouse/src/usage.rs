//! Usage records and the batched background writer
//!
//! The pipeline enqueues one record per request without ever blocking the
//! request path. A single long-lived worker drains the queue to the sink
//! in batches, waking when a full batch is buffered or the flush interval
//! elapses. When the queue is full the oldest record is shed and counted.
//! A failed batch write is retried once after a short back-off, then
//! dropped with a warning; the sink is required to be idempotent per
//! batch. On shutdown the worker drains what remains under a bounded
//! deadline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One request's outcome, appended to the usage log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub scope_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    pub caller_type: String,
    pub caller_id: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub latency_ms: u64,
    pub upstream_latency_ms: u64,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Durable batch append target for usage records
///
/// Implementations must be idempotent per batch: the buffer may deliver
/// the same batch twice after a failed-then-retried write.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn write_batch(&self, records: &[UsageRecord]) -> anyhow::Result<()>;
}

/// Buffer tuning knobs
#[derive(Debug, Clone)]
pub struct UsageBufferConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_delay: Duration,
    pub drain_deadline: Duration,
}

impl Default for UsageBufferConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 50,
            flush_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
            drain_deadline: Duration::from_secs(3),
        }
    }
}

/// Producer handle to the usage queue
///
/// Cloneable; all clones share the same queue and worker.
#[derive(Clone)]
pub struct UsageBuffer {
    queue: Arc<Mutex<VecDeque<UsageRecord>>>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
    batch_size: usize,
}

impl UsageBuffer {
    pub fn new(config: &UsageBufferConfig) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            dropped: Arc::new(AtomicU64::new(0)),
            capacity: config.queue_capacity.max(1),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Enqueue a record; never blocks
    ///
    /// When the queue is full the oldest record is shed so the newest
    /// outcome is always retained.
    pub fn enqueue(&self, record: UsageRecord) {
        let buffered = {
            let mut queue = match self.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(record);
            queue.len()
        };

        if buffered >= self.batch_size {
            self.notify.notify_one();
        }
    }

    /// Records shed because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Pull everything out of the queue, bypassing the worker
    #[cfg(test)]
    pub(crate) fn drain_records(&self) -> Vec<UsageRecord> {
        let mut queue = match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).collect()
    }

    /// Records currently buffered
    pub fn queued(&self) -> usize {
        match self.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Spawn the single flush worker
    ///
    /// The worker runs until `shutdown` is cancelled, then drains the
    /// remaining records within the configured deadline.
    pub fn spawn_worker(
        &self,
        sink: Arc<dyn UsageSink>,
        config: UsageBufferConfig,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = buffer.notify.notified() => {
                        buffer.flush(sink.as_ref(), &config, true).await;
                    }
                    _ = tokio::time::sleep(config.flush_interval) => {
                        buffer.flush(sink.as_ref(), &config, false).await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }

            let drained = tokio::time::timeout(
                config.drain_deadline,
                buffer.flush(sink.as_ref(), &config, false),
            )
            .await;
            if drained.is_err() {
                tracing::warn!(
                    remaining = buffer.queued(),
                    "usage drain deadline elapsed; records lost"
                );
            } else {
                tracing::info!("usage buffer drained");
            }
        })
    }

    /// Write queued records in batches
    ///
    /// With `only_full` set, partial batches stay buffered for the timer
    /// wake-up so short bursts produce a single batch write.
    async fn flush(&self, sink: &dyn UsageSink, config: &UsageBufferConfig, only_full: bool) {
        loop {
            let batch: Vec<UsageRecord> = {
                let mut queue = match self.queue.lock() {
                    Ok(queue) => queue,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if queue.is_empty() || (only_full && queue.len() < self.batch_size) {
                    return;
                }
                let take = queue.len().min(self.batch_size);
                queue.drain(..take).collect()
            };

            if let Err(first) = sink.write_batch(&batch).await {
                tracing::warn!(error = %first, batch = batch.len(), "usage batch write failed; retrying");
                tokio::time::sleep(config.retry_delay).await;
                if let Err(second) = sink.write_batch(&batch).await {
                    tracing::warn!(
                        error = %second,
                        batch = batch.len(),
                        "usage batch write failed twice; dropping batch"
                    );
                }
            }
        }
    }
}

/// Status recorded when the consumer disconnects before the response
/// completes
pub const STATUS_CLIENT_CLOSED: u16 = 499;

/// Drop guard guaranteeing exactly one usage record per request
///
/// The pipeline fills the record as stages progress and the response
/// body wrapper calls [`UsageGuard::finish`] once the response has been
/// fully emitted. If the guard is dropped early (consumer disconnect,
/// handler panic) the record is enqueued with status 499 and the latency
/// observed so far.
pub struct UsageGuard {
    buffer: UsageBuffer,
    record: Option<UsageRecord>,
    started: std::time::Instant,
}

impl UsageGuard {
    pub fn new(buffer: UsageBuffer, record: UsageRecord) -> Self {
        Self {
            buffer,
            record: Some(record),
            started: std::time::Instant::now(),
        }
    }

    /// The record under construction; `None` after completion
    pub fn record_mut(&mut self) -> Option<&mut UsageRecord> {
        self.record.as_mut()
    }

    /// Enqueue the final record after response emission
    pub fn finish(mut self, status_code: u16, response_bytes: u64) {
        if let Some(mut record) = self.record.take() {
            record.status_code = status_code;
            record.response_bytes = response_bytes;
            record.latency_ms = self.started.elapsed().as_millis() as u64;
            self.buffer.enqueue(record);
        }
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.status_code = STATUS_CLIENT_CLOSED;
            record.latency_ms = self.started.elapsed().as_millis() as u64;
            record.error = Some("client closed request".to_string());
            self.buffer.enqueue(record);
        }
    }
}

/// Sink appending records as JSON lines to a file
pub struct JsonlUsageSink {
    path: std::path::PathBuf,
}

impl JsonlUsageSink {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl UsageSink for JsonlUsageSink {
    async fn write_batch(&self, records: &[UsageRecord]) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut lines = String::new();
        for record in records {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{record, RecordingSink};
    use super::*;

    fn fast_config() -> UsageBufferConfig {
        UsageBufferConfig {
            queue_capacity: 100,
            batch_size: 5,
            flush_interval: Duration::from_millis(40),
            retry_delay: Duration::from_millis(10),
            drain_deadline: Duration::from_millis(500),
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn full_batch_triggers_immediate_flush() {
        let config = fast_config();
        let buffer = UsageBuffer::new(&config);
        let sink = RecordingSink::new();
        let shutdown = CancellationToken::new();
        let worker = buffer.spawn_worker(sink.clone(), config, shutdown.clone());

        for _ in 0..5 {
            buffer.enqueue(record(200));
        }
        wait_for(|| sink.batch_sizes() == vec![5]).await;

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn partial_batch_flushes_on_interval() {
        let config = fast_config();
        let buffer = UsageBuffer::new(&config);
        let sink = RecordingSink::new();
        let shutdown = CancellationToken::new();
        let worker = buffer.spawn_worker(sink.clone(), config, shutdown.clone());

        buffer.enqueue(record(200));
        buffer.enqueue(record(404));
        // Fewer than batch_size records: nothing until the timer fires
        wait_for(|| sink.batch_sizes().iter().sum::<usize>() == 2).await;

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn large_backlog_is_split_into_batches() {
        let config = fast_config();
        let buffer = UsageBuffer::new(&config);
        let sink = RecordingSink::new();
        let shutdown = CancellationToken::new();
        let worker = buffer.spawn_worker(sink.clone(), config, shutdown.clone());

        for _ in 0..12 {
            buffer.enqueue(record(200));
        }
        // ceil(12 / 5) = 3 batches once the timer picks up the remainder
        wait_for(|| {
            let sizes = sink.batch_sizes();
            sizes.iter().sum::<usize>() == 12 && sizes.len() == 3
        })
        .await;

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn queue_overflow_sheds_oldest() {
        let config = UsageBufferConfig {
            queue_capacity: 3,
            ..fast_config()
        };
        let buffer = UsageBuffer::new(&config);

        for status in [201, 202, 203, 204, 205] {
            buffer.enqueue(record(status));
        }

        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.queued(), 3);
        let statuses: Vec<u16> = buffer
            .queue
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.status_code)
            .collect();
        assert_eq!(statuses, vec![203, 204, 205]);
    }

    #[tokio::test]
    async fn failed_batch_is_retried_once_then_kept() {
        let config = fast_config();
        let buffer = UsageBuffer::new(&config);
        let sink = RecordingSink::failing(1);
        let shutdown = CancellationToken::new();
        let worker = buffer.spawn_worker(sink.clone(), config, shutdown.clone());

        for _ in 0..5 {
            buffer.enqueue(record(200));
        }
        wait_for(|| sink.batch_sizes() == vec![5]).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn batch_failing_twice_is_dropped() {
        let config = fast_config();
        let buffer = UsageBuffer::new(&config);
        let sink = RecordingSink::failing(2);
        let shutdown = CancellationToken::new();
        let worker = buffer.spawn_worker(sink.clone(), config, shutdown.clone());

        for _ in 0..5 {
            buffer.enqueue(record(200));
        }
        wait_for(|| sink.calls.load(Ordering::SeqCst) >= 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.batch_sizes().is_empty());
        assert_eq!(buffer.queued(), 0);

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_remaining_records() {
        let config = UsageBufferConfig {
            flush_interval: Duration::from_secs(3600),
            ..fast_config()
        };
        let buffer = UsageBuffer::new(&config);
        let sink = RecordingSink::new();
        let shutdown = CancellationToken::new();
        let worker = buffer.spawn_worker(sink.clone(), config, shutdown.clone());

        buffer.enqueue(record(200));
        buffer.enqueue(record(500));

        shutdown.cancel();
        worker.await.unwrap();
        assert_eq!(sink.batch_sizes(), vec![2]);
    }

    #[tokio::test]
    async fn guard_finish_enqueues_exactly_once() {
        let buffer = UsageBuffer::new(&fast_config());
        let guard = UsageGuard::new(buffer.clone(), record(0));

        guard.finish(200, 42);
        assert_eq!(buffer.queued(), 1);

        let queued = buffer.queue.lock().unwrap().pop_front().unwrap();
        assert_eq!(queued.status_code, 200);
        assert_eq!(queued.response_bytes, 42);
    }

    #[tokio::test]
    async fn dropped_guard_records_client_closed() {
        let buffer = UsageBuffer::new(&fast_config());
        let guard = UsageGuard::new(buffer.clone(), record(0));
        drop(guard);

        let queued = buffer.queue.lock().unwrap().pop_front().unwrap();
        assert_eq!(queued.status_code, STATUS_CLIENT_CLOSED);
        assert_eq!(queued.error.as_deref(), Some("client closed request"));
    }

    #[test]
    fn record_serializes_camel_case() {
        let json = serde_json::to_value(record(200)).unwrap();
        assert_eq!(json["scopeId"], "team-A");
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["upstreamLatencyMs"], 10);
        assert!(json.get("apiKeyId").is_none());
        assert!(json.get("error").is_none());
    }
}
