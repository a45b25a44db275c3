//! Batches buffered samples and publishes them to the telemetry topic

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::coord::{JobQueue, TelemetryService};
use crate::core::config::Config;
use crate::core::errors::{Result, SortieError};
use crate::telemetry::buffer::TelemetryBuffer;
use crate::telemetry::model::TelemetryData;
use crate::telemetry::worker::{ServiceStats, Worker};

/// Partial batches are flushed after this long without a new sample
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_millis(3500);

pub struct TelemetryPublisher {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

struct Shared {
    buffer: Arc<TelemetryBuffer>,
    queue: Arc<dyn JobQueue>,
    topic: String,
    batch_size: usize,
    idle_flush: Duration,
    stats: ServiceStats,
    published: AtomicU64,
}

impl TelemetryPublisher {
    pub fn new(
        buffer: Arc<TelemetryBuffer>,
        queue: Arc<dyn JobQueue>,
        topic: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self::with_idle_flush(buffer, queue, topic, batch_size, DEFAULT_IDLE_FLUSH)
    }

    pub fn with_idle_flush(
        buffer: Arc<TelemetryBuffer>,
        queue: Arc<dyn JobQueue>,
        topic: impl Into<String>,
        batch_size: usize,
        idle_flush: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer,
                queue,
                topic: topic.into(),
                batch_size: batch_size.max(1),
                idle_flush,
                stats: ServiceStats::default(),
                published: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &Config,
        buffer: Arc<TelemetryBuffer>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self::new(
            buffer,
            queue,
            config.telemetry_topic(),
            config.telemetry_sample_count,
        )
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn batch_size(&self) -> usize {
        self.shared.batch_size
    }

    /// Number of batches handed to the transport successfully
    pub fn published_batches(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.shared.stats.error_count()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.stats.last_error()
    }
}

impl Shared {
    async fn run(&self, token: tokio_util::sync::CancellationToken) {
        let mut batch: Vec<TelemetryData> = Vec::with_capacity(self.batch_size);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                sample = self.buffer.recv_timeout(self.idle_flush) => match sample {
                    Some(sample) => {
                        batch.push(sample);
                        if batch.len() >= self.batch_size {
                            self.publish_batch(std::mem::take(&mut batch)).await;
                        }
                    }
                    None if !batch.is_empty() => {
                        debug!(samples = batch.len(), "Idle timeout, flushing partial batch");
                        self.publish_batch(std::mem::take(&mut batch)).await;
                    }
                    None => {}
                },
            }
        }

        if !batch.is_empty() {
            self.publish_batch(batch).await;
        }
    }

    async fn publish_batch(&self, batch: Vec<TelemetryData>) {
        let payload = match serde_json::to_vec(&batch) {
            Ok(payload) => payload,
            Err(e) => {
                let e: SortieError = e.into();
                warn!(error = %e, "Failed to encode telemetry batch");
                self.stats.record_error(&e);
                return;
            }
        };

        match self.queue.publish(&self.topic, payload).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %self.topic, samples = batch.len(), "Telemetry batch published");
            }
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "Failed to publish telemetry batch");
                self.stats.record_error(&e);
            }
        }
    }
}

#[async_trait]
impl TelemetryService for TelemetryPublisher {
    async fn start(&self) -> Result<()> {
        let mut slot = self.worker.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let shared = self.shared.clone();
        *slot = Some(Worker::spawn(move |token| async move {
            shared.run(token).await;
        }));
        info!(
            topic = %self.shared.topic,
            batch_size = self.shared.batch_size,
            "Telemetry publisher started"
        );
        Ok(())
    }

    /// Stop and flush whatever is left in the current batch
    async fn stop(&self) -> Result<()> {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.shutdown("publisher").await;
            info!(batches = self.published_batches(), "Telemetry publisher stopped");
        }
        Ok(())
    }
}
