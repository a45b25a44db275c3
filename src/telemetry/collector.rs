//! Fixed-rate telemetry sampling into the shared buffer

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::coord::TelemetryService;
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::telemetry::buffer::TelemetryBuffer;
use crate::telemetry::model::{TelemetryData, Velocity};
use crate::telemetry::source::TelemetrySource;
use crate::telemetry::worker::{ServiceStats, Worker};

pub struct TelemetryCollector {
    device_name: String,
    source: Arc<dyn TelemetrySource>,
    interval: Duration,
    buffer: Arc<TelemetryBuffer>,
    stats: Arc<ServiceStats>,
    worker: Mutex<Option<Worker>>,
}

impl TelemetryCollector {
    /// Create a collector sampling `interval_hz` times per second
    pub fn new(
        device_name: impl Into<String>,
        source: Arc<dyn TelemetrySource>,
        interval_hz: u32,
        buffer: Arc<TelemetryBuffer>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            source,
            interval: Duration::from_secs_f64(1.0 / f64::from(interval_hz.max(1))),
            buffer,
            stats: Arc::new(ServiceStats::default()),
            worker: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config, source: Arc<dyn TelemetrySource>) -> Self {
        let buffer = Arc::new(TelemetryBuffer::new(
            config.coordinator.telemetry_buffer_capacity,
        ));
        Self::new(
            config.thing_name.clone(),
            source,
            config.telemetry_sample_interval,
            buffer,
        )
    }

    /// Buffer the publisher should drain
    pub fn buffer(&self) -> Arc<TelemetryBuffer> {
        self.buffer.clone()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn error_count(&self) -> u64 {
        self.stats.error_count()
    }

    pub fn last_error(&self) -> Option<String> {
        self.stats.last_error()
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// Take one combined sample from the source
    pub async fn sample(&self) -> Result<TelemetryData> {
        sample(&self.device_name, self.source.as_ref()).await
    }
}

async fn sample(device_name: &str, source: &dyn TelemetrySource) -> Result<TelemetryData> {
    let (position, battery, health, velocity, heading_deg) = tokio::try_join!(
        source.position(),
        source.battery(),
        source.health(),
        source.velocity_ned(),
        source.heading(),
    )?;

    Ok(TelemetryData {
        device_name: device_name.to_string(),
        timestamp: Utc::now(),
        position,
        battery,
        health,
        velocity: Velocity {
            ground_speed_ms: velocity.ground_speed(),
            heading_deg,
        },
    })
}

#[async_trait]
impl TelemetryService for TelemetryCollector {
    async fn start(&self) -> Result<()> {
        let mut slot = self.worker.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let device_name = self.device_name.clone();
        let source = self.source.clone();
        let buffer = self.buffer.clone();
        let stats = self.stats.clone();
        let interval = self.interval;

        *slot = Some(Worker::spawn(move |token| async move {
            loop {
                match sample(&device_name, source.as_ref()).await {
                    Ok(data) => {
                        if buffer.push(data).is_some() {
                            debug!("Telemetry buffer full, dropped oldest sample");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Telemetry sample failed");
                        stats.record_error(&e);
                    }
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
        info!(interval_ms = self.interval.as_millis() as u64, "Telemetry collector started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.shutdown("collector").await;
            info!(errors = self.stats.error_count(), "Telemetry collector stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTelemetrySource;

    fn collector(source: Arc<FakeTelemetrySource>, hz: u32, capacity: usize) -> TelemetryCollector {
        TelemetryCollector::new("drone-7", source, hz, Arc::new(TelemetryBuffer::new(capacity)))
    }

    #[test]
    fn test_initial_state() {
        let c = collector(Arc::new(FakeTelemetrySource::new()), 1, 100);
        assert_eq!(c.interval(), Duration::from_secs(1));
        assert_eq!(c.buffer().capacity(), 100);
        assert_eq!(c.error_count(), 0);
        assert!(c.last_error().is_none());
    }

    #[tokio::test]
    async fn test_sample_combines_readings() {
        let c = collector(Arc::new(FakeTelemetrySource::new()), 1, 100);
        let data = c.sample().await.unwrap();

        assert_eq!(data.device_name, "drone-7");
        assert_eq!(data.position.latitude_deg, 47.3977);
        assert_eq!(data.battery.voltage_v, 12.6);
        assert!(data.health.is_gyrometer_calibration_ok);
        assert_eq!(data.velocity.ground_speed_ms, 5.0);
        assert_eq!(data.velocity.heading_deg, 45.0);
    }

    #[tokio::test]
    async fn test_collects_while_running() {
        let c = collector(Arc::new(FakeTelemetrySource::new()), 50, 100);
        c.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        c.stop().await.unwrap();

        assert!(!c.buffer().is_empty());
        assert!(!c.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_halts_collection() {
        let c = collector(Arc::new(FakeTelemetrySource::new()), 50, 100);
        c.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        c.stop().await.unwrap();

        let size = c.buffer().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(c.buffer().len(), size);
    }

    #[tokio::test]
    async fn test_full_buffer_keeps_newest() {
        let c = collector(Arc::new(FakeTelemetrySource::new()), 200, 5);
        c.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        c.stop().await.unwrap();

        assert_eq!(c.buffer().len(), 5);
    }

    #[tokio::test]
    async fn test_sampling_errors_do_not_stop_collection() {
        let source = Arc::new(FakeTelemetrySource::new());
        source.fail_position_reads(1);
        let c = collector(source, 20, 100);

        c.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        c.stop().await.unwrap();

        assert_eq!(c.error_count(), 1);
        assert!(c.last_error().unwrap().contains("sensor"));
        assert!(!c.buffer().is_empty());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let c = collector(Arc::new(FakeTelemetrySource::new()), 10, 100);
        c.start().await.unwrap();
        c.start().await.unwrap();
        assert!(c.is_running().await);
        c.stop().await.unwrap();
        c.stop().await.unwrap();
        assert!(!c.is_running().await);
    }
}
