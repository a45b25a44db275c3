use async_trait::async_trait;

use crate::core::errors::Result;
use crate::telemetry::model::{Battery, Health, Position, VelocityNed};

/// Latest telemetry readings of the vehicle
///
/// Each call returns the next reading of the corresponding stream.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn position(&self) -> Result<Position>;

    async fn battery(&self) -> Result<Battery>;

    async fn health(&self) -> Result<Health>;

    async fn velocity_ned(&self) -> Result<VelocityNed>;

    /// Heading in degrees
    async fn heading(&self) -> Result<f64>;
}
