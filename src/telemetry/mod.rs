//! Telemetry sampling and publishing during flight
//!
//! The collector samples a [`TelemetrySource`] into a bounded
//! [`TelemetryBuffer`]; the publisher drains it in batches onto the
//! telemetry topic. Both are started and stopped by the fly phase.

pub mod buffer;
pub mod collector;
pub mod model;
pub mod publisher;
pub mod source;
mod worker;

pub use buffer::TelemetryBuffer;
pub use collector::TelemetryCollector;
pub use model::*;
pub use publisher::{TelemetryPublisher, DEFAULT_IDLE_FLUSH};
pub use source::TelemetrySource;
pub use worker::ServiceStats;
