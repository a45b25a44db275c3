//! Mission job orchestration for a single autonomous vehicle
//!
//! Jobs arrive from a remote queue. Normal jobs run through the
//! download, upload, arm, fly and land pipeline one at a time; cancel jobs
//! interrupt whatever is running and send the vehicle home.

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod app;
pub mod coord;
pub mod download;
pub mod job;
pub mod logging;
pub mod state;
pub mod telemetry;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

// Re-exports for convenience
pub use crate::core::config::{Config, ConnectionType, CoordinatorConfig};
pub use crate::core::errors::{Phase, Result, SortieError};
pub use coord::{
    Collaborators, CoordinatorHandle, CoordinatorSnapshot, FlightController, JobCoordinator,
    JobQueue, MessageHandler, MissionDownloader, MissionExtractor, MissionProgress,
    StreamingService, TelemetryService,
};
pub use download::HttpDownloader;
pub use job::{Job, JobDescription, JobStatus, MissionMetadata, Operation};
pub use state::{Event, ExecutionState, IllegalTransition, StateMachine};
pub use telemetry::{TelemetryBuffer, TelemetryCollector, TelemetryPublisher, TelemetrySource};
