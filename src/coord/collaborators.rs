//! Contracts of the subsystems the coordinator drives
//!
//! Collaborators only ever receive read-only job data. None of them gets a
//! handle to coordinator state.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::errors::Result;
use crate::job::{Job, JobDescription, JobStatus, MissionMetadata};

/// Callback invoked by the transport when a message arrives on a topic
///
/// May be called from any thread, outside of the coordinator's context.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Remote job queue and its message transport
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Id of the oldest queued job, if any
    async fn get_next_queued_job(&self) -> Result<Option<String>>;

    async fn describe_job(&self, job_id: &str) -> Result<JobDescription>;

    /// Parse the document carried by a description
    fn get_job_document(&self, description: &JobDescription) -> Option<Job> {
        Job::from_document(&description.document)
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<()>;
}

/// Progress report of the mission running on the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissionProgress {
    pub current: u32,
    pub total: u32,
}

impl MissionProgress {
    pub fn new(current: u32, total: u32) -> Self {
        Self { current, total }
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.current >= self.total
    }
}

/// Command interface of the vehicle's flight controller
///
/// Connect and arm timeouts are the controller's own business.
#[async_trait]
pub trait FlightController: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn arm(&self) -> Result<()>;

    async fn upload_mission(&self, path: &Path, return_to_launch: bool) -> Result<()>;

    async fn start_mission(&self) -> Result<()>;

    /// Clear the mission and return to launch
    async fn cancel_mission(&self) -> Result<()>;

    /// Lazy progress stream, ends when the consumer drops it
    fn stream_mission_progress(&self) -> BoxStream<'static, Result<MissionProgress>>;

    fn stream_in_air(&self) -> BoxStream<'static, Result<bool>>;
}

/// Video detection and live streaming
#[async_trait]
pub trait StreamingService: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn set_streaming_state(&self, enabled: bool) -> Result<()>;

    async fn set_active_mission_info(
        &self,
        mission_uuid: &str,
        metadata: &MissionMetadata,
    ) -> Result<()>;
}

/// Anything the fly phase starts and stops alongside the mission
#[async_trait]
pub trait TelemetryService: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Fetches a mission bundle to local storage
#[async_trait]
pub trait MissionDownloader: Send + Sync {
    /// Returns the local path of the downloaded bundle
    async fn download(&self, url: &str, download_path: &str) -> Result<PathBuf>;
}

/// Unpacks a downloaded bundle into a mission file
///
/// Called on the blocking pool.
pub trait MissionExtractor: Send + Sync {
    fn extract(&self, bundle: &Path, job: &Job) -> Result<PathBuf>;
}

/// Everything a mission task needs, shared between coordinator and task
#[derive(Clone)]
pub struct Collaborators {
    pub job_queue: Arc<dyn JobQueue>,
    pub flight: Arc<dyn FlightController>,
    pub streaming: Arc<dyn StreamingService>,
    pub telemetry_publisher: Arc<dyn TelemetryService>,
    pub telemetry_collector: Arc<dyn TelemetryService>,
    pub downloader: Arc<dyn MissionDownloader>,
    pub extractor: Arc<dyn MissionExtractor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_completion() {
        assert!(MissionProgress::new(3, 3).is_complete());
        assert!(!MissionProgress::new(2, 3).is_complete());
        assert!(!MissionProgress::new(0, 0).is_complete());
    }
}
