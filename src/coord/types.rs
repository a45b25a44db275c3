//! Messages exchanged with the coordinator's execution context
//!
//! Nothing outside the coordinator mutates its state directly. Callers and
//! the mission task send these messages and the coordinator applies them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::oneshot;

use crate::core::errors::Result;
use crate::state::{Event, ExecutionState};

/// Requests handled by the coordinator's run loop
#[derive(Debug)]
pub enum CoordinatorCommand {
    /// The job queue changed; peek it and decide what to do
    EvaluateIncomingJob,
    /// Toggle the live stream of the streaming subsystem
    SetStreaming { enabled: bool },
    /// Read-only view of coordinator state
    Snapshot {
        reply: oneshot::Sender<CoordinatorSnapshot>,
    },
    /// Cancel any mission, disconnect and leave the run loop
    Shutdown { reply: oneshot::Sender<()> },
}

/// Reports sent by the mission task back to its owner
#[derive(Debug)]
pub enum MissionReport {
    /// Ask the coordinator to apply a phase transition
    Transition {
        job_id: String,
        event: Event,
        reply: oneshot::Sender<Result<ExecutionState>>,
    },
    /// The mission file is extracted and ready for upload
    ArtifactReady { job_id: String, path: PathBuf },
}

/// Point-in-time copy of what the coordinator owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub state: ExecutionState,
    pub current_job_id: Option<String>,
    pub mission_artifact: Option<PathBuf>,
    pub mission_active: bool,
}

/// Payload of the streaming-control topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingControl {
    pub enabled: bool,
}
