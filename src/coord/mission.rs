//! The mission task: one job's pipeline from download to landing
//!
//! Every collaborator call is raced against the task's cancellation token,
//! so a cancel surfaces at whichever suspension point the task is parked on.
//! State changes are requested from the coordinator, never applied here.

use futures::StreamExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coord::collaborators::Collaborators;
use crate::coord::types::MissionReport;
use crate::core::errors::{Phase, Result, SortieError};
use crate::job::{Job, JobStatus};
use crate::state::{Event, ExecutionState};

pub struct MissionTask {
    job_id: String,
    job: Job,
    collaborators: Collaborators,
    reports: mpsc::UnboundedSender<MissionReport>,
    token: CancellationToken,
    return_to_launch: bool,
}

impl MissionTask {
    pub fn new(
        job_id: impl Into<String>,
        job: Job,
        collaborators: Collaborators,
        reports: mpsc::UnboundedSender<MissionReport>,
        token: CancellationToken,
        return_to_launch: bool,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job,
            collaborators,
            reports,
            token,
            return_to_launch,
        }
    }

    /// Run the full pipeline
    ///
    /// Resolves to `Err(SortieError::Cancelled)` when the token fired.
    pub async fn run(self) -> Result<()> {
        self.guard(
            "mark in progress",
            self.collaborators
                .job_queue
                .update_job_status(&self.job_id, JobStatus::InProgress),
        )
        .await?;

        let artifact = self.download_mission().await?;
        self.execute_mission(&artifact).await
    }

    async fn download_mission(&self) -> Result<PathBuf> {
        self.transition(Event::Download).await?;

        info!(
            job_id = %self.job_id,
            url = %self.job.download_url,
            "Downloading mission"
        );
        let bundle = self
            .guard(
                "download",
                self.collaborators
                    .downloader
                    .download(&self.job.download_url, &self.job.download_path),
            )
            .await
            .map_err(|e| e.in_phase(Phase::Download))?;

        debug!(
            job_id = %self.job_id,
            bundle = %bundle.display(),
            "Download succeeded, extracting mission"
        );
        let extractor = self.collaborators.extractor.clone();
        let job = self.job.clone();
        let extraction = tokio::task::spawn_blocking(move || extractor.extract(&bundle, &job));
        let artifact = self
            .guard("extract", async move {
                match extraction.await {
                    Ok(result) => result,
                    Err(e) => Err(SortieError::internal(format!("extraction task failed: {}", e))),
                }
            })
            .await
            .map_err(|e| e.in_phase(Phase::Download))?;

        let _ = self.reports.send(MissionReport::ArtifactReady {
            job_id: self.job_id.clone(),
            path: artifact.clone(),
        });
        debug!(job_id = %self.job_id, artifact = %artifact.display(), "Mission file ready");
        Ok(artifact)
    }

    async fn execute_mission(&self, artifact: &Path) -> Result<()> {
        let flight = &self.collaborators.flight;

        self.transition(Event::Upload).await?;
        self.guard("connect", flight.connect())
            .await
            .map_err(|e| e.in_phase(Phase::Upload))?;
        info!(job_id = %self.job_id, "Connected to flight controller");

        self.guard("upload", flight.upload_mission(artifact, self.return_to_launch))
            .await
            .map_err(|e| e.in_phase(Phase::Upload))?;
        info!(job_id = %self.job_id, "Mission uploaded");

        self.transition(Event::Arm).await?;
        self.guard("arm", flight.arm())
            .await
            .map_err(|e| e.in_phase(Phase::Arm))?;
        info!(job_id = %self.job_id, "Vehicle armed");

        self.transition(Event::Fly).await?;
        self.guard("start mission", flight.start_mission())
            .await
            .map_err(|e| e.in_phase(Phase::Fly))?;
        info!(job_id = %self.job_id, "Mission started");

        self.guard(
            "mission info",
            self.collaborators
                .streaming
                .set_active_mission_info(&self.job.mission_uuid, &self.job.metadata),
        )
        .await
        .map_err(|e| e.in_phase(Phase::Fly))?;

        self.fly().await
    }

    /// Start the in-flight subsystems, monitor, and always stop them again
    async fn fly(&self) -> Result<()> {
        let c = &self.collaborators;

        debug!(job_id = %self.job_id, "Starting streaming and telemetry");
        let started = self
            .guard("start subsystems", async {
                tokio::try_join!(
                    c.streaming.start(),
                    c.telemetry_publisher.start(),
                    c.telemetry_collector.start(),
                )
                .map(|_| ())
            })
            .await;

        let outcome = match started {
            Ok(()) => self.guard("monitor", self.monitor_mission()).await,
            Err(e) => Err(e.in_phase(Phase::Fly)),
        };

        self.stop_subsystems().await;
        outcome
    }

    async fn stop_subsystems(&self) {
        let c = &self.collaborators;
        let (streaming, publisher, collector) = tokio::join!(
            c.streaming.stop(),
            c.telemetry_publisher.stop(),
            c.telemetry_collector.stop(),
        );

        for (name, result) in [
            ("streaming", streaming),
            ("telemetry publisher", publisher),
            ("telemetry collector", collector),
        ] {
            if let Err(e) = result {
                warn!(
                    job_id = %self.job_id,
                    subsystem = name,
                    error = %e,
                    "Failed to stop subsystem"
                );
            }
        }
    }

    async fn monitor_mission(&self) -> Result<()> {
        let mut progress = self.collaborators.flight.stream_mission_progress();

        while let Some(update) = progress.next().await {
            let update = update.map_err(|e| e.in_phase(Phase::Monitor))?;
            debug!(
                job_id = %self.job_id,
                current = update.current,
                total = update.total,
                "Mission progress"
            );

            if update.is_complete() {
                drop(progress);
                self.transition(Event::Complete).await?;
                info!(job_id = %self.job_id, "Mission complete, waiting for landing");
                return self.wait_for_landing().await;
            }
        }

        Err(SortieError::progress_stream("stream ended before the mission completed")
            .in_phase(Phase::Monitor))
    }

    async fn wait_for_landing(&self) -> Result<()> {
        let mut in_air = self.collaborators.flight.stream_in_air();

        while let Some(airborne) = in_air.next().await {
            if !airborne.map_err(|e| e.in_phase(Phase::Land))? {
                info!(job_id = %self.job_id, "Vehicle landed");
                self.transition(Event::Idle).await?;
                return Ok(());
            }
        }

        Err(SortieError::in_air_stream("stream ended before the vehicle landed")
            .in_phase(Phase::Land))
    }

    /// Ask the coordinator to apply `event`
    async fn transition(&self, event: Event) -> Result<ExecutionState> {
        let (reply, rx) = oneshot::channel();
        self.reports
            .send(MissionReport::Transition {
                job_id: self.job_id.clone(),
                event,
                reply,
            })
            .map_err(|_| SortieError::internal("coordinator stopped receiving mission reports"))?;

        self.guard(event.as_str(), async {
            match rx.await {
                Ok(result) => result,
                // the coordinator drops replies for missions it no longer owns
                Err(_) => Err(SortieError::cancelled(event.as_str())),
            }
        })
        .await
    }

    async fn guard<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SortieError::cancelled(operation)),
            result = fut => result,
        }
    }
}
