//! Coordinator - single owner of what is currently running
//!
//! The coordinator is an actor. Its `run` loop is the one execution context
//! in which the state machine, the active job id, the mission task handle and
//! the mission artifact path are read and mutated. Transport callbacks and
//! the mission task only ever send it messages.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coord::collaborators::{Collaborators, MessageHandler};
use crate::coord::mission::MissionTask;
use crate::coord::types::{
    CoordinatorCommand, CoordinatorSnapshot, MissionReport, StreamingControl,
};
use crate::core::config::Config;
use crate::core::errors::{Result, SortieError};
use crate::job::{Job, JobStatus, Operation};
use crate::state::{Event, ExecutionState, StateMachine};

/// The one in-flight mission task
struct ActiveMission {
    job_id: String,
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
    /// The landing transition was applied; only stop hooks remain
    landed: bool,
}

type MissionOutcome = std::result::Result<Result<()>, JoinError>;

/// How an interrupted task actually ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Interrupted,
    Completed,
    Failed,
}

/// Arbitrates between normal jobs and cancel interrupts
pub struct JobCoordinator {
    config: Config,
    collaborators: Collaborators,
    state: StateMachine,
    current_job_id: Option<String>,
    mission_artifact: Option<PathBuf>,
    active: Option<ActiveMission>,
    cmd_tx: mpsc::UnboundedSender<CoordinatorCommand>,
    cmd_rx: mpsc::UnboundedReceiver<CoordinatorCommand>,
    report_tx: mpsc::UnboundedSender<MissionReport>,
    report_rx: mpsc::UnboundedReceiver<MissionReport>,
}

impl JobCoordinator {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        Self {
            config,
            collaborators,
            state: StateMachine::new(),
            current_job_id: None,
            mission_artifact: None,
            active: None,
            cmd_tx,
            cmd_rx,
            report_tx,
            report_rx,
        }
    }

    /// Get a handle for talking to the coordinator from anywhere
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Connect, subscribe, and pick up whatever is already queued
    ///
    /// Only a job queue connection or subscription failure is returned.
    pub async fn start(&mut self) -> Result<()> {
        let queue = self.collaborators.job_queue.clone();

        queue.connect().await.map_err(|e| match e {
            SortieError::QueueConnection { .. } => e,
            other => SortieError::queue_connection(other.to_string()),
        })?;
        info!(endpoint = %self.config.endpoint, "Job queue connected");

        let handle = self.handle();
        let jobs_topic = self.config.job_notification_topic();
        queue.subscribe(&jobs_topic, handle.notification_handler()).await?;
        let streaming_topic = self.config.streaming_control_topic();
        queue
            .subscribe(&streaming_topic, handle.streaming_control_handler())
            .await?;
        debug!(jobs_topic = %jobs_topic, streaming_topic = %streaming_topic, "Subscribed");

        // jobs queued before we subscribed never produce a notification
        self.process_next_job().await;
        Ok(())
    }

    /// Main loop; returns after a shutdown request has been handled
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                (job_id, outcome) = wait_for_mission(&mut self.active) => {
                    self.finish_mission(job_id, outcome).await;
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                Some(report) = self.report_rx.recv() => {
                    self.apply_report(report);
                }
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: CoordinatorCommand) -> bool {
        match cmd {
            CoordinatorCommand::EvaluateIncomingJob => {
                if let Err(e) = self.evaluate_incoming_job().await {
                    error!(error = %e, category = e.category(), "Job evaluation failed");
                }
            }
            CoordinatorCommand::SetStreaming { enabled } => {
                if let Err(e) = self.collaborators.streaming.set_streaming_state(enabled).await {
                    warn!(enabled, error = %e, "Failed to change streaming state");
                }
            }
            CoordinatorCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            CoordinatorCommand::Shutdown { reply } => {
                self.stop().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            state: self.state.get_state(),
            current_job_id: self.current_job_id.clone(),
            mission_artifact: self.mission_artifact.clone(),
            mission_active: self.active.is_some(),
        }
    }

    /// Decide what an incoming queue change means
    async fn evaluate_incoming_job(&mut self) -> Result<()> {
        self.collect_finished_mission().await;
        let queue = self.collaborators.job_queue.clone();

        let Some(job_id) = queue.get_next_queued_job().await? else {
            debug!("No queued jobs");
            return Ok(());
        };
        let description = queue.describe_job(&job_id).await?;

        let state = self.state.get_state();
        // a freshly launched task has not reported its first transition yet
        let is_busy = state != ExecutionState::Idle || self.active.is_some();

        let Some(job) = queue.get_job_document(&description) else {
            if is_busy {
                warn!(
                    job_id = %job_id,
                    state = %state,
                    "Unparsable job document while busy, leaving it queued"
                );
            } else {
                // the normal flow rejects it so it stops blocking the queue
                self.process_next_job().await;
            }
            return Ok(());
        };
        let is_cancel = job.is_cancel();

        if is_cancel && is_busy {
            self.process_cancel_immediate(job_id).await;
        } else if !is_busy {
            if self.current_job_id.as_deref() == Some(job_id.as_str()) {
                debug!(
                    job_id = %job_id,
                    "Job already being processed, ignoring duplicate notification"
                );
            } else {
                self.process_next_job().await;
            }
        } else {
            info!(
                job_id = %job_id,
                active_job = ?self.current_job_id,
                state = %state,
                "Busy with another job, ignoring notification"
            );
        }
        Ok(())
    }

    /// Priority interrupt of whatever is running
    async fn process_cancel_immediate(&mut self, cancel_job_id: String) {
        if self.state.get_state() == ExecutionState::Cancelling {
            info!(cancel_job_id = %cancel_job_id, "Cancellation already in progress");
            self.publish_status(&cancel_job_id, JobStatus::Succeeded).await;
            return;
        }

        warn!(
            cancel_job_id = %cancel_job_id,
            interrupted_job = ?self.current_job_id,
            state = %self.state.get_state(),
            "Cancel job received, interrupting mission"
        );

        if let Some(event) = [Event::Cancel, Event::Emergency]
            .into_iter()
            .find(|e| self.state.can_trigger(*e))
        {
            let _ = self.state.trigger(event);
        }

        let settled = match self.active.take() {
            Some(mission) => {
                mission.token.cancel();
                let outcome = mission.handle.await;
                self.settle_interrupted(&mission.job_id, outcome).await
            }
            None => Settled::Interrupted,
        };

        if settled == Settled::Completed {
            info!("Mission already landed, no abort needed");
        } else {
            match self.collaborators.flight.cancel_mission().await {
                Ok(()) => info!("Return-to-launch abort issued"),
                Err(e) => error!(error = %e, "Failed to deliver return-to-launch abort"),
            }
        }

        if settled == Settled::Interrupted {
            if let Some(interrupted) = self.current_job_id.clone() {
                self.publish_status(&interrupted, JobStatus::Canceled).await;
            }
        }
        self.publish_status(&cancel_job_id, JobStatus::Succeeded).await;

        self.cleanup();
        self.schedule_evaluation();
    }

    /// Publish the outcome of a task that was told to stop
    ///
    /// A task can settle on its own between the cancel request and the token
    /// firing; its real outcome is published instead of CANCELED.
    async fn settle_interrupted(&mut self, job_id: &str, outcome: MissionOutcome) -> Settled {
        match outcome {
            Ok(Err(e)) if e.is_cancelled() => {
                debug!(job_id = %job_id, "Mission task acknowledged cancellation");
                Settled::Interrupted
            }
            Ok(Ok(())) => {
                info!(job_id = %job_id, "Mission task completed before observing the cancel");
                self.publish_status(job_id, JobStatus::Succeeded).await;
                Settled::Completed
            }
            Ok(Err(e)) => {
                self.fail_job(job_id, &e).await;
                Settled::Failed
            }
            Err(join_error) => {
                let e = SortieError::internal(format!("mission task aborted: {}", join_error));
                self.fail_job(job_id, &e).await;
                Settled::Failed
            }
        }
    }

    /// Run terminal bookkeeping for a task that ended but was not collected yet
    ///
    /// A task whose landing transition was applied is awaited here too: it
    /// has nothing left to do but stop its subsystems, and must not be
    /// mistaken for a mission that can still be interrupted.
    async fn collect_finished_mission(&mut self) {
        let settling = self
            .active
            .as_ref()
            .is_some_and(|m| m.landed || m.handle.is_finished());
        if !settling {
            return;
        }
        if let Some(mission) = self.active.take() {
            debug!(job_id = %mission.job_id, "Collecting settled mission task");
            let outcome = mission.handle.await;
            self.finish_mission(mission.job_id, outcome).await;
        }
    }

    /// Start the next queued job if nothing is running
    async fn process_next_job(&mut self) {
        if self.active.is_some() {
            warn!(
                active_job = ?self.current_job_id,
                "Mission task already active, not starting another"
            );
            return;
        }

        let next = match self.collaborators.job_queue.get_next_queued_job().await {
            Ok(next) => next,
            Err(e) => {
                error!(error = %e, "Failed to fetch next queued job");
                return;
            }
        };
        let Some(job_id) = next else {
            debug!("No queued jobs");
            return;
        };

        if let Err(e) = self.execute_job(job_id.clone()).await {
            error!(job_id = %job_id, error = %e, category = e.category(), "Job processing failed");
            if let Some(current) = self.current_job_id.clone() {
                self.publish_status(&current, JobStatus::Failed).await;
            }
            self.cleanup();
        }
    }

    /// Fetch, validate and dispatch one job
    async fn execute_job(&mut self, job_id: String) -> Result<()> {
        self.current_job_id = Some(job_id.clone());

        let queue = self.collaborators.job_queue.clone();
        let description = queue.describe_job(&job_id).await?;

        let Some(job) = queue.get_job_document(&description) else {
            warn!(job_id = %job_id, "Invalid job document, rejecting");
            self.current_job_id = None;
            self.publish_status(&job_id, JobStatus::Rejected).await;
            return Ok(());
        };

        match job.operation.clone() {
            Operation::Download => {
                self.launch_mission(job_id, job);
            }
            Operation::Cancel => {
                info!(job_id = %job_id, "Cancel requested while idle, nothing to interrupt");
                self.current_job_id = None;
                self.publish_status(&job_id, JobStatus::Succeeded).await;
            }
            Operation::Other(op) => {
                warn!(job_id = %job_id, operation = %op, "Unsupported operation, rejecting");
                self.current_job_id = None;
                self.publish_status(&job_id, JobStatus::Rejected).await;
            }
        }
        Ok(())
    }

    fn launch_mission(&mut self, job_id: String, job: Job) {
        info!(job_id = %job_id, mission_uuid = %job.mission_uuid, "Launching mission task");

        let token = CancellationToken::new();
        let task = MissionTask::new(
            job_id.clone(),
            job,
            self.collaborators.clone(),
            self.report_tx.clone(),
            token.clone(),
            self.config.coordinator.return_to_launch,
        );
        let handle = tokio::spawn(task.run());

        self.active = Some(ActiveMission {
            job_id,
            token,
            handle,
            landed: false,
        });
    }

    fn is_active_job(&self, job_id: &str) -> bool {
        self.active
            .as_ref()
            .is_some_and(|m| m.job_id == job_id && !m.token.is_cancelled())
    }

    /// Apply a report from the mission task
    ///
    /// Reports from a task that is no longer active are dropped, which the
    /// task observes as a cancellation.
    fn apply_report(&mut self, report: MissionReport) {
        match report {
            MissionReport::Transition { job_id, event, reply } => {
                if !self.is_active_job(&job_id) {
                    debug!(
                        job_id = %job_id,
                        event = %event,
                        "Dropping transition from inactive mission"
                    );
                    return;
                }
                let result = match self.state.trigger(event) {
                    Ok(_) => {
                        if event == Event::Idle {
                            if let Some(mission) = self.active.as_mut() {
                                mission.landed = true;
                            }
                        }
                        Ok(self.state.get_state())
                    }
                    Err(illegal) => {
                        error!(
                            job_id = %job_id,
                            error = %illegal,
                            "Illegal state transition requested"
                        );
                        Err(illegal.into())
                    }
                };
                let _ = reply.send(result);
            }
            MissionReport::ArtifactReady { job_id, path } => {
                if self.is_active_job(&job_id) {
                    self.mission_artifact = Some(path);
                }
            }
        }
    }

    /// Terminal bookkeeping for a mission task that settled on its own
    async fn finish_mission(&mut self, job_id: String, outcome: MissionOutcome) {
        self.active = None;

        match outcome {
            Ok(Ok(())) => {
                info!(job_id = %job_id, "Job completed successfully");
                self.publish_status(&job_id, JobStatus::Succeeded).await;
            }
            Ok(Err(e)) if e.is_cancelled() => {
                debug!(job_id = %job_id, "Mission task cancelled");
            }
            Ok(Err(e)) => self.fail_job(&job_id, &e).await,
            Err(join_error) => {
                let e = SortieError::internal(format!("mission task aborted: {}", join_error));
                self.fail_job(&job_id, &e).await;
            }
        }

        self.cleanup();
        self.schedule_evaluation();
    }

    async fn fail_job(&mut self, job_id: &str, e: &SortieError) {
        error!(
            job_id = %job_id,
            category = e.category(),
            phase = ?e.phase(),
            state = %self.state.get_state(),
            error = %e,
            "Job failed"
        );
        self.publish_status(job_id, JobStatus::Failed).await;
        if let Err(illegal) = self.state.trigger(Event::Error) {
            debug!(error = %illegal, "No error transition from current state");
        }
    }

    /// Return to a consistent idle state
    fn cleanup(&mut self) {
        self.state.force_reset();
        self.current_job_id = None;
        self.mission_artifact = None;
    }

    /// Look at the queue again once the current job is done
    fn schedule_evaluation(&self) {
        let _ = self.cmd_tx.send(CoordinatorCommand::EvaluateIncomingJob);
    }

    async fn publish_status(&self, job_id: &str, status: JobStatus) {
        match self
            .collaborators
            .job_queue
            .update_job_status(job_id, status)
            .await
        {
            Ok(()) => debug!(job_id = %job_id, status = %status, "Job status published"),
            Err(e) => error!(
                job_id = %job_id,
                status = %status,
                error = %e,
                "Failed to publish job status"
            ),
        }
    }

    /// Cancel the active task, disconnect, abort if airborne
    async fn stop(&mut self) {
        info!("Shutting down coordinator");
        let was_in_flight = self.state.get_state() == ExecutionState::InFlight;
        self.collect_finished_mission().await;

        if let Some(mission) = self.active.take() {
            mission.token.cancel();
            let outcome = mission.handle.await;
            if self.settle_interrupted(&mission.job_id, outcome).await == Settled::Interrupted {
                self.publish_status(&mission.job_id, JobStatus::Canceled).await;
            }
            self.cleanup();
        }

        if let Err(e) = self.collaborators.job_queue.disconnect().await {
            warn!(error = %e, "Failed to disconnect from job queue");
        }

        if was_in_flight {
            if let Err(e) = self.collaborators.flight.cancel_mission().await {
                error!(error = %e, "Failed to abort mission during shutdown");
            }
        }
        info!("Coordinator stopped");
    }
}

async fn wait_for_mission(active: &mut Option<ActiveMission>) -> (String, MissionOutcome) {
    match active {
        Some(mission) => {
            let outcome = (&mut mission.handle).await;
            (mission.job_id.clone(), outcome)
        }
        None => std::future::pending().await,
    }
}

/// Cloneable, thread-safe way into the coordinator's context
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    /// Ask the coordinator to evaluate the job queue
    ///
    /// Safe to call from any thread. Returns false once the coordinator is gone.
    pub fn notify_job(&self) -> bool {
        self.tx.send(CoordinatorCommand::EvaluateIncomingJob).is_ok()
    }

    pub fn set_streaming(&self, enabled: bool) -> bool {
        self.tx
            .send(CoordinatorCommand::SetStreaming { enabled })
            .is_ok()
    }

    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::Snapshot { reply })
            .map_err(|_| SortieError::internal("coordinator is not running"))?;
        rx.await
            .map_err(|_| SortieError::internal("coordinator dropped snapshot request"))
    }

    pub async fn state(&self) -> Result<ExecutionState> {
        Ok(self.snapshot().await?.state)
    }

    /// Stop the coordinator and wait until it has shut down
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::Shutdown { reply })
            .map_err(|_| SortieError::internal("coordinator is not running"))?;
        rx.await
            .map_err(|_| SortieError::internal("coordinator exited before acknowledging shutdown"))
    }

    /// Transport callback for the job-notification topic
    pub fn notification_handler(&self) -> MessageHandler {
        let handle = self.clone();
        Arc::new(move |topic: &str, _payload: &[u8]| {
            if !handle.notify_job() {
                warn!(topic = %topic, "Coordinator gone, dropping job notification");
            }
        })
    }

    /// Transport callback for the streaming-control topic
    pub fn streaming_control_handler(&self) -> MessageHandler {
        let handle = self.clone();
        Arc::new(move |topic: &str, payload: &[u8]| {
            match serde_json::from_slice::<StreamingControl>(payload) {
                Ok(control) => {
                    if !handle.set_streaming(control.enabled) {
                        warn!(topic = %topic, "Coordinator gone, dropping streaming control");
                    }
                }
                Err(e) => warn!(topic = %topic, error = %e, "Malformed streaming control message"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::Phase;
    use crate::test_support::{self, TestRig};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_malformed_document_is_rejected_without_state_change() {
        let rig = TestRig::new();
        rig.queue.enqueue("bad", json!({"operation": "DOWNLOAD"}));

        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());
        coordinator.evaluate_incoming_job().await.unwrap();

        assert_eq!(rig.queue.statuses_for("bad"), vec![JobStatus::Rejected]);
        assert_eq!(coordinator.state.get_state(), ExecutionState::Idle);
        assert!(coordinator.active.is_none());
        assert!(coordinator.current_job_id.is_none());
        assert!(coordinator.report_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsupported_operation_is_rejected() {
        let rig = TestRig::new();
        let mut doc = test_support::download_document("m1");
        doc["operation"] = json!("SURVEY");
        rig.queue.enqueue("odd", doc);

        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());
        coordinator.evaluate_incoming_job().await.unwrap();

        assert_eq!(rig.queue.statuses_for("odd"), vec![JobStatus::Rejected]);
        assert_eq!(coordinator.state.get_state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_while_idle_succeeds_without_abort() {
        let rig = TestRig::new();
        rig.queue.enqueue("c1", test_support::cancel_document());

        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());
        coordinator.evaluate_incoming_job().await.unwrap();

        assert_eq!(rig.queue.statuses_for("c1"), vec![JobStatus::Succeeded]);
        assert_eq!(rig.flight.cancel_count(), 0);
        assert_eq!(coordinator.state.get_state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn test_busy_normal_job_is_ignored() {
        let rig = TestRig::new();
        rig.queue.enqueue("j2", test_support::download_document("m2"));

        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());
        coordinator.state = StateMachine::with_state(ExecutionState::Uploading);
        coordinator.current_job_id = Some("j1".to_string());

        coordinator.evaluate_incoming_job().await.unwrap();
        coordinator.evaluate_incoming_job().await.unwrap();

        assert!(rig.queue.statuses_for("j2").is_empty());
        assert_eq!(coordinator.state.get_state(), ExecutionState::Uploading);
        assert_eq!(coordinator.current_job_id.as_deref(), Some("j1"));
    }

    #[tokio::test]
    async fn test_cancel_while_cancelling_does_not_abort_again() {
        let rig = TestRig::new();
        rig.queue.enqueue("c2", test_support::cancel_document());

        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());
        coordinator.state = StateMachine::with_state(ExecutionState::Cancelling);

        coordinator.evaluate_incoming_job().await.unwrap();

        assert_eq!(rig.queue.statuses_for("c2"), vec![JobStatus::Succeeded]);
        assert_eq!(rig.flight.cancel_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_without_task_still_aborts_and_resets() {
        let rig = TestRig::new();
        rig.queue.enqueue("c3", test_support::cancel_document());

        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());
        coordinator.state = StateMachine::with_state(ExecutionState::Completing);
        coordinator.current_job_id = Some("j1".to_string());

        coordinator.evaluate_incoming_job().await.unwrap();

        assert_eq!(rig.flight.cancel_count(), 1);
        assert_eq!(rig.queue.statuses_for("j1"), vec![JobStatus::Canceled]);
        assert_eq!(rig.queue.statuses_for("c3"), vec![JobStatus::Succeeded]);
        assert_eq!(coordinator.state.get_state(), ExecutionState::Idle);
        assert!(coordinator.current_job_id.is_none());
    }

    #[tokio::test]
    async fn test_abort_failure_does_not_block_reset() {
        let rig = TestRig::new();
        rig.flight.fail_on("cancel");
        rig.queue.enqueue("c4", test_support::cancel_document());

        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());
        coordinator.state = StateMachine::with_state(ExecutionState::Armed);
        coordinator.current_job_id = Some("j1".to_string());

        coordinator.evaluate_incoming_job().await.unwrap();

        assert_eq!(coordinator.state.get_state(), ExecutionState::Idle);
        assert_eq!(rig.queue.statuses_for("c4"), vec![JobStatus::Succeeded]);
    }

    #[tokio::test]
    async fn test_cancel_after_uncollected_landing_keeps_success() {
        let rig = TestRig::new();
        rig.queue.enqueue("j1", test_support::download_document("m1"));

        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());
        coordinator.process_next_job().await;

        // drive the task to completion without letting the run loop collect it
        for _ in 0..500 {
            if coordinator.active.as_ref().is_some_and(|m| m.handle.is_finished()) {
                break;
            }
            let wait = Duration::from_millis(10);
            let next = tokio::time::timeout(wait, coordinator.report_rx.recv()).await;
            if let Ok(Some(report)) = next {
                coordinator.apply_report(report);
            }
        }
        assert!(coordinator.active.as_ref().is_some_and(|m| m.handle.is_finished()));

        rig.queue.enqueue("c1", test_support::cancel_document());
        coordinator.evaluate_incoming_job().await.unwrap();

        assert_eq!(
            rig.queue.statuses_for("j1"),
            vec![JobStatus::InProgress, JobStatus::Succeeded]
        );
        assert_eq!(rig.queue.statuses_for("c1"), vec![JobStatus::Succeeded]);
        assert_eq!(rig.flight.cancel_count(), 0);
        assert_eq!(coordinator.state.get_state(), ExecutionState::Idle);
        assert!(coordinator.active.is_none());
    }

    #[tokio::test]
    async fn test_cancel_right_after_landing_transition_keeps_success() {
        let rig = TestRig::new();
        rig.queue.enqueue("j1", test_support::download_document("m1"));

        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());
        coordinator.process_next_job().await;

        // apply reports up to and including the landing transition, then stop
        for _ in 0..500 {
            if coordinator.active.as_ref().is_some_and(|m| m.landed) {
                break;
            }
            let wait = Duration::from_millis(10);
            let next = tokio::time::timeout(wait, coordinator.report_rx.recv()).await;
            if let Ok(Some(report)) = next {
                coordinator.apply_report(report);
            }
        }
        assert!(coordinator.active.as_ref().is_some_and(|m| m.landed));
        assert_eq!(coordinator.state.get_state(), ExecutionState::Idle);

        rig.queue.enqueue("c1", test_support::cancel_document());
        coordinator.evaluate_incoming_job().await.unwrap();

        assert_eq!(
            rig.queue.statuses_for("j1"),
            vec![JobStatus::InProgress, JobStatus::Succeeded]
        );
        assert_eq!(rig.queue.statuses_for("c1"), vec![JobStatus::Succeeded]);
        assert_eq!(rig.flight.cancel_count(), 0);
        assert_eq!((rig.publisher.stops(), rig.collector.stops()), (1, 1));
        assert!(coordinator.active.is_none());
    }

    #[tokio::test]
    async fn test_failure_fires_error_event_before_reset() {
        let rig = TestRig::new();
        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());
        coordinator.state = StateMachine::with_state(ExecutionState::Downloading);
        coordinator.current_job_id = Some("j1".to_string());
        coordinator.mission_artifact = Some(PathBuf::from("/tmp/m1/mission.plan"));

        let err = SortieError::download_forbidden("/etc/m1", "/tmp").in_phase(Phase::Download);
        coordinator.fail_job("j1", &err).await;

        assert_eq!(coordinator.state.get_state(), ExecutionState::Error);
        assert_eq!(rig.queue.statuses_for("j1"), vec![JobStatus::Failed]);

        coordinator.cleanup();
        assert_eq!(coordinator.state.get_state(), ExecutionState::Idle);
        assert!(coordinator.current_job_id.is_none());
        assert!(coordinator.mission_artifact.is_none());
    }

    #[tokio::test]
    async fn test_stale_transition_is_dropped() {
        let rig = TestRig::new();
        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());

        let (reply, rx) = oneshot::channel();
        coordinator.apply_report(MissionReport::Transition {
            job_id: "ghost".to_string(),
            event: Event::Download,
            reply,
        });

        assert!(rx.await.is_err());
        assert_eq!(coordinator.state.get_state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn test_start_fails_when_queue_unreachable() {
        let rig = TestRig::new();
        rig.queue.fail_connect();

        let mut coordinator = JobCoordinator::new(test_support::config(), rig.collaborators());
        let err = coordinator.start().await.unwrap_err();

        assert_eq!(err.category(), "queue_connection");
    }

    #[test]
    fn test_streaming_control_handler_parses_payload() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = CoordinatorHandle { tx };
        let handler = handle.streaming_control_handler();

        handler("devices/x/streaming", br#"{"enabled": true}"#);
        handler("devices/x/streaming", b"not json");

        match rx.try_recv() {
            Ok(CoordinatorCommand::SetStreaming { enabled }) => assert!(enabled),
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
