//! In-memory doubles for every collaborator, for tests.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::coord::{
    Collaborators, CoordinatorHandle, FlightController, JobCoordinator, JobQueue, MessageHandler,
    MissionDownloader, MissionExtractor, MissionProgress, StreamingService, TelemetryService,
};
use crate::core::config::{Config, ConnectionType, CoordinatorConfig};
use crate::core::errors::{Result, SortieError};
use crate::job::{Job, JobDescription, JobStatus, MissionMetadata};
use crate::telemetry::{
    Battery, Health, Position, TelemetryData, TelemetrySource, Velocity, VelocityNed,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `condition` until it holds or five seconds pass
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Deterministic configuration; credentials are not checked
pub fn config() -> Config {
    Config {
        verbose: false,
        endpoint: "iot.test.local".to_string(),
        thing_name: "test-drone".to_string(),
        drone_address: "127.0.0.1".to_string(),
        drone_port: 14540,
        drone_connection_type: ConnectionType::Udp,
        cert_filepath: PathBuf::from("/dev/null"),
        pri_key_filepath: PathBuf::from("/dev/null"),
        ca_filepath: PathBuf::from("/dev/null"),
        telemetry_sample_interval: 10,
        telemetry_sample_count: 5,
        stream_sample_rate: 5,
        stream_port: 5600,
        download_root: PathBuf::from("/tmp"),
        coordinator: CoordinatorConfig::default(),
    }
}

pub fn download_document(mission_uuid: &str) -> Value {
    json!({
        "operation": "DOWNLOAD",
        "mission_uuid": mission_uuid,
        "download_url": format!("https://missions.test/{}.zip", mission_uuid),
        "download_path": format!("/tmp/sortie-test/{}", mission_uuid),
        "metadata": {"outpost": "north", "group": "alpha", "bucket": "missions"}
    })
}

pub fn cancel_document() -> Value {
    json!({
        "operation": "CANCEL",
        "mission_uuid": "",
        "download_url": "",
        "download_path": "",
        "metadata": {"outpost": "north", "group": "alpha", "bucket": "missions"}
    })
}

/// A sample whose latitude identifies it
pub fn telemetry_sample(latitude_deg: f64) -> TelemetryData {
    TelemetryData {
        device_name: "test-drone".to_string(),
        timestamp: Utc::now(),
        position: Position {
            latitude_deg,
            longitude_deg: 8.5456,
            relative_altitude_m: 10.5,
        },
        battery: FakeTelemetrySource::BATTERY,
        health: FakeTelemetrySource::HEALTH,
        velocity: Velocity {
            ground_speed_ms: 5.0,
            heading_deg: 45.0,
        },
    }
}

/// Build a coordinator, start it and spawn its run loop
pub async fn start_coordinator(
    config: Config,
    collaborators: Collaborators,
) -> Result<(CoordinatorHandle, JoinHandle<Result<()>>)> {
    let mut coordinator = JobCoordinator::new(config, collaborators);
    coordinator.start().await?;
    let handle = coordinator.handle();
    let task = tokio::spawn(coordinator.run());
    Ok((handle, task))
}

#[derive(Default)]
struct QueueState {
    connected: bool,
    fail_connect: bool,
    fail_publish: bool,
    disconnects: usize,
    queued: VecDeque<String>,
    documents: Vec<(String, Value)>,
    statuses: Vec<(String, JobStatus)>,
    handlers: Vec<(String, MessageHandler)>,
    published: Vec<(String, Vec<u8>)>,
}

/// Job queue whose transport callbacks run on a foreign thread
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job without notifying anyone
    pub fn enqueue(&self, job_id: &str, document: Value) {
        let mut state = lock(&self.state);
        state.queued.push_back(job_id.to_string());
        state.documents.push((job_id.to_string(), document));
    }

    /// Queue a job and fire the job-notification callback
    pub fn submit(&self, job_id: &str, document: Value) {
        self.enqueue(job_id, document);
        self.notify_jobs();
    }

    pub fn fail_connect(&self) {
        lock(&self.state).fail_connect = true;
    }

    pub fn fail_publish(&self) {
        lock(&self.state).fail_publish = true;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn disconnect_count(&self) -> usize {
        lock(&self.state).disconnects
    }

    pub fn queued(&self) -> Vec<String> {
        lock(&self.state).queued.iter().cloned().collect()
    }

    pub fn statuses(&self) -> Vec<(String, JobStatus)> {
        lock(&self.state).statuses.clone()
    }

    pub fn statuses_for(&self, job_id: &str) -> Vec<JobStatus> {
        lock(&self.state)
            .statuses
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn has_status(&self, job_id: &str, status: JobStatus) -> bool {
        self.statuses_for(job_id).contains(&status)
    }

    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        lock(&self.state)
            .handlers
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Deliver a message the way a transport thread would
    ///
    /// Returns false when nothing is subscribed to `topic`.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        let handler = lock(&self.state)
            .handlers
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, handler)| handler.clone());
        let Some(handler) = handler else {
            return false;
        };

        let topic = topic.to_string();
        let payload = payload.to_vec();
        std::thread::spawn(move || handler(&topic, &payload))
            .join()
            .is_ok()
    }

    pub fn notify_jobs(&self) -> bool {
        let topic = lock(&self.state)
            .handlers
            .iter()
            .map(|(topic, _)| topic.clone())
            .find(|topic| topic.ends_with("/jobs/notify"));
        match topic {
            Some(topic) => self.deliver(&topic, b"{}"),
            None => false,
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn connect(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_connect {
            return Err(SortieError::queue_connection("endpoint unreachable"));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        lock(&self.state).handlers.push((topic.to_string(), handler));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_publish {
            return Err(SortieError::queue("publish", "broker rejected message"));
        }
        state.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn get_next_queued_job(&self) -> Result<Option<String>> {
        Ok(lock(&self.state).queued.front().cloned())
    }

    async fn describe_job(&self, job_id: &str) -> Result<JobDescription> {
        lock(&self.state)
            .documents
            .iter()
            .find(|(id, _)| id == job_id)
            .map(|(id, document)| JobDescription::new(id.clone(), document.clone()))
            .ok_or_else(|| SortieError::queue("describe_job", format!("unknown job {}", job_id)))
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let mut state = lock(&self.state);
        state.statuses.push((job_id.to_string(), status));
        // only QUEUED jobs are offered as next
        if status != JobStatus::Queued {
            state.queued.retain(|id| id != job_id);
        }
        Ok(())
    }
}

struct FlightState {
    calls: Vec<&'static str>,
    failing: HashSet<&'static str>,
    progress: Vec<MissionProgress>,
    hold_progress: bool,
    in_air: Vec<bool>,
    uploaded: Option<(PathBuf, bool)>,
}

/// Scripted flight controller
///
/// By default the mission reports three waypoints and then lands.
pub struct FakeFlightController {
    state: Mutex<FlightState>,
}

impl Default for FakeFlightController {
    fn default() -> Self {
        Self {
            state: Mutex::new(FlightState {
                calls: Vec::new(),
                failing: HashSet::new(),
                progress: vec![
                    MissionProgress::new(1, 3),
                    MissionProgress::new(2, 3),
                    MissionProgress::new(3, 3),
                ],
                hold_progress: false,
                in_air: vec![true, false],
                uploaded: None,
            }),
        }
    }
}

impl FakeFlightController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an operation fail: connect, arm, upload, start, cancel, progress or in_air
    pub fn fail_on(&self, operation: &'static str) {
        lock(&self.state).failing.insert(operation);
    }

    /// Report some progress and then stay in flight forever
    pub fn hold_in_flight(&self) {
        let mut state = lock(&self.state);
        state.progress = vec![MissionProgress::new(1, 3)];
        state.hold_progress = true;
    }

    pub fn set_progress(&self, progress: Vec<MissionProgress>) {
        lock(&self.state).progress = progress;
    }

    pub fn set_in_air(&self, in_air: Vec<bool>) {
        lock(&self.state).in_air = in_air;
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.state).calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| **c == operation)
            .count()
    }

    pub fn cancel_count(&self) -> usize {
        self.call_count("cancel")
    }

    pub fn uploaded(&self) -> Option<(PathBuf, bool)> {
        lock(&self.state).uploaded.clone()
    }

    fn record(&self, operation: &'static str) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(operation);
        if !state.failing.contains(operation) {
            return Ok(());
        }
        Err(match operation {
            "connect" => SortieError::connection("no heartbeat"),
            "arm" => SortieError::arm("pre-arm checks failed"),
            "upload" => SortieError::upload("mission rejected"),
            "start" => SortieError::mission_start("mode change denied"),
            "cancel" => SortieError::mission_cancel("link lost"),
            "progress" => SortieError::progress_stream("telemetry link lost"),
            "in_air" => SortieError::in_air_stream("telemetry link lost"),
            other => SortieError::internal(format!("{} failed", other)),
        })
    }
}

#[async_trait]
impl FlightController for FakeFlightController {
    async fn connect(&self) -> Result<()> {
        self.record("connect")
    }

    async fn arm(&self) -> Result<()> {
        self.record("arm")
    }

    async fn upload_mission(&self, path: &Path, return_to_launch: bool) -> Result<()> {
        self.record("upload")?;
        lock(&self.state).uploaded = Some((path.to_path_buf(), return_to_launch));
        Ok(())
    }

    async fn start_mission(&self) -> Result<()> {
        self.record("start")
    }

    async fn cancel_mission(&self) -> Result<()> {
        self.record("cancel")
    }

    fn stream_mission_progress(&self) -> BoxStream<'static, Result<MissionProgress>> {
        if let Err(e) = self.record("progress") {
            return stream::iter(vec![Err(e)]).boxed();
        }
        let (progress, hold) = {
            let state = lock(&self.state);
            (state.progress.clone(), state.hold_progress)
        };
        let script = stream::iter(progress.into_iter().map(Ok));
        if hold {
            script.chain(stream::pending()).boxed()
        } else {
            script.boxed()
        }
    }

    fn stream_in_air(&self) -> BoxStream<'static, Result<bool>> {
        if let Err(e) = self.record("in_air") {
            return stream::iter(vec![Err(e)]).boxed();
        }
        let in_air = lock(&self.state).in_air.clone();
        stream::iter(in_air.into_iter().map(Ok)).boxed()
    }
}

/// Records every streaming call in order
#[derive(Default)]
pub struct FakeStreamingService {
    events: Mutex<Vec<String>>,
    fail_start: AtomicBool,
}

impl FakeStreamingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    fn push(&self, event: String) {
        lock(&self.events).push(event);
    }
}

#[async_trait]
impl StreamingService for FakeStreamingService {
    async fn start(&self) -> Result<()> {
        self.push("start".to_string());
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SortieError::internal("no camera detected"));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.push("stop".to_string());
        Ok(())
    }

    async fn set_streaming_state(&self, enabled: bool) -> Result<()> {
        self.push(format!("streaming:{}", enabled));
        Ok(())
    }

    async fn set_active_mission_info(
        &self,
        mission_uuid: &str,
        metadata: &MissionMetadata,
    ) -> Result<()> {
        self.push(format!("mission:{}:{}", mission_uuid, metadata.bucket));
        Ok(())
    }
}

/// Counts start and stop calls
#[derive(Default)]
pub struct FakeTelemetryService {
    starts: AtomicUsize,
    stops: AtomicUsize,
    running: AtomicBool,
}

impl FakeTelemetryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetryService for FakeTelemetryService {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Downloader that never touches the network or the filesystem
pub struct FakeDownloader {
    requests: Mutex<Vec<(String, String)>>,
    held: AtomicBool,
    gate: Semaphore,
    fail: AtomicBool,
}

impl Default for FakeDownloader {
    fn default() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
            fail: AtomicBool::new(false),
        }
    }
}

impl FakeDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block downloads until [`FakeDownloader::release`] is called
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.add_permits(1);
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl MissionDownloader for FakeDownloader {
    async fn download(&self, url: &str, download_path: &str) -> Result<PathBuf> {
        lock(&self.requests).push((url.to_string(), download_path.to_string()));

        if self.held.load(Ordering::SeqCst) {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| SortieError::internal(e.to_string()))?;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SortieError::download(url, "connection reset"));
        }
        Ok(Path::new(download_path).join("mission.bundle.zip"))
    }
}

/// Maps a bundle to a sibling `mission.plan`
#[derive(Default)]
pub struct FakeExtractor {
    extractions: AtomicUsize,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }
}

impl MissionExtractor for FakeExtractor {
    fn extract(&self, bundle: &Path, _job: &Job) -> Result<PathBuf> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        Ok(bundle.with_file_name("mission.plan"))
    }
}

/// Fixed readings; position reads can be made to fail
#[derive(Default)]
pub struct FakeTelemetrySource {
    failing_position_reads: AtomicUsize,
}

impl FakeTelemetrySource {
    pub const BATTERY: Battery = Battery {
        temperature_degc: 25.0,
        voltage_v: 12.6,
        remaining_percent: 85.0,
    };

    pub const HEALTH: Health = Health {
        is_gyrometer_calibration_ok: true,
        is_accelerometer_calibration_ok: true,
        is_magnetometer_calibration_ok: true,
        is_local_position_ok: true,
        is_global_position_ok: true,
        is_home_position_ok: true,
    };

    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` position reads
    pub fn fail_position_reads(&self, count: usize) {
        self.failing_position_reads.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TelemetrySource for FakeTelemetrySource {
    async fn position(&self) -> Result<Position> {
        let failing = self
            .failing_position_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SortieError::internal("position sensor error"));
        }
        Ok(Position {
            latitude_deg: 47.3977,
            longitude_deg: 8.5456,
            relative_altitude_m: 10.5,
        })
    }

    async fn battery(&self) -> Result<Battery> {
        Ok(Self::BATTERY)
    }

    async fn health(&self) -> Result<Health> {
        Ok(Self::HEALTH)
    }

    async fn velocity_ned(&self) -> Result<VelocityNed> {
        Ok(VelocityNed {
            north_m_s: 3.0,
            east_m_s: 4.0,
            down_m_s: 0.0,
        })
    }

    async fn heading(&self) -> Result<f64> {
        Ok(45.0)
    }
}

/// One of each double, wired into [`Collaborators`]
pub struct TestRig {
    pub queue: Arc<InMemoryJobQueue>,
    pub flight: Arc<FakeFlightController>,
    pub streaming: Arc<FakeStreamingService>,
    pub publisher: Arc<FakeTelemetryService>,
    pub collector: Arc<FakeTelemetryService>,
    pub downloader: Arc<FakeDownloader>,
    pub extractor: Arc<FakeExtractor>,
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRig {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(InMemoryJobQueue::new()),
            flight: Arc::new(FakeFlightController::new()),
            streaming: Arc::new(FakeStreamingService::new()),
            publisher: Arc::new(FakeTelemetryService::new()),
            collector: Arc::new(FakeTelemetryService::new()),
            downloader: Arc::new(FakeDownloader::new()),
            extractor: Arc::new(FakeExtractor::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        self.collaborators_with_downloader(self.downloader.clone())
    }

    pub fn collaborators_with_downloader(
        &self,
        downloader: Arc<dyn MissionDownloader>,
    ) -> Collaborators {
        Collaborators {
            job_queue: self.queue.clone(),
            flight: self.flight.clone(),
            streaming: self.streaming.clone(),
            telemetry_publisher: self.publisher.clone(),
            telemetry_collector: self.collector.clone(),
            downloader,
            extractor: self.extractor.clone(),
        }
    }
}
