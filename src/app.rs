//! Process lifecycle: logging, start, run, shutdown
//!
//! A job queue that cannot be reached at startup is the only fatal error.
//! Everything after that is handled inside the coordinator.

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::coord::{
    Collaborators, FlightController, JobCoordinator, JobQueue, MissionExtractor, StreamingService,
};
use crate::core::config::Config;
use crate::download::HttpDownloader;
use crate::logging;
use crate::telemetry::{TelemetryCollector, TelemetryPublisher, TelemetrySource};

/// Vehicle-side drivers supplied by the embedding process
pub struct Drivers {
    pub job_queue: Arc<dyn JobQueue>,
    pub flight: Arc<dyn FlightController>,
    pub streaming: Arc<dyn StreamingService>,
    pub extractor: Arc<dyn MissionExtractor>,
    pub telemetry_source: Arc<dyn TelemetrySource>,
}

/// Wire the drivers together with the built-in downloader and telemetry services
pub fn assemble(config: &Config, drivers: Drivers) -> Result<Collaborators> {
    let downloader = HttpDownloader::from_config(config).context("failed to build downloader")?;
    let collector = TelemetryCollector::from_config(config, drivers.telemetry_source);
    let publisher =
        TelemetryPublisher::from_config(config, collector.buffer(), drivers.job_queue.clone());

    Ok(Collaborators {
        job_queue: drivers.job_queue,
        flight: drivers.flight,
        streaming: drivers.streaming,
        telemetry_publisher: Arc::new(publisher),
        telemetry_collector: Arc::new(collector),
        downloader: Arc::new(downloader),
        extractor: drivers.extractor,
    })
}

/// Run the coordinator until `shutdown` resolves or the run loop exits
pub async fn run_until<F>(config: Config, collaborators: Collaborators, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let thing_name = config.thing_name.clone();
    let mut coordinator = JobCoordinator::new(config, collaborators);
    coordinator
        .start()
        .await
        .with_context(|| format!("failed to start job coordinator for {}", thing_name))?;
    info!(thing_name = %thing_name, "Mission coordinator running");

    let handle = coordinator.handle();
    let mut run = tokio::spawn(coordinator.run());

    tokio::select! {
        _ = shutdown => {
            info!("Shutdown requested");
            handle
                .shutdown()
                .await
                .context("coordinator did not acknowledge shutdown")?;
            run.await.context("coordinator task panicked")??;
        }
        joined = &mut run => {
            joined.context("coordinator task panicked")??;
        }
    }
    Ok(())
}

/// Install logging and run until Ctrl-C
pub async fn run_until_shutdown(config: Config, collaborators: Collaborators) -> Result<()> {
    logging::init(config.verbose).context("failed to initialise logging")?;

    run_until(config, collaborators, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down");
        }
    })
    .await
}

/// Load configuration from the environment and run until Ctrl-C
pub async fn run_from_env(drivers: Drivers) -> Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    let collaborators = assemble(&config, drivers)?;
    run_until_shutdown(config, collaborators).await
}
