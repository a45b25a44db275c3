//! HTTP mission bundle downloader

use async_trait::async_trait;
use reqwest::Client;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::coord::MissionDownloader;
use crate::core::config::Config;
use crate::core::errors::{Result, SortieError};

/// Name of the bundle file inside the requested download folder
pub const BUNDLE_FILE_NAME: &str = "mission.bundle.zip";

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Downloads mission bundles into folders below a fixed root
#[derive(Clone)]
pub struct HttpDownloader {
    client: Client,
    download_root: PathBuf,
}

impl std::fmt::Debug for HttpDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDownloader")
            .field("download_root", &self.download_root)
            .finish()
    }
}

impl HttpDownloader {
    pub fn new(download_root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_timeout(download_root, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(download_root: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sortie/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SortieError::internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            download_root: download_root.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.download_root.clone())
    }

    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    /// Resolve and check the destination folder
    ///
    /// The folder must be an absolute path below the download root with no
    /// `..` components.
    pub fn destination(&self, download_path: &str) -> Result<PathBuf> {
        let folder = Path::new(download_path);
        let escapes = folder
            .components()
            .any(|c| matches!(c, Component::ParentDir));

        if !folder.is_absolute() || escapes || !folder.starts_with(&self.download_root) {
            return Err(SortieError::download_forbidden(folder, &self.download_root));
        }
        Ok(folder.join(BUNDLE_FILE_NAME))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SortieError::download(url, e.to_string()))?;

        if !response.status().is_success() {
            return Err(SortieError::download(
                url,
                format!("HTTP {}", response.status()),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SortieError::download(url, e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl MissionDownloader for HttpDownloader {
    async fn download(&self, url: &str, download_path: &str) -> Result<PathBuf> {
        let target = self.destination(download_path)?;

        if let Some(folder) = target.parent() {
            if !tokio::fs::try_exists(folder).await.unwrap_or(false) {
                warn!(folder = %folder.display(), "Download folder does not exist, creating it");
                tokio::fs::create_dir_all(folder)
                    .await
                    .map_err(|e| SortieError::io(format!("create {}", folder.display()), e))?;
            }
        }

        debug!(url = %url, target = %target.display(), "Fetching mission bundle");
        let bytes = self.fetch(url).await?;
        tokio::fs::write(&target, &bytes)
            .await
            .map_err(|e| SortieError::io(format!("write {}", target.display()), e))?;

        info!(target = %target.display(), bytes = bytes.len(), "Mission bundle downloaded");
        Ok(target)
    }
}
