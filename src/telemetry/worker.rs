use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::core::errors::SortieError;

/// Error counters of a background telemetry loop
#[derive(Debug, Default)]
pub struct ServiceStats {
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ServiceStats {
    pub fn record_error(&self, err: &SortieError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A spawned loop together with the token that stops it
pub(crate) struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(body(token.clone()));
        Self { token, handle }
    }

    /// Signal the loop and wait for it to return
    pub(crate) async fn shutdown(self, name: &str) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!(worker = name, error = %e, "Telemetry worker did not exit cleanly");
        }
    }
}
