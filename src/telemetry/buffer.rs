use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use crate::telemetry::model::TelemetryData;

/// Bounded hand-off between collector and publisher
///
/// When full, pushing evicts the oldest sample so the newest readings
/// always make it out.
pub struct TelemetryBuffer {
    samples: Mutex<VecDeque<TelemetryData>>,
    capacity: usize,
    available: Notify,
}

impl TelemetryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Notify::new(),
        }
    }

    /// Push a sample, returning the evicted one if the buffer was full
    pub fn push(&self, sample: TelemetryData) -> Option<TelemetryData> {
        let evicted = {
            let mut samples = self.lock();
            let evicted = if samples.len() >= self.capacity {
                samples.pop_front()
            } else {
                None
            };
            samples.push_back(sample);
            evicted
        };
        self.available.notify_one();
        evicted
    }

    pub fn pop(&self) -> Option<TelemetryData> {
        self.lock().pop_front()
    }

    /// Wait up to `timeout` for the next sample
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<TelemetryData> {
        loop {
            if let Some(sample) = self.pop() {
                return Some(sample);
            }
            if tokio::time::timeout(timeout, self.available.notified())
                .await
                .is_err()
            {
                return self.pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TelemetryData>> {
        // samples stay consistent even if a holder panicked
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
