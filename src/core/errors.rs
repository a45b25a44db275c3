use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::state::IllegalTransition;

/// Pipeline phase a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Download,
    Upload,
    Arm,
    Fly,
    Monitor,
    Land,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Download => "download",
            Self::Upload => "upload",
            Self::Arm => "arm",
            Self::Fly => "fly",
            Self::Monitor => "monitor",
            Self::Land => "land",
        };
        f.write_str(name)
    }
}

/// Unified error type for the whole orchestrator
#[derive(Debug, Error)]
pub enum SortieError {
    /// The vehicle could not be reached
    #[error("Vehicle connection failed: {message}")]
    Connection { message: String },

    #[error("Arming failed: {message}")]
    Arm { message: String },

    #[error("Mission upload failed: {message}")]
    Upload { message: String },

    #[error("Mission start failed: {message}")]
    MissionStart { message: String },

    /// The return-to-launch abort could not be delivered
    #[error("Mission cancel failed: {message}")]
    MissionCancel { message: String },

    #[error("Mission progress stream failed: {message}")]
    ProgressStream { message: String },

    #[error("In-air stream failed: {message}")]
    InAirStream { message: String },

    /// Destination outside of the allowed download root
    #[error("Download to {path} is not allowed (must be under {root})")]
    DownloadForbidden { path: PathBuf, root: PathBuf },

    #[error("Download from {url} failed: {message}")]
    Download { url: String, message: String },

    /// Startup connection to the job queue failed
    #[error("Job queue connection failed: {message}")]
    QueueConnection { message: String },

    /// A request against the job queue failed after connecting
    #[error("Job queue {operation} failed: {message}")]
    Queue { operation: String, message: String },

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    /// Collaborator failure re-raised at the phase boundary that invoked it
    #[error("Mission phase '{phase}' failed: {source}")]
    PhaseFailed {
        phase: Phase,
        #[source]
        source: Box<SortieError>,
    },

    /// The mission task observed its cancellation token
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SortieError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn arm<S: Into<String>>(message: S) -> Self {
        Self::Arm { message: message.into() }
    }

    pub fn upload<S: Into<String>>(message: S) -> Self {
        Self::Upload { message: message.into() }
    }

    pub fn mission_start<S: Into<String>>(message: S) -> Self {
        Self::MissionStart { message: message.into() }
    }

    pub fn mission_cancel<S: Into<String>>(message: S) -> Self {
        Self::MissionCancel { message: message.into() }
    }

    pub fn progress_stream<S: Into<String>>(message: S) -> Self {
        Self::ProgressStream { message: message.into() }
    }

    pub fn in_air_stream<S: Into<String>>(message: S) -> Self {
        Self::InAirStream { message: message.into() }
    }

    pub fn download_forbidden(path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self::DownloadForbidden {
            path: path.into(),
            root: root.into(),
        }
    }

    pub fn download<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::Download {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn queue_connection<S: Into<String>>(message: S) -> Self {
        Self::QueueConnection { message: message.into() }
    }

    pub fn queue<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::Queue {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Wrap a collaborator failure with the phase it surfaced in
    ///
    /// Cancellation passes through untouched so callers can still tell it
    /// apart from a genuine failure.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Self::Cancelled { .. } | Self::PhaseFailed { .. } => self,
            other => Self::PhaseFailed {
                phase,
                source: Box::new(other),
            },
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error tied to a config key
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when this error is a delivered cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Phase the failure was attributed to, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::PhaseFailed { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Arm { .. } => "arm",
            Self::Upload { .. } => "upload",
            Self::MissionStart { .. } => "mission_start",
            Self::MissionCancel { .. } => "mission_cancel",
            Self::ProgressStream { .. } => "progress_stream",
            Self::InAirStream { .. } => "in_air_stream",
            Self::DownloadForbidden { .. } => "download_forbidden",
            Self::Download { .. } => "download",
            Self::QueueConnection { .. } => "queue_connection",
            Self::Queue { .. } => "queue",
            Self::IllegalTransition(_) => "illegal_transition",
            Self::PhaseFailed { .. } => "phase_failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Configuration { .. } => "configuration",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SortieError>;

impl From<std::io::Error> for SortieError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for SortieError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for SortieError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<reqwest::Error> for SortieError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        Self::download(url, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Event, ExecutionState, StateMachine};

    #[test]
    fn test_error_category() {
        let err = SortieError::arm("motors refused");
        assert!(matches!(err, SortieError::Arm { .. }));
        assert_eq!(err.category(), "arm");
        assert_eq!(err.to_string(), "Arming failed: motors refused");
    }

    #[test]
    fn test_in_phase_wraps_cause() {
        let err = SortieError::upload("bad plan").in_phase(Phase::Upload);
        assert_eq!(err.phase(), Some(Phase::Upload));
        assert_eq!(err.category(), "phase_failed");

        let source = std::error::Error::source(&err).expect("cause is kept");
        assert_eq!(source.to_string(), "Mission upload failed: bad plan");
    }

    #[test]
    fn test_in_phase_keeps_cancellation() {
        let err = SortieError::cancelled("arm").in_phase(Phase::Arm);
        assert!(err.is_cancelled());
        assert_eq!(err.phase(), None);
    }

    #[test]
    fn test_in_phase_does_not_double_wrap() {
        let err = SortieError::arm("x")
            .in_phase(Phase::Arm)
            .in_phase(Phase::Fly);
        assert_eq!(err.phase(), Some(Phase::Arm));
    }

    #[test]
    fn test_illegal_transition_converts() {
        let mut machine = StateMachine::new();
        let illegal = machine.trigger(Event::Upload).unwrap_err();
        let err: SortieError = illegal.into();
        assert_eq!(err.category(), "illegal_transition");
        assert!(err.to_string().contains(&ExecutionState::Idle.to_string()));
    }
}
