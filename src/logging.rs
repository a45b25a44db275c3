//! Tracing subscriber setup for the orchestrator process

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::errors::{Result, SortieError};

/// Install the global subscriber
///
/// `RUST_LOG` wins when set; otherwise `debug` when `verbose`, `info`
/// otherwise. Fails if a global subscriber is already installed.
pub fn init(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init()
        .map_err(|e| SortieError::internal(format!("failed to install tracing subscriber: {}", e)))
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(true), "debug");
        assert_eq!(default_directive(false), "info");
    }

    #[test]
    fn test_second_init_fails_without_panicking() {
        let _ = init(false);
        assert!(init(true).is_err());
    }
}
