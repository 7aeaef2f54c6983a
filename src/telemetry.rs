//! `tracing` subscriber bootstrap.
//!
//! Both binaries call [`init_tracing`] exactly once at startup, before
//! constructing any other component, so that init-time failures (an
//! invalid `RUST_LOG` filter) surface as a fatal error rather than a
//! silent fallback to a default filter.

use thiserror::Error;
use tracing_subscriber::{fmt, EnvFilter};

/// Output formatting for the process's log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Line-oriented, human-readable; the default for local development.
    Pretty,
    /// One JSON object per line; the default in the provided Dockerfile/systemd unit.
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

/// Errors installing the global `tracing` subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// `RUST_LOG` (or the fallback directive) failed to parse.
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),

    /// A global subscriber was already installed (double init).
    #[error("tracing subscriber already installed")]
    AlreadyInitialized,
}

/// Install the process-wide `tracing` subscriber.
///
/// Honors `RUST_LOG` when set; otherwise defaults to `info` for this
/// crate and `warn` for dependencies.
pub fn init_tracing(format: LogFormat) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,llm_proxy=debug"))?;

    let result = match format {
        LogFormat::Pretty => fmt().with_env_filter(filter).with_target(true).try_init(),
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init(),
    };

    result.map_err(|_| TelemetryError::AlreadyInitialized)
}
