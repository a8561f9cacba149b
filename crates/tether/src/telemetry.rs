//! Process-wide log output for embedders that let tether own it.
//!
//! Events go to stderr in the configured [`LogFormat`]. JSON output
//! flattens event fields and lists the active spans, so the structured
//! fields the engine attaches (addresses, tags, sequence numbers) stay
//! machine-readable. The first successful call wins; later calls report
//! what was installed.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::{Subscriber, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt;

use tether_config::{Config, LogFormat, default_log_filter};

const TELEMETRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::telemetry");

static INSTALLED: OnceCell<TelemetryHandle> = OnceCell::new();

/// Describes the installed log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryHandle {
    format: LogFormat,
    filter: String,
}

impl TelemetryHandle {
    /// Output format in effect.
    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }

    /// Filter expression in effect.
    #[must_use]
    pub const fn filter(&self) -> &str {
        self.filter.as_str()
    }
}

/// Errors encountered while installing log output.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured filter expression does not parse.
    #[error("invalid log filter {expression:?}: {source}")]
    Filter {
        /// Expression as configured.
        expression: String,
        /// Parser failure.
        #[source]
        source: ParseError,
    },
    /// Another subscriber already owns the process.
    #[error("failed to install log subscriber: {0}")]
    Subscriber(#[source] SetGlobalDefaultError),
}

/// Installs the global subscriber described by `config` on first use.
///
/// # Errors
///
/// Returns [`TelemetryError`] when the filter is invalid or the embedding
/// application already installed its own subscriber.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    INSTALLED
        .get_or_try_init(|| {
            let (handle, subscriber) = prepare(config)?;
            tracing::subscriber::set_global_default(subscriber)
                .map_err(TelemetryError::Subscriber)?;
            info!(
                target: TELEMETRY_TARGET,
                format = %handle.format,
                filter = %handle.filter,
                "log output installed"
            );
            Ok(handle)
        })
        .cloned()
}

/// Builds the subscriber without installing it.
fn prepare(
    config: &Config,
) -> Result<(TelemetryHandle, Box<dyn Subscriber + Send + Sync>), TelemetryError> {
    let expression = match config.log_filter().trim() {
        "" => default_log_filter(),
        configured => configured.to_owned(),
    };
    let filter = EnvFilter::try_new(&expression).map_err(|source| TelemetryError::Filter {
        expression: expression.clone(),
        source,
    })?;
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_timer(fmt::time::UtcTime::rfc_3339());
    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format() {
        LogFormat::Json => Box::new(
            builder
                .json()
                .flatten_event(true)
                .with_span_list(true)
                .finish(),
        ),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    };
    let handle = TelemetryHandle {
        format: config.log_format(),
        filter: expression,
    };
    Ok((handle, subscriber))
}
