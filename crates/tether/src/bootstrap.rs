//! Start-up orchestration for embedding applications.

use std::sync::Arc;

use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;

use tether_config::Config;

use crate::discovery::CapabilityCatalogue;
use crate::health::{HealthReporter, StructuredHealthReporter};
use crate::host::{Host, HostError};
use crate::metrics::MetricsRegistry;
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Abstracts configuration loading so embedders and tests can inject values.
pub trait ConfigLoader: Send + Sync {
    /// Produces the configuration.
    ///
    /// # Errors
    ///
    /// Returns the loader's failure.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`]: defaults, `TETHER_CONFIG_PATH`
/// file, `TETHER_*` environment and process arguments.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The host could not be opened or started.
    #[error("failed to start host: {source}")]
    Host {
        /// Underlying host error.
        #[source]
        source: HostError,
    },
}

/// A connected host together with the telemetry installed for it.
#[derive(Debug)]
pub struct Runtime {
    host: Arc<Host>,
    telemetry: TelemetryHandle,
    catalogue: Arc<CapabilityCatalogue>,
}

impl Runtime {
    /// The connected host.
    #[must_use]
    pub const fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        self.host.config()
    }

    /// Log output installed when the runtime started.
    #[must_use]
    pub const fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    /// Catalogue the host started from.
    #[must_use]
    pub const fn catalogue(&self) -> &Arc<CapabilityCatalogue> {
        &self.catalogue
    }

    /// Closes the host.
    pub fn shutdown(&self) {
        self.host.close();
    }
}

/// Loads configuration, installs telemetry, opens the configured endpoint
/// and blocks until start-up completes.
///
/// # Errors
///
/// Returns [`BootstrapError`] naming the stage that failed.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    health: Arc<dyn HealthReporter>,
    metrics: MetricsRegistry,
) -> Result<Runtime, BootstrapError> {
    let config = loader
        .load()
        .map_err(|source| BootstrapError::Configuration { source })?;
    let telemetry =
        telemetry::initialise(&config).map_err(|source| BootstrapError::Telemetry { source })?;
    let host = Arc::new(
        Host::open(config, metrics, health).map_err(|source| BootstrapError::Host { source })?,
    );
    let catalogue = host
        .connect()
        .map_err(|source| BootstrapError::Host { source })?;
    Ok(Runtime {
        host,
        telemetry,
        catalogue,
    })
}

/// Bootstraps from the process environment with structured health logging.
///
/// # Errors
///
/// Returns [`BootstrapError`] naming the stage that failed.
pub fn bootstrap() -> Result<Runtime, BootstrapError> {
    bootstrap_with(
        &SystemConfigLoader,
        Arc::new(StructuredHealthReporter::new()),
        MetricsRegistry::new(),
    )
}
