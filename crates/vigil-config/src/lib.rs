//! Shared configuration for the vigil daemon harness.
//!
//! Two layers live here. [`DaemonConfig`] is the immutable, per-daemon record
//! the supervisor reads (name, host, ports, directories). [`HarnessConfig`] is
//! the run-wide configuration loaded through `ortho_config`, merging defaults,
//! configuration files, `VIGIL_*` environment variables and command-line flags
//! in that order of precedence.

mod daemon;
mod defaults;
mod logging;
mod ports;

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use daemon::{DaemonConfig, DaemonConfigBuilder};
pub use defaults::{
    COLLECTOR_PORT_ENV, DEFAULT_HELPER_WORKERS, DEFAULT_HOST, DEFAULT_LOG_FILTER,
    DEFAULT_STARTUP_TIMEOUT, DEFAULT_STOP_TIMEOUT, DEFAULT_VERBOSITY, LOG_PREFIX_ENV,
    default_log_filter, default_log_format, default_log_level, default_log_prefix,
};
pub use logging::{LogFormat, LogFormatParseError, LogLevel};
pub use ports::{PortAllocationError, PortAllocator, unused_localhost_port};

/// Errors raised while loading the harness configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Merging the configuration layers failed.
    #[error("failed to load harness configuration: {0}")]
    Load(#[source] Arc<OrthoError>),
}

/// Run-wide settings shared by every supervised daemon.
///
/// Every field is optional so that each layer only needs to mention what it
/// overrides; the accessor methods fill in the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "VIGIL")]
pub struct HarnessConfig {
    /// Directory searched for daemon executables before `PATH`.
    pub bin_dir: Option<Utf8PathBuf>,
    /// Tracing filter expression for the harness's own telemetry.
    pub log_filter: Option<String>,
    /// Output format for the harness's own telemetry.
    pub log_format: Option<LogFormat>,
    /// Verbosity count mapped onto daemon log levels.
    pub verbosity: Option<u8>,
    /// Seconds a daemon may take to become ready.
    pub startup_timeout_secs: Option<u64>,
    /// Seconds a daemon is given to exit after SIGTERM.
    pub stop_timeout_secs: Option<u64>,
    /// Port of the log collector daemons relay their records to.
    pub collector_port: Option<u16>,
    /// Prefix prepended to relayed records when no daemon prefix applies.
    pub log_prefix: Option<String>,
    /// Worker threads available to helper commands.
    pub helper_workers: Option<usize>,
}

impl HarnessConfig {
    /// Directory searched for daemon executables, if configured.
    #[must_use]
    pub fn bin_dir(&self) -> Option<&Utf8Path> {
        self.bin_dir.as_deref()
    }

    /// Resolves `program` against [`Self::bin_dir`].
    ///
    /// Programs containing a path separator are returned unchanged, as are
    /// bare names when no binary directory is configured.
    #[must_use]
    pub fn resolve_program(&self, program: &str) -> Utf8PathBuf {
        match self.bin_dir() {
            Some(dir) if !program.contains('/') => dir.join(program),
            _ => Utf8PathBuf::from(program),
        }
    }

    /// Tracing filter for harness telemetry.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(default_log_filter())
    }

    /// Output format for harness telemetry.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format.unwrap_or_else(default_log_format)
    }

    /// Verbosity count.
    #[must_use]
    pub fn verbosity(&self) -> u8 {
        self.verbosity.unwrap_or(DEFAULT_VERBOSITY)
    }

    /// Log level passed to daemons and helper commands.
    #[must_use]
    pub fn daemon_log_level(&self) -> LogLevel {
        self.verbosity
            .map_or_else(default_log_level, LogLevel::from_verbosity)
    }

    /// Readiness budget for a freshly started daemon.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout_secs
            .map_or(DEFAULT_STARTUP_TIMEOUT, Duration::from_secs)
    }

    /// Grace period between SIGTERM and SIGKILL during teardown.
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout_secs
            .map_or(DEFAULT_STOP_TIMEOUT, Duration::from_secs)
    }

    /// Port of the log collector, if one is running.
    #[must_use]
    pub const fn collector_port(&self) -> Option<u16> {
        self.collector_port
    }

    /// Prefix for relayed records, falling back to the daemon's own prefix.
    #[must_use]
    pub fn log_prefix_for(&self, daemon: &DaemonConfig) -> String {
        self.log_prefix
            .clone()
            .unwrap_or_else(|| daemon.log_prefix())
    }

    /// Size of the helper command pool; never zero.
    #[must_use]
    pub fn helper_workers(&self) -> usize {
        self.helper_workers
            .filter(|workers| *workers > 0)
            .unwrap_or(DEFAULT_HELPER_WORKERS)
    }
}

/// Loads the harness configuration, layering defaults, configuration files,
/// `VIGIL_*` environment variables and `args`; later layers win.
///
/// # Errors
///
/// Returns [`ConfigError::Load`] when any layer fails to parse.
pub fn load_harness_config<I, T>(args: I) -> Result<HarnessConfig, ConfigError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    HarnessConfig::load_from_iter(args).map_err(ConfigError::Load)
}
