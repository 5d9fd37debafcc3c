use std::time::Duration;

use crate::logging::{LogFormat, LogLevel};

/// Host that supervised daemons bind to and probes connect to.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default log filter expression used by the harness telemetry.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default verbosity count; maps to [`LogLevel::Info`].
pub const DEFAULT_VERBOSITY: u8 = 3;

/// Default readiness timeout for a freshly started daemon.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bounded wait for a daemon to exit after SIGTERM.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of worker threads used for helper commands.
pub const DEFAULT_HELPER_WORKERS: usize = 4;

/// Environment variable carrying the relay prefix into daemons and helpers.
pub const LOG_PREFIX_ENV: &str = "VIGIL_LOG_PREFIX";

/// Environment variable carrying the log collector port into daemons.
pub const COLLECTOR_PORT_ENV: &str = "VIGIL_COLLECTOR_PORT";

/// Default log filter expression used by the harness telemetry.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Default logging format for the harness telemetry.
#[must_use]
pub fn default_log_format() -> LogFormat {
    LogFormat::default()
}

/// Default daemon log level derived from [`DEFAULT_VERBOSITY`].
#[must_use]
pub const fn default_log_level() -> LogLevel {
    LogLevel::from_verbosity(DEFAULT_VERBOSITY)
}

/// Prefix injected into relayed log messages for a named daemon.
#[must_use]
pub fn default_log_prefix(name: &str) -> String {
    format!("[{name}] ")
}
