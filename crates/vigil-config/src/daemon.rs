//! Immutable per-daemon settings handed to the supervisor.
//!
//! A [`DaemonConfig`] is produced by whatever generates the daemon's
//! configuration files and is only ever read by the supervisor. It names the
//! daemon, records where it runs, and lists the ports it is expected to open.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::defaults::{DEFAULT_HOST, default_log_prefix};

/// Settings describing one daemon instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    name: String,
    host: String,
    working_dir: Option<Utf8PathBuf>,
    config_dir: Option<Utf8PathBuf>,
    ports: BTreeMap<String, u16>,
    log_prefix: Option<String>,
}

impl DaemonConfig {
    /// Starts building a configuration for the daemon called `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> DaemonConfigBuilder {
        DaemonConfigBuilder {
            config: Self {
                name: name.into(),
                host: DEFAULT_HOST.to_owned(),
                working_dir: None,
                config_dir: None,
                ports: BTreeMap::new(),
                log_prefix: None,
            },
        }
    }

    /// Identifying name used in logs and error messages.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host the daemon listens on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Directory the daemon process is started in, when set.
    #[must_use]
    pub fn working_dir(&self) -> Option<&Utf8Path> {
        self.working_dir.as_deref()
    }

    /// Directory holding the daemon's generated configuration, when set.
    #[must_use]
    pub fn config_dir(&self) -> Option<&Utf8Path> {
        self.config_dir.as_deref()
    }

    /// Looks up a named port.
    #[must_use]
    pub fn port(&self, role: &str) -> Option<u16> {
        self.ports.get(role).copied()
    }

    /// Named ports the daemon is expected to open.
    #[must_use]
    pub const fn ports(&self) -> &BTreeMap<String, u16> {
        &self.ports
    }

    /// Port numbers in ascending order of their role names.
    pub fn port_numbers(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.values().copied()
    }

    /// Prefix injected into log records relayed from this daemon.
    #[must_use]
    pub fn log_prefix(&self) -> String {
        self.log_prefix
            .clone()
            .unwrap_or_else(|| default_log_prefix(&self.name))
    }
}

/// Builder for [`DaemonConfig`].
#[derive(Debug, Clone)]
pub struct DaemonConfigBuilder {
    config: DaemonConfig,
}

impl DaemonConfigBuilder {
    /// Sets the host the daemon listens on.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    /// Sets the configuration directory passed with `-c`.
    #[must_use]
    pub fn config_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.config.config_dir = Some(dir.into());
        self
    }

    /// Adds a named port. Re-using a role replaces the earlier port.
    #[must_use]
    pub fn port(mut self, role: impl Into<String>, port: u16) -> Self {
        self.config.ports.insert(role.into(), port);
        self
    }

    /// Overrides the relay log prefix.
    #[must_use]
    pub fn log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_prefix = Some(prefix.into());
        self
    }

    /// Finishes the configuration.
    #[must_use]
    pub fn build(self) -> DaemonConfig {
        self.config
    }
}
