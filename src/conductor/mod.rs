//! Conductor lifecycle and provisioning
//!
//! This module provides the [`Conductor`] that spawns the external runtime
//! process, provisions each scenario run over the admin interface and tears the
//! run down again, plus the configuration it is built from.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

// Submodules
pub mod admin;
pub mod config_file;
pub mod error;
pub mod identity;
pub mod instance;
pub mod lifecycle;
pub mod orchestrator;
pub mod process;
pub mod signal;
pub mod transport;
pub mod types;
pub mod zome;

pub use error::{HarnessError, Result};
pub use identity::{Nonce, QualifiedId};
pub use instance::{InstanceHandle, InstanceMap};
pub use lifecycle::{Conductor, RunPlan};
pub use signal::{ConsistencyTracker, NoopTracker, Observation};
pub use types::{AgentConfig, BridgeConfig, DnaConfig, DpkiConfig, InstanceConfig};

/// Whether installed DNAs survive the run that installed them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnaRetention {
    /// Install each logical DNA once for the lifetime of the process
    #[default]
    KeepInstalled,
    /// Uninstall at teardown; the next run installs a fresh copy
    UninstallEachRun,
}

/// What happens when provisioning fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    /// Kill the conductor and exit the process with status -1
    #[default]
    Exit,
    /// Kill the conductor and return [`HarnessError::Aborted`]
    Return,
}

/// Configuration for a [`Conductor`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Conductor binary, looked up on PATH (default: holochain)
    pub binary: String,

    /// Persistence directory; a fresh temp dir is created when unset
    pub storage_dir: Option<PathBuf>,

    /// Admin interface port; an unused port is picked when unset
    pub admin_port: Option<u16>,

    /// Pass all conductor log output through
    pub debug_log: bool,

    /// Budget for each zome call in milliseconds
    pub zome_call_timeout_ms: u64,

    /// How long to wait for the admin interface after spawning
    pub startup_timeout_ms: u64,

    /// Nonce of the first run
    pub initial_nonce: u64,

    /// DNA retention across runs
    pub dna_retention: DnaRetention,

    /// Behaviour on unrecoverable failure
    pub abort_policy: AbortPolicy,

    /// DPKI settings written into the conductor file
    pub dpki: Option<DpkiConfig>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            binary: "holochain".to_string(),
            storage_dir: None,
            admin_port: None,
            debug_log: false,
            zome_call_timeout_ms: 60_000,
            startup_timeout_ms: 10_000,
            initial_nonce: 0,
            dna_retention: DnaRetention::KeepInstalled,
            abort_policy: AbortPolicy::Exit,
            dpki: None,
        }
    }
}

impl ConductorConfig {
    /// Defaults overlaid with `DIORAMA_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; unparseable values are logged and ignored
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(binary) = lookup("DIORAMA_CONDUCTOR_BIN") {
            self.binary = binary;
        }
        if let Some(dir) = lookup("DIORAMA_STORAGE") {
            self.storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(port) = parse_var(&lookup, "DIORAMA_ADMIN_PORT") {
            self.admin_port = Some(port);
        }
        if let Some(debug) = parse_var(&lookup, "DIORAMA_DEBUG_LOG") {
            self.debug_log = debug;
        }
        if let Some(ms) = parse_var(&lookup, "DIORAMA_ZOME_CALL_TIMEOUT_MS") {
            self.zome_call_timeout_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "DIORAMA_STARTUP_TIMEOUT_MS") {
            self.startup_timeout_ms = ms;
        }
        self
    }

    /// Zome-call budget as a duration
    pub fn zome_call_timeout(&self) -> Duration {
        Duration::from_millis(self.zome_call_timeout_ms)
    }

    /// Startup budget as a duration
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
