//! Scenario-facing configuration records
//!
//! These describe what a run needs on the conductor. They carry logical ids
//! only; wire ids are derived at provisioning time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// An agent identity to be installed on the conductor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Logical agent id
    pub id: String,
    /// Display name
    pub name: String,
    /// Keystore reference (test agents accept any value)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore_file: Option<String>,
    /// Public address (test agents accept any value)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
}

impl AgentConfig {
    /// Test agent whose name equals its id
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            keystore_file: None,
            public_address: None,
        }
    }

    pub(crate) fn keystore_ref(&self) -> String {
        self.keystore_file.clone().unwrap_or_else(|| self.id.clone())
    }

    pub(crate) fn public_ref(&self) -> String {
        self.public_address.clone().unwrap_or_else(|| self.id.clone())
    }
}

/// A DNA package to be installed on the conductor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnaConfig {
    /// Logical DNA id
    pub id: String,
    /// Path to the packaged DNA file
    pub path: PathBuf,
    /// Expected content hash, checked by the conductor when given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Explicit uniqueness salt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl DnaConfig {
    /// DNA whose id is its path
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            id: path.to_string_lossy().into_owned(),
            path,
            hash: None,
            uuid: None,
        }
    }

    /// DNA with an explicit logical id
    pub fn with_id(path: impl AsRef<Path>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::new(path)
        }
    }

    /// blake3 digest of the DNA file, if it can be read
    pub fn fingerprint(&self) -> Option<String> {
        std::fs::read(&self.path)
            .ok()
            .map(|bytes| blake3::hash(&bytes).to_hex().to_string())
    }
}

/// One agent bound to one DNA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Logical instance id
    pub id: String,
    /// Agent running the instance
    pub agent: AgentConfig,
    /// DNA the instance runs
    pub dna: DnaConfig,
}

impl InstanceConfig {
    /// Instance with an explicit id
    pub fn new(id: impl Into<String>, agent: AgentConfig, dna: DnaConfig) -> Self {
        Self {
            id: id.into(),
            agent,
            dna,
        }
    }

    /// Instance named after its agent, the common one-agent-per-instance layout
    pub fn for_agent(agent_id: impl Into<String>, dna: DnaConfig) -> Self {
        let agent = AgentConfig::new(agent_id);
        Self {
            id: agent.id.clone(),
            agent,
            dna,
        }
    }
}

/// Permission for one instance to call into another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Handle the caller uses to address the callee
    pub handle: String,
    /// Logical id of the calling instance
    pub caller_id: String,
    /// Logical id of the called instance
    pub callee_id: String,
}

impl BridgeConfig {
    /// Bridge from `caller` to `callee`
    pub fn new(
        handle: impl Into<String>,
        caller: impl Into<String>,
        callee: impl Into<String>,
    ) -> Self {
        Self {
            handle: handle.into(),
            caller_id: caller.into(),
            callee_id: callee.into(),
        }
    }
}

/// Distributed PKI instance settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpkiConfig {
    /// Instance that hosts the DPKI DNA
    pub instance_id: String,
    /// Initialisation parameters handed to the DPKI DNA
    pub init_params: Value,
}

impl DpkiConfig {
    /// DPKI bound to `instance_id`
    pub fn new(instance_id: impl Into<String>, init_params: Value) -> Self {
        Self {
            instance_id: instance_id.into(),
            init_params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_for_agent_names_instance_after_agent() {
        let config = InstanceConfig::for_agent("alice", DnaConfig::with_id("dist/app.dna.json", "app"));
        assert_eq!(config.id, "alice");
        assert_eq!(config.agent.name, "alice");
        assert_eq!(config.dna.id, "app");
        assert_eq!(config.agent.keystore_ref(), "alice");
    }

    #[test]
    fn test_dna_id_defaults_to_path() {
        let dna = DnaConfig::new("dist/app.dna.json");
        assert_eq!(dna.id, "dist/app.dna.json");
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{\"name\":\"app\"}").unwrap();
        let dna = DnaConfig::new(file.path());
        let first = dna.fingerprint().unwrap();

        file.write_all(b" ").unwrap();
        assert_ne!(dna.fingerprint().unwrap(), first);
        assert!(DnaConfig::new("/nonexistent/app.dna.json").fingerprint().is_none());
    }
}
