//! Conductor configuration file generation
//!
//! The conductor starts with nothing provisioned: empty agent/DNA/instance
//! lists and only the admin interface. Everything else arrives later over the
//! admin channel.

use serde::Serialize;
use std::path::{Path, PathBuf};

use super::error::ConfigError;
use super::types::DpkiConfig;

/// Interface id of the admin websocket
pub const ADMIN_INTERFACE_ID: &str = "admin-interface";

/// File name written into the storage directory
pub const CONFIG_FILE_NAME: &str = "conductor-config.toml";

/// Inputs for [`render`]
#[derive(Debug, Clone)]
pub struct ConductorFile {
    /// Directory the conductor persists into
    pub persistence_dir: PathBuf,
    /// Admin websocket port
    pub admin_port: u16,
    /// Pass all log lines through instead of only errors and DNA debug output
    pub debug_log: bool,
    /// Optional DPKI settings
    pub dpki: Option<DpkiConfig>,
}

#[derive(Serialize)]
struct FileLayout<'a> {
    agents: Vec<()>,
    dnas: Vec<()>,
    instances: Vec<()>,
    bridges: Vec<()>,
    persistence_dir: &'a Path,
    interfaces: Vec<InterfaceSection>,
    logger: LoggerSection,
    signals: SignalsSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    dpki: Option<DpkiSection>,
}

#[derive(Serialize)]
struct InterfaceSection {
    id: &'static str,
    admin: bool,
    instances: Vec<()>,
    driver: DriverSection,
}

#[derive(Serialize)]
struct DriverSection {
    #[serde(rename = "type")]
    kind: &'static str,
    port: u16,
}

#[derive(Serialize)]
struct LoggerSection {
    #[serde(rename = "type")]
    kind: &'static str,
    rules: LoggerRules,
}

#[derive(Serialize)]
struct LoggerRules {
    rules: Vec<LoggerRule>,
}

#[derive(Serialize)]
struct LoggerRule {
    exclude: bool,
    pattern: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<&'static str>,
}

#[derive(Serialize)]
struct SignalsSection {
    trace: bool,
    consistency: bool,
}

#[derive(Serialize)]
struct DpkiSection {
    instance_id: String,
    init_params: String,
}

fn logger_rules(debug_log: bool) -> Vec<LoggerRule> {
    if debug_log {
        return Vec::new();
    }
    vec![
        LoggerRule {
            exclude: false,
            pattern: "^err/",
            color: Some("red"),
        },
        LoggerRule {
            exclude: false,
            pattern: "^debug/dna",
            color: Some("white"),
        },
        LoggerRule {
            exclude: true,
            pattern: ".*",
            color: None,
        },
    ]
}

/// Render the conductor configuration as TOML
pub fn render(file: &ConductorFile) -> Result<String, ConfigError> {
    let layout = FileLayout {
        agents: Vec::new(),
        dnas: Vec::new(),
        instances: Vec::new(),
        bridges: Vec::new(),
        persistence_dir: &file.persistence_dir,
        interfaces: vec![InterfaceSection {
            id: ADMIN_INTERFACE_ID,
            admin: true,
            instances: Vec::new(),
            driver: DriverSection {
                kind: "websocket",
                port: file.admin_port,
            },
        }],
        logger: LoggerSection {
            kind: "debug",
            rules: LoggerRules {
                rules: logger_rules(file.debug_log),
            },
        },
        signals: SignalsSection {
            trace: false,
            consistency: true,
        },
        dpki: file.dpki.as_ref().map(|dpki| DpkiSection {
            instance_id: dpki.instance_id.clone(),
            init_params: dpki.init_params.to_string(),
        }),
    };
    Ok(toml::to_string(&layout)?)
}

/// Render and write the configuration into `dir`, returning the file path
pub fn write(dir: &Path, file: &ConductorFile) -> Result<PathBuf, ConfigError> {
    let path = dir.join(CONFIG_FILE_NAME);
    let contents = render(file)?;
    std::fs::write(&path, contents).map_err(|source| ConfigError::Write {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}
