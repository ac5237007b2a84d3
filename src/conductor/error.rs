//! Error types for the conductor harness
//!
//! Each layer gets its own thiserror enum; `HarnessError` nests them at the
//! lifecycle boundary where the abort / fail-scenario decision is made.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level harness error
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The conductor process could not be started or reached
    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    /// An administrative provisioning step failed
    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// Conductor configuration could not be produced
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// `run` was called before `initialize` completed
    #[error("conductor has not been initialized")]
    NotInitialized,

    /// The conductor was aborted and can no longer be used
    #[error("conductor aborted: {0}")]
    Aborted(Box<HarnessError>),

    /// The conductor was aborted earlier and refuses further work
    #[error("conductor is unusable after an abort")]
    Unusable,

    /// The scenario function itself failed
    #[error("scenario failed: {0}")]
    Scenario(#[source] anyhow::Error),
}

impl HarnessError {
    /// True when the error ended the conductor rather than a single scenario
    pub fn is_abort(&self) -> bool {
        matches!(self, HarnessError::Aborted(_) | HarnessError::Unusable)
    }
}

/// Errors raised by an RPC transport
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// URL could not be parsed or has the wrong scheme
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Establishing the connection failed
    #[error("connect to {url} failed: {detail}")]
    Connect {
        /// Target URL
        url: String,
        /// Underlying failure
        detail: String,
    },

    /// Websocket level failure after connecting
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Frame could not be encoded or decoded
    #[error("json error: {0}")]
    Json(String),

    /// The remote side answered with a JSON-RPC error object
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Error message reported by the conductor
        message: String,
    },

    /// The connection closed before a reply arrived
    #[error("connection closed")]
    Closed,
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Json(err.to_string())
    }
}

/// Convenience result alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Process supervision errors
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The binary could not be executed
    #[error("failed to spawn {binary}: {source}")]
    Launch {
        /// Binary that was invoked
        binary: String,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// The admin interface never accepted a connection
    #[error("admin interface {url} unreachable after {waited_ms}ms: {source}")]
    AdminUnreachable {
        /// Admin websocket URL
        url: String,
        /// How long the harness waited
        waited_ms: u64,
        /// Last connection failure
        #[source]
        source: TransportError,
    },

    /// No free port could be obtained
    #[error("port allocation failed: {0}")]
    Port(#[source] io::Error),

    /// The scratch storage directory could not be created
    #[error("storage directory {path} unavailable: {source}")]
    Storage {
        /// Directory path
        path: PathBuf,
        /// OS error
        #[source]
        source: io::Error,
    },
}

/// Convenience result alias for process supervision
pub type SpawnResult<T> = std::result::Result<T, SpawnError>;

/// Provisioning state-machine errors
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Setup attempted while a previous run still has instances registered
    #[error("a run is already active with instances [{}]", running.join(", "))]
    RunAlreadyActive {
        /// Wire ids of the instances still registered
        running: Vec<String>,
    },

    /// Setup requested for a plan without instances
    #[error("run plan has no instances")]
    EmptyRun,

    /// Teardown attempted with nothing running
    #[error("teardown requested but no instances are running")]
    NothingRunning,

    /// An administrative call was rejected
    #[error("admin call {method} failed: {source}")]
    Rpc {
        /// Admin method name
        method: &'static str,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// An administrative call returned an unexpected payload
    #[error("admin call {method} returned a malformed result: {detail}")]
    MalformedResponse {
        /// Admin method name
        method: &'static str,
        /// What was wrong
        detail: String,
    },

    /// A bridge names an instance that is not part of the run
    #[error("bridge {handle} references unknown instance {instance}")]
    UnknownBridgeEndpoint {
        /// Bridge handle
        handle: String,
        /// Logical instance id that could not be resolved
        instance: String,
    },

    /// No free port for the test interface
    #[error("test interface port allocation failed: {0}")]
    Port(#[source] io::Error),

    /// The test channel could not connect to the per-run interface
    #[error("test interface connection failed: {0}")]
    Connect(#[source] TransportError),
}

/// Convenience result alias for provisioning
pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;

/// Zome call errors surfaced to scenario code
#[derive(Debug, Error)]
pub enum ZomeCallError {
    /// The call did not complete within the configured budget
    #[error("zome call timed out after {seconds} seconds: {address}")]
    Timeout {
        /// Budget in seconds
        seconds: f64,
        /// `instance/zome/function`
        address: String,
    },

    /// Transport failure while calling
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `call_sync` used on a handle without the call-sync decorator
    #[error("call_sync is not enabled for instance {0}")]
    CallSyncUnavailable(String),
}

/// Convenience result alias for zome calls
pub type ZomeCallResult<T> = std::result::Result<T, ZomeCallError>;

/// Signal routing errors
#[derive(Debug, Error)]
pub enum SignalError {
    /// The signal names an instance that is not configured
    #[error("Got a signal from a not-configured instance! id: {instance_id}")]
    Unroutable {
        /// Instance id as reported on the wire
        instance_id: String,
    },

    /// The signal frame did not have the expected shape
    #[error("malformed signal: {0}")]
    Malformed(String),
}

/// Convenience result alias for signal routing
pub type SignalResult<T> = std::result::Result<T, SignalError>;

/// Conductor config-file generation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML serialisation failed
    #[error("toml error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// Writing the file failed
    #[error("writing {path} failed: {source}")]
    Write {
        /// Config file path
        path: PathBuf,
        /// OS error
        #[source]
        source: io::Error,
    },
}

/// Result type using HarnessError
pub type Result<T> = std::result::Result<T, HarnessError>;
