//! Administrative channel
//!
//! Every provisioning step is one [`AdminCommand`] variant carrying a typed
//! payload. [`AdminChannel::send`] is the only dispatch point; it logs the
//! traffic and hands transport errors back untouched.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::error::{TransportError, TransportResult};
use super::transport::RpcClient;

/// Payload of `add_agent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddAgent {
    /// Logical agent id
    pub id: String,
    /// Display name
    pub name: String,
    /// Keystore reference
    pub keystore_file: String,
    /// Public address
    pub public_address: String,
    /// Always true: the harness only installs test agents
    pub test_agent: bool,
}

/// Payload of `install_dna`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallDna {
    /// Nonce-qualified DNA id
    pub id: String,
    /// DNA file path
    pub path: String,
    /// Uniqueness token
    pub uuid: String,
    /// Copy the file into conductor storage
    pub copy: bool,
    /// Hash the conductor must verify
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
}

/// Payload of `add_instance`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddInstance {
    /// Nonce-qualified instance id
    pub id: String,
    /// Agent id
    pub agent_id: String,
    /// DNA id as installed
    pub dna_id: String,
}

/// Payload of `add_interface`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddInterface {
    /// Interface id
    pub id: String,
    /// Always false for test interfaces
    pub admin: bool,
    /// Driver type
    #[serde(rename = "type")]
    pub kind: String,
    /// Listening port
    pub port: u16,
}

/// Payload binding an instance to an interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceInstance {
    /// Interface id
    pub interface_id: String,
    /// Nonce-qualified instance id
    pub instance_id: String,
}

/// Payload of `add_bridge`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddBridge {
    /// Bridge handle
    pub handle: String,
    /// Nonce-qualified caller id
    pub caller_id: String,
    /// Nonce-qualified callee id
    pub callee_id: String,
}

/// Payload of `remove_bridge`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveBridge {
    /// Nonce-qualified caller id
    pub caller_id: String,
    /// Nonce-qualified callee id
    pub callee_id: String,
}

/// Payload carrying only an entity id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityId {
    /// Entity id
    pub id: String,
}

impl EntityId {
    /// Wrap an id
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Every administrative operation the harness performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// Install a test agent
    AddAgent(AddAgent),
    /// Install a DNA package
    InstallDna(InstallDna),
    /// Create an instance
    AddInstance(AddInstance),
    /// Start an instance
    StartInstance(EntityId),
    /// Register a websocket interface
    AddInterface(AddInterface),
    /// Expose an instance on an interface
    AddInstanceToInterface(InterfaceInstance),
    /// Link two instances
    AddBridge(AddBridge),
    /// Unlink two instances
    RemoveBridge(RemoveBridge),
    /// Hide an instance from an interface
    RemoveInstanceFromInterface(InterfaceInstance),
    /// Delete an instance
    RemoveInstance(EntityId),
    /// Delete an interface
    RemoveInterface(EntityId),
    /// Delete a DNA package
    UninstallDna(EntityId),
}

impl AdminCommand {
    /// Method name on the wire
    pub fn method(&self) -> &'static str {
        match self {
            AdminCommand::AddAgent(_) => "add_agent",
            AdminCommand::InstallDna(_) => "install_dna",
            AdminCommand::AddInstance(_) => "add_instance",
            AdminCommand::StartInstance(_) => "start_instance",
            AdminCommand::AddInterface(_) => "add_interface",
            AdminCommand::AddInstanceToInterface(_) => "add_instance_to_interface",
            AdminCommand::AddBridge(_) => "add_bridge",
            AdminCommand::RemoveBridge(_) => "remove_bridge",
            AdminCommand::RemoveInstanceFromInterface(_) => "remove_instance_from_interface",
            AdminCommand::RemoveInstance(_) => "remove_instance",
            AdminCommand::RemoveInterface(_) => "remove_interface",
            AdminCommand::UninstallDna(_) => "uninstall_dna",
        }
    }

    /// Payload on the wire
    pub fn params(&self) -> TransportResult<Value> {
        let value = match self {
            AdminCommand::AddAgent(payload) => serde_json::to_value(payload),
            AdminCommand::InstallDna(payload) => serde_json::to_value(payload),
            AdminCommand::AddInstance(payload) => serde_json::to_value(payload),
            AdminCommand::AddInterface(payload) => serde_json::to_value(payload),
            AdminCommand::AddBridge(payload) => serde_json::to_value(payload),
            AdminCommand::RemoveBridge(payload) => serde_json::to_value(payload),
            AdminCommand::AddInstanceToInterface(payload)
            | AdminCommand::RemoveInstanceFromInterface(payload) => serde_json::to_value(payload),
            AdminCommand::StartInstance(payload)
            | AdminCommand::RemoveInstance(payload)
            | AdminCommand::RemoveInterface(payload)
            | AdminCommand::UninstallDna(payload) => serde_json::to_value(payload),
        };
        value.map_err(TransportError::from)
    }
}

/// Logged dispatcher over the admin interface connection
#[derive(Clone)]
pub struct AdminChannel {
    client: Arc<dyn RpcClient>,
}

impl AdminChannel {
    /// Wrap a connected admin client
    pub fn new(client: Arc<dyn RpcClient>) -> Self {
        Self { client }
    }

    /// Send one command and return the raw result
    pub async fn send(&self, command: AdminCommand) -> TransportResult<Value> {
        let method = command.method();
        let params = command.params()?;
        debug!(method, params = %params, "admin call");
        let result = self.client.call(method, params).await?;
        debug!(method, result = %result, "admin result");
        Ok(result)
    }
}
