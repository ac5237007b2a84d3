//! Provisioning state machine
//!
//! Owns all cross-run state ([`RunState`]) and is the only writer of it. A run
//! is provisioned with [`ProvisioningOrchestrator::setup`] and removed again,
//! in reverse, with [`ProvisioningOrchestrator::teardown`], which also advances
//! the nonce. Admin calls are issued strictly one after another.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::DnaRetention;
use super::admin::{
    AddAgent, AddBridge, AddInstance, AddInterface, AdminChannel, AdminCommand, EntityId,
    InstallDna, InterfaceInstance, RemoveBridge,
};
use super::error::{ProvisionError, ProvisionResult};
use super::identity::{IdentityTable, Nonce, QualifiedId, qualify, uniqueness_token};
use super::instance::{InstanceHandle, InstanceMap};
use super::signal::{ConsistencyTracker, SignalBuffer, SignalRoute, SignalRouter};
use super::transport::{Connector, free_port, local_url};
use super::types::{AgentConfig, BridgeConfig, DnaConfig, InstanceConfig};
use super::zome::ZomeChannel;

/// Prefix of per-run test interface ids; the port makes each one unique
pub const TEST_INTERFACE_ID: &str = "diorama-interface";

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// No run active
    Idle,
    /// Registering the per-run interface
    SettingUpInterface,
    /// Creating agents, DNAs and instances
    SettingUpInstances,
    /// Linking instances
    SettingUpBridges,
    /// Starting instances
    StartingInstances,
    /// Attaching the signal router
    ConnectingSignals,
    /// Scenario code is executing
    Running,
    /// The scenario failed; teardown follows
    Failing,
    /// Removing bridges
    TearingDownBridges,
    /// Removing instances, the interface and DNAs
    TearingDownInstances,
    /// Provisioning failed; the conductor is being killed
    Aborting,
}

/// An installed agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    /// Logical agent id
    pub id: String,
    /// Display name
    pub name: String,
    /// Keystore reference sent at install time
    pub keystore_ref: String,
    /// Address returned by the conductor
    pub public_address: String,
}

/// An installed DNA package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnaRecord {
    /// Logical DNA id
    pub logical_id: String,
    /// Id the package was installed under
    pub wire_id: QualifiedId,
    /// DNA file
    pub source: PathBuf,
    /// Hash returned by the conductor
    pub content_hash: Option<String>,
    /// Uniqueness token sent as `uuid`
    pub uuid: String,
    /// blake3 digest of the file when it was installed
    pub local_digest: Option<String>,
}

/// One logical instance, carried across runs
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    /// Logical instance id
    pub logical_id: String,
    /// Identity used during the latest run
    pub wire_id: QualifiedId,
    /// Logical agent id
    pub agent_id: String,
    /// Agent address
    pub agent_address: String,
    /// Logical DNA id
    pub dna_id: String,
    /// Id the DNA was installed under
    pub dna_wire_id: String,
    /// Hash of the installed DNA
    pub dna_address: Option<String>,
    /// Signals received for this instance over the process lifetime
    pub signals: SignalBuffer,
}

/// A bridge of the active run, stored by logical ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRecord {
    /// Bridge handle
    pub handle: String,
    /// Logical caller id
    pub caller_logical_id: String,
    /// Logical callee id
    pub callee_logical_id: String,
}

/// The per-run websocket interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestInterface {
    /// Interface id
    pub id: String,
    /// Listening port
    pub port: u16,
}

/// Process-wide provisioning state
#[derive(Debug)]
pub struct RunState {
    nonce: Nonce,
    running: Vec<InstanceRecord>,
    instances: HashMap<String, InstanceRecord>,
    agents: HashMap<String, AgentRecord>,
    dnas: HashMap<String, DnaRecord>,
    bridges: Vec<BridgeRecord>,
    interface: Option<TestInterface>,
    identities: IdentityTable,
}

impl RunState {
    fn new(nonce: Nonce) -> Self {
        Self {
            nonce,
            running: Vec::new(),
            instances: HashMap::new(),
            agents: HashMap::new(),
            dnas: HashMap::new(),
            bridges: Vec::new(),
            interface: None,
            identities: IdentityTable::new(),
        }
    }

    /// Nonce of the next (or active) run
    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    /// Instances of the active run, in setup order
    pub fn running(&self) -> &[InstanceRecord] {
        &self.running
    }

    /// Bridges of the active run
    pub fn bridges(&self) -> &[BridgeRecord] {
        &self.bridges
    }

    /// Interface of the active run
    pub fn interface(&self) -> Option<&TestInterface> {
        self.interface.as_ref()
    }

    /// Installed agent by logical id
    pub fn agent(&self, id: &str) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    /// Installed DNA by logical id
    pub fn dna(&self, id: &str) -> Option<&DnaRecord> {
        self.dnas.get(id)
    }

    /// Record of a logical instance from the latest run that used it
    pub fn instance(&self, id: &str) -> Option<&InstanceRecord> {
        self.instances.get(id)
    }

    /// Wire-id lookup table
    pub fn identities(&self) -> &IdentityTable {
        &self.identities
    }
}

/// Knobs taken from the conductor configuration
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    /// Nonce of the first run
    pub initial_nonce: Nonce,
    /// Budget for each zome call
    pub zome_call_timeout: Duration,
    /// Whether DNAs are uninstalled at teardown
    pub dna_retention: DnaRetention,
}

#[derive(Deserialize)]
struct AgentAdded {
    agent_address: String,
}

#[derive(Deserialize)]
struct DnaInstalled {
    dna_hash: String,
}

struct RunSession {
    signal_task: tokio::task::JoinHandle<()>,
}

/// Creates and removes everything a run needs on the conductor
pub struct ProvisioningOrchestrator {
    admin: AdminChannel,
    connector: Arc<dyn Connector>,
    options: ProvisionOptions,
    state: RunState,
    phase: RunPhase,
    session: Option<RunSession>,
}

impl ProvisioningOrchestrator {
    /// Orchestrator driving `admin`, opening test connections through `connector`
    pub fn new(admin: AdminChannel, connector: Arc<dyn Connector>, options: ProvisionOptions) -> Self {
        Self {
            admin,
            connector,
            state: RunState::new(options.initial_nonce),
            options,
            phase: RunPhase::Idle,
            session: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Provisioning state
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Nonce of the next (or active) run
    pub fn nonce(&self) -> Nonce {
        self.state.nonce
    }

    pub(crate) fn enter(&mut self, phase: RunPhase) {
        debug!(nonce = %self.state.nonce, ?phase, "run phase");
        self.phase = phase;
    }

    /// Provision a run and return handles for its instances
    pub async fn setup(
        &mut self,
        instances: &[InstanceConfig],
        bridges: &[BridgeConfig],
        tracker: Arc<dyn ConsistencyTracker>,
    ) -> ProvisionResult<InstanceMap> {
        if instances.is_empty() {
            return Err(ProvisionError::EmptyRun);
        }
        if !self.state.running.is_empty() {
            return Err(ProvisionError::RunAlreadyActive {
                running: self
                    .state
                    .running
                    .iter()
                    .map(|record| record.wire_id.wire())
                    .collect(),
            });
        }
        info!(
            nonce = %self.state.nonce,
            instances = instances.len(),
            bridges = bridges.len(),
            "provisioning run"
        );

        self.enter(RunPhase::SettingUpInterface);
        let interface = self.setup_new_interface().await?;
        let client = self
            .connector
            .connect(&local_url(interface.port))
            .await
            .map_err(ProvisionError::Connect)?;
        let frames = client.subscribe();
        let zome = ZomeChannel::new(client, self.options.zome_call_timeout);

        self.enter(RunPhase::SettingUpInstances);
        for config in instances {
            self.setup_instance(config, &interface.id).await?;
        }

        self.enter(RunPhase::SettingUpBridges);
        for bridge in bridges {
            self.setup_bridge(bridge).await?;
        }

        self.enter(RunPhase::StartingInstances);
        for record in &self.state.running {
            self.admin_send(AdminCommand::StartInstance(EntityId::new(record.wire_id.wire())))
                .await?;
        }

        self.enter(RunPhase::ConnectingSignals);
        let router = self.signal_router(instances, tracker);
        self.session = Some(RunSession {
            signal_task: tokio::spawn(router.run(frames)),
        });

        let handles = self
            .state
            .running
            .iter()
            .map(|record| {
                let handle = InstanceHandle::new(
                    record.logical_id.clone(),
                    record.wire_id.wire(),
                    record.agent_address.clone(),
                    record.dna_address.clone(),
                    zome.clone(),
                    record.signals.clone(),
                );
                (record.logical_id.clone(), handle)
            })
            .collect();
        self.enter(RunPhase::Running);
        Ok(handles)
    }

    /// Remove everything the matching setup created and advance the nonce
    pub async fn teardown(&mut self) -> ProvisionResult<()> {
        if self.state.running.is_empty() {
            return Err(ProvisionError::NothingRunning);
        }
        let nonce = self.state.nonce;

        self.enter(RunPhase::TearingDownBridges);
        let bridges = std::mem::take(&mut self.state.bridges);
        for bridge in bridges.iter().rev() {
            self.admin_send(AdminCommand::RemoveBridge(RemoveBridge {
                caller_id: qualify(&bridge.caller_logical_id, nonce).wire(),
                callee_id: qualify(&bridge.callee_logical_id, nonce).wire(),
            }))
            .await?;
        }

        self.enter(RunPhase::TearingDownInstances);
        if let Some(interface) = self.state.interface.clone() {
            for record in self.state.running.iter().rev() {
                self.admin_send(AdminCommand::RemoveInstanceFromInterface(InterfaceInstance {
                    interface_id: interface.id.clone(),
                    instance_id: record.wire_id.wire(),
                }))
                .await?;
                self.admin_send(AdminCommand::RemoveInstance(EntityId::new(
                    record.wire_id.wire(),
                )))
                .await?;
            }
            self.admin_send(AdminCommand::RemoveInterface(EntityId::new(interface.id)))
                .await?;
            self.state.interface = None;
        }

        if self.options.dna_retention == DnaRetention::UninstallEachRun {
            for dna_id in self.dnas_in_run().into_iter().rev() {
                if let Some(record) = self.state.dnas.get(&dna_id) {
                    self.admin_send(AdminCommand::UninstallDna(EntityId::new(
                        record.wire_id.wire(),
                    )))
                    .await?;
                }
                self.state.dnas.remove(&dna_id);
            }
        }

        if let Some(session) = self.session.take() {
            session.signal_task.abort();
        }
        self.state.running.clear();
        self.state.nonce = nonce.next();
        self.enter(RunPhase::Idle);
        info!(completed = %nonce, next = %self.state.nonce, "run torn down");
        Ok(())
    }

    async fn admin_send(&self, command: AdminCommand) -> ProvisionResult<Value> {
        let method = command.method();
        self.admin
            .send(command)
            .await
            .map_err(|source| ProvisionError::Rpc { method, source })
    }

    async fn setup_new_interface(&mut self) -> ProvisionResult<TestInterface> {
        let port = free_port().map_err(ProvisionError::Port)?;
        let interface = TestInterface {
            id: format!("{TEST_INTERFACE_ID}-{port}"),
            port,
        };
        self.admin_send(AdminCommand::AddInterface(AddInterface {
            id: interface.id.clone(),
            admin: false,
            kind: "websocket".to_string(),
            port,
        }))
        .await?;
        self.state.interface = Some(interface.clone());
        Ok(interface)
    }

    async fn setup_instance(
        &mut self,
        config: &InstanceConfig,
        interface_id: &str,
    ) -> ProvisionResult<()> {
        let wire = qualify(&config.id, self.state.nonce);
        let agent_address = self.ensure_agent(&config.agent).await?;
        let dna = self.ensure_dna(&config.dna).await?;

        self.admin_send(AdminCommand::AddInstance(AddInstance {
            id: wire.wire(),
            agent_id: config.agent.id.clone(),
            dna_id: dna.wire_id.wire(),
        }))
        .await?;
        self.admin_send(AdminCommand::AddInstanceToInterface(InterfaceInstance {
            interface_id: interface_id.to_string(),
            instance_id: wire.wire(),
        }))
        .await?;

        let record = self
            .state
            .instances
            .entry(config.id.clone())
            .or_insert_with(|| InstanceRecord {
                logical_id: config.id.clone(),
                wire_id: wire.clone(),
                agent_id: config.agent.id.clone(),
                agent_address: agent_address.clone(),
                dna_id: dna.logical_id.clone(),
                dna_wire_id: dna.wire_id.wire(),
                dna_address: dna.content_hash.clone(),
                signals: SignalBuffer::new(),
            });
        record.wire_id = wire.clone();
        record.agent_id = config.agent.id.clone();
        record.agent_address = agent_address;
        record.dna_id = dna.logical_id.clone();
        record.dna_wire_id = dna.wire_id.wire();
        record.dna_address = dna.content_hash;
        let record = record.clone();

        self.state.identities.register(&wire);
        debug!(instance = %config.id, wire_id = %wire, "instance added");
        self.state.running.push(record);
        Ok(())
    }

    async fn ensure_agent(&mut self, config: &AgentConfig) -> ProvisionResult<String> {
        if let Some(agent) = self.state.agents.get(&config.id) {
            return Ok(agent.public_address.clone());
        }
        let result = self
            .admin_send(AdminCommand::AddAgent(AddAgent {
                id: config.id.clone(),
                name: config.name.clone(),
                keystore_file: config.keystore_ref(),
                public_address: config.public_ref(),
                test_agent: true,
            }))
            .await?;
        let added: AgentAdded = parse_result("add_agent", result)?;
        self.state.agents.insert(
            config.id.clone(),
            AgentRecord {
                id: config.id.clone(),
                name: config.name.clone(),
                keystore_ref: config.keystore_ref(),
                public_address: added.agent_address.clone(),
            },
        );
        Ok(added.agent_address)
    }

    async fn ensure_dna(&mut self, config: &DnaConfig) -> ProvisionResult<DnaRecord> {
        let digest = config.fingerprint();
        if let Some(existing) = self.state.dnas.get(&config.id) {
            if let (Some(installed), Some(current)) = (&existing.local_digest, &digest)
                && installed != current
            {
                warn!(dna = %config.id, "DNA file changed since install; reusing installed package");
            }
            return Ok(existing.clone());
        }

        let nonce = self.state.nonce;
        let wire_id = qualify(&config.id, nonce);
        let uuid = uniqueness_token(config.uuid.as_deref(), nonce);
        let result = self
            .admin_send(AdminCommand::InstallDna(InstallDna {
                id: wire_id.wire(),
                path: config.path.to_string_lossy().into_owned(),
                uuid: uuid.clone(),
                copy: true,
                expected_hash: config.hash.clone(),
            }))
            .await?;
        let installed: DnaInstalled = parse_result("install_dna", result)?;

        let record = DnaRecord {
            logical_id: config.id.clone(),
            wire_id,
            source: config.path.clone(),
            content_hash: Some(installed.dna_hash),
            uuid,
            local_digest: digest,
        };
        self.state.dnas.insert(config.id.clone(), record.clone());
        Ok(record)
    }

    async fn setup_bridge(&mut self, bridge: &BridgeConfig) -> ProvisionResult<()> {
        let caller_id = self.running_wire_id(&bridge.handle, &bridge.caller_id)?;
        let callee_id = self.running_wire_id(&bridge.handle, &bridge.callee_id)?;
        self.admin_send(AdminCommand::AddBridge(AddBridge {
            handle: bridge.handle.clone(),
            caller_id,
            callee_id,
        }))
        .await?;
        self.state.bridges.push(BridgeRecord {
            handle: bridge.handle.clone(),
            caller_logical_id: bridge.caller_id.clone(),
            callee_logical_id: bridge.callee_id.clone(),
        });
        Ok(())
    }

    fn running_wire_id(&self, handle: &str, logical: &str) -> ProvisionResult<String> {
        if !self
            .state
            .running
            .iter()
            .any(|record| record.logical_id == logical)
        {
            return Err(ProvisionError::UnknownBridgeEndpoint {
                handle: handle.to_string(),
                instance: logical.to_string(),
            });
        }
        Ok(qualify(logical, self.state.nonce).wire())
    }

    /// DNA logical ids used by the active run, each once, in first-use order
    fn dnas_in_run(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for record in &self.state.running {
            if !seen.contains(&record.dna_id) {
                seen.push(record.dna_id.clone());
            }
        }
        seen
    }

    fn signal_router(
        &self,
        instances: &[InstanceConfig],
        tracker: Arc<dyn ConsistencyTracker>,
    ) -> SignalRouter {
        let routes = instances
            .iter()
            .filter_map(|config| {
                let record = self.state.instances.get(&config.id)?;
                Some((
                    config.id.clone(),
                    SignalRoute {
                        dna: config.dna.id.clone(),
                        buffer: record.signals.clone(),
                    },
                ))
            })
            .collect();
        SignalRouter::new(self.state.identities.clone(), routes, tracker)
    }
}

fn parse_result<T: DeserializeOwned>(method: &'static str, value: Value) -> ProvisionResult<T> {
    serde_json::from_value(value).map_err(|err| ProvisionError::MalformedResponse {
        method,
        detail: err.to_string(),
    })
}
