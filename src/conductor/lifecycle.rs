//! Run lifecycle
//!
//! [`Conductor`] starts the conductor process once and then executes scenario
//! runs against it one at a time: provision, run the scenario, tear down. A
//! provisioning or teardown failure leaves the conductor in an unknown state
//! and aborts; a scenario failure only fails that scenario.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::admin::AdminChannel;
use super::config_file::{self, ConductorFile};
use super::error::{HarnessError, ProvisionError, Result, SpawnError, TransportError};
use super::identity::Nonce;
use super::instance::InstanceMap;
use super::orchestrator::{ProvisionOptions, ProvisioningOrchestrator, RunPhase};
use super::process::ProcessSupervisor;
use super::signal::{ConsistencyTracker, NoopTracker};
use super::transport::{Connector, RpcClient, WebSocketConnector, free_port, local_url};
use super::types::{BridgeConfig, InstanceConfig};
use super::{AbortPolicy, ConductorConfig};

/// Prefix of generated storage directories
pub const STORAGE_PREFIX: &str = "hc-diorama-";

const ADMIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What one run provisions
#[derive(Clone)]
pub struct RunPlan {
    /// Instances, in setup order
    pub instances: Vec<InstanceConfig>,
    /// Bridges between those instances
    pub bridges: Vec<BridgeConfig>,
    /// Receiver of consistency observations for this run
    pub tracker: Arc<dyn ConsistencyTracker>,
}

impl RunPlan {
    /// Plan without bridges and with a no-op tracker
    pub fn new(instances: Vec<InstanceConfig>) -> Self {
        Self {
            instances,
            bridges: Vec::new(),
            tracker: Arc::new(NoopTracker),
        }
    }

    /// Add bridges
    pub fn with_bridges(mut self, bridges: Vec<BridgeConfig>) -> Self {
        self.bridges = bridges;
        self
    }

    /// Replace the tracker
    pub fn with_tracker(mut self, tracker: Arc<dyn ConsistencyTracker>) -> Self {
        self.tracker = tracker;
        self
    }
}

enum Storage {
    Temp(TempDir),
    Fixed(PathBuf),
}

impl Storage {
    fn path(&self) -> &Path {
        match self {
            Storage::Temp(dir) => dir.path(),
            Storage::Fixed(path) => path.as_path(),
        }
    }
}

enum Launch {
    Spawn,
    Attach { admin_url: String },
}

/// A long-lived conductor shared by consecutive runs
pub struct Conductor {
    config: ConductorConfig,
    connector: Arc<dyn Connector>,
    launch: Launch,
    storage: Option<Storage>,
    process: Option<ProcessSupervisor>,
    orchestrator: Option<ProvisioningOrchestrator>,
    aborted: bool,
}

impl Conductor {
    /// Conductor that spawns `config.binary` and talks websocket JSON-RPC
    pub fn new(config: ConductorConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Conductor that spawns `config.binary` and connects through `connector`
    pub fn with_connector(config: ConductorConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            launch: Launch::Spawn,
            storage: None,
            process: None,
            orchestrator: None,
            aborted: false,
        }
    }

    /// Conductor driving an already running process at `admin_url`
    ///
    /// No process is spawned and [`Conductor::kill`] leaves the process alone.
    pub fn attach(
        config: ConductorConfig,
        admin_url: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            launch: Launch::Attach {
                admin_url: admin_url.into(),
            },
            ..Self::with_connector(config, connector)
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    /// True once [`Conductor::initialize`] has completed
    pub fn is_initialized(&self) -> bool {
        self.orchestrator.is_some()
    }

    /// True after an abort under [`AbortPolicy::Return`]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Storage directory of a spawned conductor
    pub fn storage_dir(&self) -> Option<&Path> {
        self.storage.as_ref().map(Storage::path)
    }

    /// Nonce of the next run
    pub fn nonce(&self) -> Option<Nonce> {
        self.orchestrator.as_ref().map(ProvisioningOrchestrator::nonce)
    }

    /// Provisioning state machine, once initialized
    pub fn orchestrator(&self) -> Option<&ProvisioningOrchestrator> {
        self.orchestrator.as_ref()
    }

    /// Exit code of a spawned conductor that has ended
    pub fn exit_code(&self) -> Option<i32> {
        self.process.as_ref().and_then(ProcessSupervisor::exit_code)
    }

    /// Start (or attach to) the conductor; later calls do nothing
    pub async fn initialize(&mut self) -> Result<()> {
        if self.aborted {
            return Err(HarnessError::Unusable);
        }
        if self.orchestrator.is_some() {
            return Ok(());
        }
        match self.start().await {
            Ok(orchestrator) => {
                self.orchestrator = Some(orchestrator);
                Ok(())
            }
            Err(err) => Err(self.abort(err).await),
        }
    }

    async fn start(&mut self) -> Result<ProvisioningOrchestrator> {
        let attach_url = match &self.launch {
            Launch::Attach { admin_url } => Some(admin_url.clone()),
            Launch::Spawn => None,
        };
        let admin_url = match attach_url {
            Some(url) => url,
            None => self.spawn_process()?,
        };
        let client = self.connect_admin(&admin_url).await?;
        info!(url = %admin_url, "admin interface connected");

        Ok(ProvisioningOrchestrator::new(
            AdminChannel::new(client),
            Arc::clone(&self.connector),
            ProvisionOptions {
                initial_nonce: Nonce::new(self.config.initial_nonce),
                zome_call_timeout: self.config.zome_call_timeout(),
                dna_retention: self.config.dna_retention,
            },
        ))
    }

    fn spawn_process(&mut self) -> Result<String> {
        let admin_port = match self.config.admin_port {
            Some(port) => port,
            None => free_port().map_err(SpawnError::Port)?,
        };
        let storage = self.prepare_storage()?;
        let config_path = config_file::write(
            storage.path(),
            &ConductorFile {
                persistence_dir: storage.path().to_path_buf(),
                admin_port,
                debug_log: self.config.debug_log,
                dpki: self.config.dpki.clone(),
            },
        )?;
        debug!(path = %config_path.display(), "conductor config written");
        self.storage = Some(storage);
        let process = ProcessSupervisor::spawn(&self.config.binary, &config_path)?;
        info!(pid = ?process.pid(), admin_port, "conductor spawned");
        self.process = Some(process);
        Ok(local_url(admin_port))
    }

    fn prepare_storage(&self) -> Result<Storage> {
        match &self.config.storage_dir {
            Some(path) => {
                std::fs::create_dir_all(path).map_err(|source| SpawnError::Storage {
                    path: path.clone(),
                    source,
                })?;
                Ok(Storage::Fixed(path.clone()))
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix(STORAGE_PREFIX)
                    .tempdir()
                    .map_err(|source| SpawnError::Storage {
                        path: std::env::temp_dir(),
                        source,
                    })?;
                Ok(Storage::Temp(dir))
            }
        }
    }

    /// Poll until the freshly started conductor accepts the admin connection
    async fn connect_admin(&self, url: &str) -> Result<Arc<dyn RpcClient>> {
        let budget = self.config.startup_timeout();
        let deadline = Instant::now() + budget;
        loop {
            let last_error = match self.connector.connect(url).await {
                Ok(client) => return Ok(client),
                Err(err) => err,
            };
            if let Some(code) = self.exit_code() {
                return Err(admin_unreachable(
                    url,
                    budget,
                    TransportError::Connect {
                        url: url.to_string(),
                        detail: format!("conductor exited with code {code}"),
                    },
                ));
            }
            if Instant::now() + ADMIN_POLL_INTERVAL > deadline {
                return Err(admin_unreachable(url, budget, last_error));
            }
            tokio::time::sleep(ADMIN_POLL_INTERVAL).await;
        }
    }

    /// Provision `plan`, run `scenario` against it and tear it down again
    ///
    /// A failing scenario still gets its run torn down; its error is returned
    /// as [`HarnessError::Scenario`] and the conductor stays usable. An empty
    /// plan is refused up front without aborting.
    pub async fn run<F, Fut>(&mut self, plan: &RunPlan, scenario: F) -> Result<()>
    where
        F: FnOnce(InstanceMap) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.aborted {
            return Err(HarnessError::Unusable);
        }
        let orchestrator = self.orchestrator.as_mut().ok_or(HarnessError::NotInitialized)?;

        let instances = match orchestrator
            .setup(&plan.instances, &plan.bridges, Arc::clone(&plan.tracker))
            .await
        {
            Ok(instances) => instances,
            // rejected before any admin call, the conductor is untouched
            Err(ProvisionError::EmptyRun) => return Err(ProvisionError::EmptyRun.into()),
            Err(err) => {
                orchestrator.enter(RunPhase::Aborting);
                return Err(self.abort(err.into()).await);
            }
        };

        let outcome = scenario(instances).await;
        let orchestrator = self.orchestrator.as_mut().ok_or(HarnessError::NotInitialized)?;
        if outcome.is_err() {
            orchestrator.enter(RunPhase::Failing);
        }
        if let Err(err) = orchestrator.teardown().await {
            orchestrator.enter(RunPhase::Aborting);
            return Err(self.abort(err.into()).await);
        }

        outcome.map_err(fail_test)
    }

    /// Stop the conductor; in attach mode only the connection is dropped
    pub async fn kill(&mut self) {
        self.orchestrator = None;
        if let Some(mut process) = self.process.take() {
            process.kill().await;
        }
    }

    async fn abort(&mut self, err: HarnessError) -> HarnessError {
        error!(error = %err, "aborting conductor");
        self.kill().await;
        self.aborted = true;
        match self.config.abort_policy {
            AbortPolicy::Exit => std::process::exit(-1),
            AbortPolicy::Return => HarnessError::Aborted(Box::new(err)),
        }
    }
}

fn fail_test(err: anyhow::Error) -> HarnessError {
    warn!(error = %err, "scenario failed");
    HarnessError::Scenario(err)
}

fn admin_unreachable(url: &str, budget: Duration, source: TransportError) -> HarnessError {
    SpawnError::AdminUnreachable {
        url: url.to_string(),
        waited_ms: budget.as_millis() as u64,
        source,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::conductor::error::TransportResult;

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self, url: &str) -> TransportResult<Arc<dyn RpcClient>> {
            Err(TransportError::Connect {
                url: url.to_string(),
                detail: "connection refused".into(),
            })
        }
    }

    fn returning() -> ConductorConfig {
        ConductorConfig {
            abort_policy: AbortPolicy::Return,
            startup_timeout_ms: 250,
            ..ConductorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_run_before_initialize_is_rejected() {
        let mut conductor = Conductor::with_connector(returning(), Arc::new(Refusing));
        let err = conductor
            .run(&RunPlan::new(Vec::new()), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::NotInitialized));
    }

    #[tokio::test]
    async fn test_unreachable_admin_aborts() {
        let mut conductor =
            Conductor::attach(returning(), "ws://localhost:1", Arc::new(Refusing));
        let err = conductor.initialize().await.unwrap_err();
        match err {
            HarnessError::Aborted(inner) => {
                assert!(matches!(*inner, HarnessError::Spawn(SpawnError::AdminUnreachable { .. })))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(conductor.is_aborted());
        assert!(matches!(conductor.initialize().await, Err(HarnessError::Unusable)));
    }

    #[tokio::test]
    async fn test_missing_binary_aborts_with_spawn_error() {
        let storage = TempDir::new().unwrap();
        let mut conductor = Conductor::with_connector(
            ConductorConfig {
                binary: "diorama-no-such-conductor".into(),
                storage_dir: Some(storage.path().join("store")),
                ..returning()
            },
            Arc::new(Refusing),
        );
        let err = conductor.initialize().await.unwrap_err();
        match err {
            HarnessError::Aborted(inner) => {
                assert!(matches!(*inner, HarnessError::Spawn(SpawnError::Launch { .. })))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(storage.path().join("store").join(config_file::CONFIG_FILE_NAME).exists());
    }
}
