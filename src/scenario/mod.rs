//! Scenario registry
//!
//! A [`Diorama`] holds the instance and bridge layout shared by a suite of
//! scenarios and runs them one after another against a single long-lived
//! [`Conductor`]. Each scenario gets a fresh consistency tracker built from the
//! network model, and its instance handles pass through the configured
//! [`Decorator`]s before the scenario sees them.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::conductor::{
    Conductor, ConsistencyTracker, HarnessError, InstanceMap, NoopTracker, Result, RunPlan,
};
use crate::conductor::instance::InstanceHandle;
use crate::conductor::types::{BridgeConfig, DnaConfig, InstanceConfig};

/// Logical instance ids grouped by logical DNA id
pub type NetworkModel = BTreeMap<String, Vec<String>>;

/// Group `instances` into one network per DNA, keeping their order
pub fn network_model(instances: &[InstanceConfig]) -> NetworkModel {
    let mut model = NetworkModel::new();
    for instance in instances {
        model
            .entry(instance.dna.id.clone())
            .or_default()
            .push(instance.id.clone());
    }
    model
}

/// Builds the consistency tracker for one scenario
pub trait TrackerFactory: Send + Sync {
    /// Tracker watching the given networks
    fn build(&self, model: &NetworkModel) -> Arc<dyn ConsistencyTracker>;
}

impl<F> TrackerFactory for F
where
    F: Fn(&NetworkModel) -> Arc<dyn ConsistencyTracker> + Send + Sync,
{
    fn build(&self, model: &NetworkModel) -> Arc<dyn ConsistencyTracker> {
        self(model)
    }
}

/// Factory producing [`NoopTracker`]s
#[derive(Debug, Default)]
pub struct NoopTrackerFactory;

impl TrackerFactory for NoopTrackerFactory {
    fn build(&self, _model: &NetworkModel) -> Arc<dyn ConsistencyTracker> {
        Arc::new(NoopTracker)
    }
}

/// Handle on the harness passed to every scenario
#[derive(Clone)]
pub struct ScenarioApi {
    tracker: Arc<dyn ConsistencyTracker>,
}

impl ScenarioApi {
    /// API backed by `tracker`
    pub fn new(tracker: Arc<dyn ConsistencyTracker>) -> Self {
        Self { tracker }
    }

    /// Wait until every network in the scenario has settled
    pub async fn consistent(&self) {
        self.tracker.settled().await;
    }

    /// Tracker of the scenario
    pub fn tracker(&self) -> Arc<dyn ConsistencyTracker> {
        Arc::clone(&self.tracker)
    }
}

/// Convenience applied to instance handles before a scenario runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decorator {
    /// Enable [`InstanceHandle::call_sync`]: call, then wait for consistency
    CallSync,
    /// Expose [`InstanceHandle::agent_id`], equal to the agent address
    AgentId,
}

impl Decorator {
    /// Apply to one handle
    pub fn apply(&self, handle: &mut InstanceHandle, api: &ScenarioApi) {
        match self {
            Decorator::CallSync => handle.enable_call_sync(api.tracker()),
            Decorator::AgentId => handle.enable_agent_id(),
        }
    }
}

/// Apply `decorators` in order to every handle
pub fn decorate(instances: &mut InstanceMap, decorators: &[Decorator], api: &ScenarioApi) {
    for decorator in decorators {
        for handle in instances.values_mut() {
            decorator.apply(handle, api);
        }
    }
}

type ScenarioFn =
    Box<dyn Fn(ScenarioApi, InstanceMap) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Scenario {
    description: String,
    only: bool,
    body: ScenarioFn,
}

/// How a scenario ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioOutcome {
    /// Completed without error
    Passed,
    /// Returned an error; the run was still torn down
    Failed(String),
}

/// Result of one executed scenario
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    /// Scenario description
    pub description: String,
    /// Outcome
    pub outcome: ScenarioOutcome,
    /// Wall time including provisioning and teardown
    pub elapsed: Duration,
}

impl ScenarioReport {
    /// True if the scenario passed
    pub fn passed(&self) -> bool {
        self.outcome == ScenarioOutcome::Passed
    }
}

/// Suite of scenarios sharing one conductor and one instance layout
pub struct Diorama {
    conductor: Conductor,
    instances: Vec<InstanceConfig>,
    bridges: Vec<BridgeConfig>,
    decorators: Vec<Decorator>,
    tracker_factory: Arc<dyn TrackerFactory>,
    tracker: Option<Arc<dyn ConsistencyTracker>>,
    scenarios: Vec<Scenario>,
}

impl Diorama {
    /// Empty suite on `conductor`
    pub fn new(conductor: Conductor) -> Self {
        Self {
            conductor,
            instances: Vec::new(),
            bridges: Vec::new(),
            decorators: Vec::new(),
            tracker_factory: Arc::new(NoopTrackerFactory),
            tracker: None,
            scenarios: Vec::new(),
        }
    }

    /// Add an instance named after its agent
    pub fn agent(mut self, agent_id: impl Into<String>, dna: DnaConfig) -> Self {
        self.instances.push(InstanceConfig::for_agent(agent_id, dna));
        self
    }

    /// Add an instance
    pub fn instance(mut self, instance: InstanceConfig) -> Self {
        self.instances.push(instance);
        self
    }

    /// Add a bridge
    pub fn bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridges.push(bridge);
        self
    }

    /// Append a decorator; decorators apply in the order added
    pub fn decorator(mut self, decorator: Decorator) -> Self {
        self.decorators.push(decorator);
        self
    }

    /// Use `factory` to build each scenario's tracker
    pub fn tracker_factory(mut self, factory: impl TrackerFactory + 'static) -> Self {
        self.tracker_factory = Arc::new(factory);
        self
    }

    /// Configured instances
    pub fn instances(&self) -> &[InstanceConfig] {
        &self.instances
    }

    /// Underlying conductor
    pub fn conductor(&self) -> &Conductor {
        &self.conductor
    }

    /// Register a scenario
    pub fn register<F, Fut>(&mut self, description: impl Into<String>, scenario: F)
    where
        F: Fn(ScenarioApi, InstanceMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(description.into(), false, scenario);
    }

    /// Register a scenario and restrict the suite to `only` scenarios
    pub fn register_only<F, Fut>(&mut self, description: impl Into<String>, scenario: F)
    where
        F: Fn(ScenarioApi, InstanceMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(description.into(), true, scenario);
    }

    fn push<F, Fut>(&mut self, description: String, only: bool, scenario: F)
    where
        F: Fn(ScenarioApi, InstanceMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.scenarios.push(Scenario {
            description,
            only,
            body: Box::new(move |api: ScenarioApi, instances: InstanceMap| {
                scenario(api, instances).boxed()
            }),
        });
    }

    /// Run the registered scenarios in order
    ///
    /// When any scenario was registered with [`Diorama::register_only`], only
    /// those run. Scenario failures are reported; an abort ends the suite with
    /// an error.
    pub async fn run(&mut self) -> Result<Vec<ScenarioReport>> {
        self.conductor.initialize().await?;

        let scenarios = std::mem::take(&mut self.scenarios);
        let only = scenarios.iter().filter(|scenario| scenario.only).count();
        if only > 0 {
            warn!("only was invoked, only running {only} test(s)!");
        }

        let mut reports = Vec::new();
        let mut outcome = Ok(());
        for scenario in scenarios.iter().filter(|scenario| only == 0 || scenario.only) {
            match self.run_scenario(scenario).await {
                Ok(report) => reports.push(report),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        self.scenarios = scenarios;
        outcome.map(|()| reports)
    }

    async fn run_scenario(&mut self, scenario: &Scenario) -> Result<ScenarioReport> {
        info!(description = %scenario.description, "scenario");
        let started = Instant::now();
        let tracker = self.refresh_tracker().await;
        let api = ScenarioApi::new(Arc::clone(&tracker));
        let plan = RunPlan::new(self.instances.clone())
            .with_bridges(self.bridges.clone())
            .with_tracker(tracker);
        let decorators = self.decorators.clone();

        let result = self
            .conductor
            .run(&plan, |mut instances| {
                decorate(&mut instances, &decorators, &api);
                (scenario.body)(api.clone(), instances)
            })
            .await;

        let outcome = match result {
            Ok(()) => ScenarioOutcome::Passed,
            Err(HarnessError::Scenario(err)) => ScenarioOutcome::Failed(format!("{err:#}")),
            Err(err) => return Err(err),
        };
        Ok(ScenarioReport {
            description: scenario.description.clone(),
            outcome,
            elapsed: started.elapsed(),
        })
    }

    /// Flush the previous scenario's tracker and build a fresh one
    async fn refresh_tracker(&mut self) -> Arc<dyn ConsistencyTracker> {
        if let Some(previous) = self.tracker.take() {
            info!("test over, waiting for tracker to flush");
            previous.settled().await;
        }
        let tracker = self.tracker_factory.build(&network_model(&self.instances));
        self.tracker = Some(Arc::clone(&tracker));
        tracker
    }

    /// Stop the conductor
    pub async fn close(&mut self) {
        self.conductor.kill().await;
    }
}
