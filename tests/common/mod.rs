#![allow(dead_code)]

use async_trait::async_trait;
use diorama::conductor::error::{TransportError, TransportResult};
use diorama::conductor::signal::Observation;
use diorama::conductor::transport::{Connector, RpcClient};
use diorama::conductor::types::DnaConfig;
use diorama::conductor::{AbortPolicy, ConsistencyTracker};
use diorama::{Conductor, ConductorConfig};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

pub const ADMIN_URL: &str = "ws://localhost:4000";

/// Scripted in-memory conductor shared by every client it hands out
#[derive(Default)]
pub struct MockConductor {
    admin_calls: Mutex<Vec<(String, Value)>>,
    zome_calls: Mutex<Vec<Value>>,
    connects: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Value>>>,
    fail_method: Mutex<Option<String>>,
    zome_delay: Mutex<Option<Duration>>,
}

impl MockConductor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn admin_calls(&self) -> Vec<(String, Value)> {
        self.admin_calls.lock().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.admin_calls
            .lock()
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.admin_calls
            .lock()
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn zome_calls(&self) -> Vec<Value> {
        self.zome_calls.lock().clone()
    }

    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().clone()
    }

    pub fn clear(&self) {
        self.admin_calls.lock().clear();
    }

    /// Reject every later admin call to `method`
    pub fn fail_on(&self, method: &str) {
        *self.fail_method.lock() = Some(method.to_string());
    }

    /// Delay zome replies by `delay`
    pub fn delay_zome_calls(&self, delay: Duration) {
        *self.zome_delay.lock() = Some(delay);
    }

    /// Push a signal frame to every subscriber
    pub fn emit(&self, frame: Value) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(frame.clone()).is_ok());
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector(Arc::clone(self)))
    }

    fn admin_reply(&self, method: &str, params: &Value) -> TransportResult<Value> {
        if self.fail_method.lock().as_deref() == Some(method) {
            return Err(TransportError::Rpc {
                code: -32000,
                message: format!("{method} rejected"),
            });
        }
        let id = params["id"].as_str().unwrap_or_default();
        Ok(match method {
            "add_agent" => json!({"agent_address": format!("Hc{id}")}),
            "install_dna" => json!({"dna_hash": format!("Qm{id}")}),
            _ => json!({"success": true}),
        })
    }
}

struct MockConnector(Arc<MockConductor>);

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> TransportResult<Arc<dyn RpcClient>> {
        self.0.connects.lock().push(url.to_string());
        Ok(Arc::new(MockClient(Arc::clone(&self.0))))
    }
}

struct MockClient(Arc<MockConductor>);

#[async_trait]
impl RpcClient for MockClient {
    async fn call(&self, method: &str, params: Value) -> TransportResult<Value> {
        if method == "call" {
            self.0.zome_calls.lock().push(params.clone());
            let delay = *self.0.zome_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            return Ok(params["args"].clone());
        }
        self.0
            .admin_calls
            .lock()
            .push((method.to_string(), params.clone()));
        self.0.admin_reply(method, &params)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.subscribers.lock().push(tx);
        rx
    }
}

/// Tracker recording observations and settle requests
#[derive(Default)]
pub struct RecordingTracker {
    pub observations: Mutex<Vec<Observation>>,
    pub settles: AtomicUsize,
}

impl RecordingTracker {
    pub fn settle_count(&self) -> usize {
        self.settles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsistencyTracker for RecordingTracker {
    fn observe(&self, observation: Observation) {
        self.observations.lock().push(observation);
    }

    async fn settled(&self) {
        self.settles.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_config() -> ConductorConfig {
    ConductorConfig {
        abort_policy: AbortPolicy::Return,
        startup_timeout_ms: 500,
        zome_call_timeout_ms: 1_000,
        ..ConductorConfig::default()
    }
}

pub fn attached(mock: &Arc<MockConductor>, config: ConductorConfig) -> Conductor {
    Conductor::attach(config, ADMIN_URL, mock.connector())
}

pub fn app_dna() -> DnaConfig {
    DnaConfig::with_id("dist/app.dna.json", "app")
}

/// Poll `check` until it holds or a second passes
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn position(methods: &[String], method: &str) -> usize {
    methods
        .iter()
        .position(|name| name == method)
        .unwrap_or_else(|| panic!("{method} was never called"))
}

pub fn last_position(methods: &[String], method: &str) -> usize {
    methods
        .iter()
        .rposition(|name| name == method)
        .unwrap_or_else(|| panic!("{method} was never called"))
}
