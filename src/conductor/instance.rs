//! Instance handles given to scenario code

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::{ZomeCallError, ZomeCallResult};
use super::signal::{ConsistencyTracker, ReceivedSignal, SignalBuffer};
use super::zome::{CallAddress, ZomeChannel};

/// Handles keyed by logical instance id
pub type InstanceMap = BTreeMap<String, InstanceHandle>;

/// A running instance as seen by a scenario
#[derive(Clone)]
pub struct InstanceHandle {
    id: String,
    wire_id: String,
    agent_address: String,
    dna_address: Option<String>,
    zome: ZomeChannel,
    signals: SignalBuffer,
    sync_tracker: Option<Arc<dyn ConsistencyTracker>>,
    agent_id: Option<String>,
}

impl InstanceHandle {
    pub(crate) fn new(
        id: String,
        wire_id: String,
        agent_address: String,
        dna_address: Option<String>,
        zome: ZomeChannel,
        signals: SignalBuffer,
    ) -> Self {
        Self {
            id,
            wire_id,
            agent_address,
            dna_address,
            zome,
            signals,
            sync_tracker: None,
            agent_id: None,
        }
    }

    /// Logical instance id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Instance id used on the wire during this run
    pub fn wire_id(&self) -> &str {
        &self.wire_id
    }

    /// Address of the agent running the instance
    pub fn agent_address(&self) -> &str {
        &self.agent_address
    }

    /// Hash reported when the DNA was installed
    pub fn dna_address(&self) -> Option<&str> {
        self.dna_address.as_deref()
    }

    /// Agent id, available once the agent-id decorator has been applied
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// Signals received for this instance, oldest first
    pub fn signals(&self) -> Vec<ReceivedSignal> {
        self.signals.snapshot()
    }

    /// Call a zome function on this instance
    pub async fn call(&self, zome: &str, function: &str, params: Value) -> ZomeCallResult<Value> {
        let address = CallAddress::new(self.wire_id.clone(), zome, function);
        self.zome.call(&address, params).await
    }

    /// Call, then wait for the network to settle
    pub async fn call_sync(
        &self,
        zome: &str,
        function: &str,
        params: Value,
    ) -> ZomeCallResult<Value> {
        let tracker = self
            .sync_tracker
            .clone()
            .ok_or_else(|| ZomeCallError::CallSyncUnavailable(self.id.clone()))?;
        let result = self.call(zome, function, params).await?;
        tracker.settled().await;
        Ok(result)
    }

    pub(crate) fn enable_call_sync(&mut self, tracker: Arc<dyn ConsistencyTracker>) {
        self.sync_tracker = Some(tracker);
    }

    pub(crate) fn enable_agent_id(&mut self) {
        self.agent_id = Some(self.agent_address.clone());
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("id", &self.id)
            .field("wire_id", &self.wire_id)
            .field("agent_address", &self.agent_address)
            .field("dna_address", &self.dna_address)
            .field("call_sync", &self.sync_tracker.is_some())
            .finish()
    }
}
