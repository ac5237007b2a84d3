//! Signal routing
//!
//! Consistency signals feed the scenario's [`ConsistencyTracker`]; everything
//! else lands in the originating instance's [`SignalBuffer`]. Wire ids are
//! resolved through the [`IdentityTable`] built during provisioning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::error::{SignalError, SignalResult};
use super::identity::IdentityTable;

/// Signal type forwarded to the consistency tracker
pub const CONSISTENCY_SIGNAL_TYPE: &str = "Consistency";

/// One observation handed to the consistency tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Logical instance id
    pub node: String,
    /// Signal with its events JSON-encoded
    pub signal: Value,
    /// Logical DNA id of the instance
    pub dna: String,
}

/// External collaborator deciding when a network has converged
#[async_trait]
pub trait ConsistencyTracker: Send + Sync {
    /// Record a consistency signal
    fn observe(&self, observation: Observation);

    /// Resolve once every tracked node has settled
    async fn settled(&self);
}

/// Tracker that ignores observations and is always settled
#[derive(Debug, Default)]
pub struct NoopTracker;

#[async_trait]
impl ConsistencyTracker for NoopTracker {
    fn observe(&self, _observation: Observation) {}

    async fn settled(&self) {}
}

/// A signal with its arrival time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedSignal {
    /// When the harness received it
    pub received_at: DateTime<Utc>,
    /// Signal body as sent by the conductor
    pub signal: Value,
}

/// Append-only, shared, per-instance signal log
#[derive(Debug, Clone, Default)]
pub struct SignalBuffer(Arc<Mutex<Vec<ReceivedSignal>>>);

impl SignalBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a signal
    pub fn push(&self, signal: Value) {
        self.0.lock().push(ReceivedSignal {
            received_at: Utc::now(),
            signal,
        });
    }

    /// Copy of every signal received so far, oldest first
    pub fn snapshot(&self) -> Vec<ReceivedSignal> {
        self.0.lock().clone()
    }

    /// Number of buffered signals
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// True if nothing has arrived
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct SignalMessage {
    signal: Value,
    instance_id: String,
}

/// Routing entry for one configured logical instance
#[derive(Debug, Clone)]
pub struct SignalRoute {
    /// Logical DNA id
    pub dna: String,
    /// Buffer for non-consistency signals
    pub buffer: SignalBuffer,
}

/// What [`SignalRouter::route`] did with a signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Forwarded to the consistency tracker
    Consistency {
        /// Logical instance id
        node: String,
    },
    /// Appended to the instance's buffer
    Buffered {
        /// Logical instance id
        node: String,
    },
    /// Came from an earlier run's incarnation and was dropped
    Stale {
        /// Wire id reported by the signal
        instance_id: String,
    },
}

/// Dispatches incoming signal frames
pub struct SignalRouter {
    identities: IdentityTable,
    routes: HashMap<String, SignalRoute>,
    tracker: Arc<dyn ConsistencyTracker>,
}

impl SignalRouter {
    /// Router over the configured instances of a run
    pub fn new(
        identities: IdentityTable,
        routes: HashMap<String, SignalRoute>,
        tracker: Arc<dyn ConsistencyTracker>,
    ) -> Self {
        Self {
            identities,
            routes,
            tracker,
        }
    }

    /// Route one raw signal frame
    pub fn route(&self, frame: Value) -> SignalResult<Routed> {
        let message: SignalMessage =
            serde_json::from_value(frame).map_err(|err| SignalError::Malformed(err.to_string()))?;
        let unroutable = || SignalError::Unroutable {
            instance_id: message.instance_id.clone(),
        };
        let node = self
            .identities
            .logical_of(&message.instance_id)
            .ok_or_else(unroutable)?;
        let route = self.routes.get(node).ok_or_else(unroutable)?;

        let signal_type = message.signal.get("signal_type").and_then(Value::as_str);
        if signal_type == Some(CONSISTENCY_SIGNAL_TYPE) {
            self.tracker.observe(Observation {
                node: node.to_string(),
                signal: stringify_signal(&message.signal),
                dna: route.dna.clone(),
            });
            return Ok(Routed::Consistency {
                node: node.to_string(),
            });
        }

        if !self.identities.is_current(&message.instance_id) {
            debug!(instance_id = %message.instance_id, "dropping signal from a previous run");
            return Ok(Routed::Stale {
                instance_id: message.instance_id,
            });
        }
        route.buffer.push(message.signal);
        Ok(Routed::Buffered {
            node: node.to_string(),
        })
    }

    /// Route frames until the stream ends or a frame cannot be routed
    pub async fn run(self, mut frames: mpsc::UnboundedReceiver<Value>) {
        while let Some(frame) = frames.recv().await {
            if let Err(err) = self.route(frame) {
                error!(error = %err, "signal routing stopped");
                break;
            }
        }
    }
}

/// JSON-encode the `event` of a signal and of each pending entry
pub fn stringify_signal(signal: &Value) -> Value {
    let mut signal = signal.clone();
    if let Some(event) = signal.get_mut("event") {
        *event = Value::String(event.to_string());
    }
    if let Some(pending) = signal.get_mut("pending").and_then(Value::as_array_mut) {
        for entry in pending {
            if let Some(event) = entry.get_mut("event") {
                *event = Value::String(event.to_string());
            }
        }
    }
    signal
}
