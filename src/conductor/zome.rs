//! Zome-call channel used by scenario code
//!
//! Calls race the transport against a per-call budget. Dropping the losing
//! side is the cancellation: on success the timer is discarded, on timeout the
//! pending reply is abandoned and a late answer never reaches the caller.

use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::error::{ZomeCallError, ZomeCallResult};
use super::transport::RpcClient;

/// Default per-call budget
pub const DEFAULT_ZOME_CALL_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Wire method for zome calls
pub const ZOME_CALL_METHOD: &str = "call";

/// Address of a zome function on a running instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAddress {
    /// Nonce-qualified instance id
    pub instance_id: String,
    /// Zome name
    pub zome: String,
    /// Function name
    pub function: String,
}

impl CallAddress {
    /// Build an address
    pub fn new(
        instance_id: impl Into<String>,
        zome: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            zome: zome.into(),
            function: function.into(),
        }
    }
}

impl fmt::Display for CallAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.instance_id, self.zome, self.function)
    }
}

/// Timeout-guarded zome caller bound to one test interface
#[derive(Clone)]
pub struct ZomeChannel {
    client: Arc<dyn RpcClient>,
    timeout: Duration,
}

impl ZomeChannel {
    /// Wrap a connected test-interface client
    pub fn new(client: Arc<dyn RpcClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Configured budget
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call a zome function
    pub async fn call(&self, address: &CallAddress, params: Value) -> ZomeCallResult<Value> {
        debug!(address = %address, params = %params, "calling");
        let payload = json!({
            "instance_id": address.instance_id,
            "zome": address.zome,
            "function": address.function,
            "args": params,
        });

        match tokio::time::timeout(self.timeout, self.client.call(ZOME_CALL_METHOD, payload)).await
        {
            Ok(Ok(result)) => {
                debug!(address = %address, result = %result, "->");
                Ok(result)
            }
            Ok(Err(err)) => Err(ZomeCallError::Transport(err)),
            Err(_elapsed) => Err(ZomeCallError::Timeout {
                seconds: self.timeout.as_secs_f64(),
                address: address.to_string(),
            }),
        }
    }
}
