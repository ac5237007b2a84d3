//! Diorama – scenario harness for a long-lived conductor process
//!
//! This crate drives an external conductor for scenario tests:
//! - Spawns the conductor once from a generated config file
//! - Provisions agents, DNAs, instances and bridges per run over the admin interface
//! - Keeps repeated runs apart with nonce-qualified wire ids
//! - Guards zome calls with a timeout and routes signals to a consistency tracker
//! - Tears each run down in reverse so the next one starts clean

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Conductor process, provisioning and run lifecycle
pub mod conductor;

/// Scenario registry and scenario-facing conveniences
pub mod scenario;

// Re-export key types for convenience
pub use conductor::{Conductor, ConductorConfig, HarnessError, RunPlan};
pub use scenario::{Decorator, Diorama, ScenarioApi};

/// Current version of the diorama crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
