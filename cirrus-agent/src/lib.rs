//! cirrus-agent: reconciles the network resources of a cluster manifest.
//!
//! The agent owns two services, security groups and virtual networks, and runs
//! them against a provider through the `cirrus-lro` engine. Operation records
//! and conditions live in a status file, so an interrupted agent picks up the
//! operations its predecessor started.

pub mod agent;
pub mod audit;
pub mod clients;
pub mod config;
pub mod services;
pub mod status;

pub use agent::{Action, AgentSettings, PassOutcome, ReconcileAgent, RunSummary};
pub use audit::AgentAuditLogger;
pub use clients::SimulatedCloud;
pub use config::ClusterManifest;
pub use services::ServiceSettings;
pub use status::FileStatusStore;
