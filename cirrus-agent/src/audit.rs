//! Audit events for cluster lifecycle changes.
//!
//! Events are emitted on the `audit` tracing target so they can be filtered or
//! routed separately from diagnostic logs.

use std::time::Duration;

use tracing::{info, warn};

/// Audit logger for agent events.
pub struct AgentAuditLogger {
    cluster: String,
}

impl AgentAuditLogger {
    pub fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
        }
    }

    pub fn started(&self, action: &str, services: &[&str]) {
        info!(target: "audit", cluster = %self.cluster, ?services, "Started {}", action);
    }

    pub fn service_ready(&self, service: &str) {
        info!(target: "audit", cluster = %self.cluster, service, "Service reconciled");
    }

    pub fn service_deleted(&self, service: &str) {
        info!(target: "audit", cluster = %self.cluster, service, "Service resources deleted");
    }

    pub fn service_pending(&self, service: &str, requeue_after: Duration) {
        info!(
            target: "audit",
            cluster = %self.cluster,
            service,
            requeue_after_secs = requeue_after.as_secs_f64(),
            "Operations still in progress"
        );
    }

    pub fn service_failed(&self, service: &str, error: &str) {
        warn!(target: "audit", cluster = %self.cluster, service, error, "Service failed");
    }

    pub fn finished(&self, action: &str, passes: u32) {
        info!(target: "audit", cluster = %self.cluster, passes, "Finished {}", action);
    }
}
