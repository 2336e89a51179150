//! Cluster agent: drives the services of a manifest until they are ready or gone.

use std::time::Duration;

use cirrus_lro::{DEFAULT_RECONCILE_TIMEOUT, Deadline, ReconcileError, ServiceReconciler};
use tracing::{debug, error, info};

use crate::audit::AgentAuditLogger;

/// Pause after a pass that failed with a fatal error.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound on the requeue delay between passes.
pub const DEFAULT_REQUEUE_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Reconcile,
    Delete,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Reconcile => "reconcile",
            Action::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Budget for one pass over all services.
    pub timeout: Duration,
    pub requeue_cap: Duration,
    pub failure_backoff: Duration,
    /// Stop after this many passes even if not ready.
    pub max_passes: Option<u32>,
    /// Run a single pass.
    pub once: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RECONCILE_TIMEOUT,
            requeue_cap: DEFAULT_REQUEUE_CAP,
            failure_backoff: FAILURE_BACKOFF,
            max_passes: None,
            once: false,
        }
    }
}

/// Outcome of one pass over all services.
#[derive(Debug)]
pub enum PassOutcome {
    /// Every service finished.
    Ready,
    /// Some operation is still running; try again after the delay.
    Requeue(Duration),
    Failed(ReconcileError),
}

impl PassOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PassOutcome::Ready)
    }
}

/// Result of [`ReconcileAgent::run`].
#[derive(Debug)]
pub struct RunSummary {
    pub passes: u32,
    pub last: PassOutcome,
}

pub struct ReconcileAgent {
    services: Vec<Box<dyn ServiceReconciler>>,
    audit: AgentAuditLogger,
    settings: AgentSettings,
}

impl ReconcileAgent {
    /// `services` are given in creation order.
    pub fn new(
        services: Vec<Box<dyn ServiceReconciler>>,
        audit: AgentAuditLogger,
        settings: AgentSettings,
    ) -> Self {
        Self {
            services,
            audit,
            settings,
        }
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    /// Create or update every service in order, stopping at the first one not ready.
    pub async fn reconcile_pass(&self) -> PassOutcome {
        let deadline = Deadline::after(self.settings.timeout);
        for service in &self.services {
            debug!(service = service.name(), "Reconciling service");
            if let Err(e) = service.reconcile(&deadline).await {
                return self.outcome(service.name(), e);
            }
            self.audit.service_ready(service.name());
        }
        PassOutcome::Ready
    }

    /// Delete every service in reverse order, stopping at the first one not gone.
    pub async fn delete_pass(&self) -> PassOutcome {
        let deadline = Deadline::after(self.settings.timeout);
        for service in self.services.iter().rev() {
            debug!(service = service.name(), "Deleting service");
            if let Err(e) = service.delete(&deadline).await {
                return self.outcome(service.name(), e);
            }
            self.audit.service_deleted(service.name());
        }
        PassOutcome::Ready
    }

    fn outcome(&self, service: &str, err: ReconcileError) -> PassOutcome {
        match err.requeue_after() {
            Some(after) => {
                self.audit.service_pending(service, after);
                PassOutcome::Requeue(after)
            }
            None => {
                self.audit.service_failed(service, &err.to_string());
                PassOutcome::Failed(err)
            }
        }
    }

    /// Run passes of `action` until ready or a stop condition from the settings hits.
    pub async fn run(&self, action: Action) -> RunSummary {
        self.audit.started(action.as_str(), &self.service_names());

        let mut passes = 0;
        loop {
            passes += 1;
            let outcome = match action {
                Action::Reconcile => self.reconcile_pass().await,
                Action::Delete => self.delete_pass().await,
            };

            let delay = match &outcome {
                PassOutcome::Ready => None,
                PassOutcome::Requeue(after) => {
                    let delay = (*after).min(self.settings.requeue_cap);
                    info!(pass = passes, "Not done yet, next pass in {:?}", delay);
                    Some(delay)
                }
                PassOutcome::Failed(e) => {
                    error!(
                        pass = passes,
                        "{} failed: {}. Retrying in {:?}...",
                        action.as_str(),
                        e,
                        self.settings.failure_backoff
                    );
                    Some(self.settings.failure_backoff)
                }
            };
            let Some(delay) = delay else {
                info!(passes, "{} complete", action.as_str());
                self.audit.finished(action.as_str(), passes);
                return RunSummary {
                    passes,
                    last: outcome,
                };
            };

            let exhausted = self.settings.max_passes.is_some_and(|max| passes >= max);
            if self.settings.once || exhausted {
                return RunSummary {
                    passes,
                    last: outcome,
                };
            }
            tokio::time::sleep(delay).await;
        }
    }
}
