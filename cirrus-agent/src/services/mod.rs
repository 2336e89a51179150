//! Network services reconciled by the agent.
//!
//! Each service turns one section of the [`ClusterManifest`] into resource specs
//! and wires them to a [`SpecService`] over the shared status store.

pub mod security_groups;
pub mod virtual_networks;

use std::sync::Arc;
use std::time::Duration;

use cirrus_lro::{
    DEFAULT_POLL_INTERVAL, DEFAULT_RECONCILE_TIMEOUT, DEFAULT_REQUEUE, OperationStore,
    Reconciler, ResourceSpec, ServiceReconciler, SpecService, StatusUpdater,
};

use crate::clients::{PutRequest, Resource, ResourceClient, ResourceKind, SimulatedCloud};
use crate::config::ClusterManifest;

/// Tuning shared by every service.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    /// Upper bound for one pass of a service.
    pub timeout: Duration,
    /// Hint returned with not-done results.
    pub requeue_after: Duration,
    pub poll_interval: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RECONCILE_TIMEOUT,
            requeue_after: DEFAULT_REQUEUE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Build a service over `specs` backed by a [`ResourceClient`] for `P`.
pub fn build<S, P, St>(
    name: &str,
    condition: &str,
    specs: Vec<S>,
    managed: bool,
    cloud: &Arc<SimulatedCloud>,
    status: &Arc<St>,
    settings: ServiceSettings,
) -> SpecService<S, Arc<St>, ResourceClient<P>, Arc<St>>
where
    S: ResourceSpec<Resource = Resource<P>, Parameters = PutRequest<P>>,
    P: ResourceKind,
    St: OperationStore + StatusUpdater,
{
    let client = ResourceClient::new(Arc::clone(cloud)).with_poll_interval(settings.poll_interval);
    let reconciler =
        Reconciler::new(Arc::clone(status), client).with_requeue_after(settings.requeue_after);
    SpecService::new(name, condition, specs, reconciler, Arc::clone(status))
        .managed(managed)
        .timeout(settings.timeout)
}

/// All services of a manifest in creation order. Deletion runs them in reverse.
pub fn for_manifest<St>(
    manifest: &ClusterManifest,
    cloud: &Arc<SimulatedCloud>,
    status: &Arc<St>,
    settings: ServiceSettings,
) -> Vec<Box<dyn ServiceReconciler>>
where
    St: OperationStore + StatusUpdater + 'static,
{
    let security_groups: Box<dyn ServiceReconciler> =
        Box::new(security_groups::service(manifest, cloud, status, settings));
    let virtual_networks: Box<dyn ServiceReconciler> =
        Box::new(virtual_networks::service(manifest, cloud, status, settings));
    vec![security_groups, virtual_networks]
}
