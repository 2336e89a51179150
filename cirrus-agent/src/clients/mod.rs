//! Provider clients.
//!
//! [`ResourceClient`] adapts one resource type of the [`SimulatedCloud`] to the
//! engine's capability traits. Any spec whose resource is a [`Resource<P>`] and
//! whose parameters are a [`PutRequest<P>`] can be reconciled through it.

pub mod cloud;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cirrus_lro::{
    AsyncOperation, Creator, DEFAULT_POLL_INTERVAL, Deadline, Deleter, FutureHandler,
    OperationKind, ProviderError, ResourceSpec, poll_until_done,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use cloud::{
    CloudOperation, Method, OperationState, ProvisioningState, PutRequest, Resource,
    SimulatedCloud, resource_id,
};

/// Typed property bag of one provider resource type.
pub trait ResourceKind: Serialize + DeserializeOwned + Send + Sync + 'static {
    const RESOURCE_TYPE: &'static str;
}

/// Everything needed to resume polling a provider operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudPoller {
    pub operation_id: String,
    pub method: Method,
    pub resource_id: String,
}

/// Client for resources of kind `P`.
pub struct ResourceClient<P> {
    cloud: Arc<SimulatedCloud>,
    poll_interval: Duration,
    _kind: PhantomData<fn() -> P>,
}

impl<P: ResourceKind> ResourceClient<P> {
    pub fn new(cloud: Arc<SimulatedCloud>) -> Self {
        Self {
            cloud,
            poll_interval: DEFAULT_POLL_INTERVAL,
            _kind: PhantomData,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn fetch(&self, id: &str) -> Result<Resource<P>, ProviderError> {
        typed(self.cloud.get(id)?)
    }

    /// The operation behind `poller`, or `None` once the provider has dropped it
    /// after its retention period.
    fn operation(&self, poller: &CloudPoller) -> Result<Option<CloudOperation>, ProviderError> {
        match self.cloud.operation(&poller.operation_id) {
            Ok(op) => Ok(Some(op)),
            Err(e) if e.is_not_found() => {
                debug!(
                    operation = %poller.operation_id,
                    resource = %poller.resource_id,
                    "operation no longer tracked by the provider, treating it as finished"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn typed<P: DeserializeOwned>(
    resource: Resource<serde_json::Value>,
) -> Result<Resource<P>, ProviderError> {
    let properties =
        serde_json::from_value(resource.properties).map_err(|e| ProviderError::Rejected {
            code: "InvalidResourceBody".to_string(),
            message: format!("{}: {e}", resource.id),
        })?;
    Ok(Resource {
        id: resource.id,
        name: resource.name,
        resource_group: resource.resource_group,
        resource_type: resource.resource_type,
        location: resource.location,
        provisioning_state: resource.provisioning_state,
        etag: resource.etag,
        references: resource.references,
        properties,
    })
}

#[async_trait]
impl<P: ResourceKind> FutureHandler for ResourceClient<P> {
    type Poller = CloudPoller;
    type Output = Resource<P>;

    async fn is_done(&self, _: &Deadline, poller: &CloudPoller) -> Result<bool, ProviderError> {
        Ok(self.operation(poller)?.is_none_or(|op| op.state.is_terminal()))
    }

    async fn result(
        &self,
        _: &Deadline,
        poller: &CloudPoller,
        kind: OperationKind,
    ) -> Result<Option<Resource<P>>, ProviderError> {
        if let Some(op) = self.operation(poller)?
            && let OperationState::Failed(message) = op.state
        {
            return Err(ProviderError::OperationFailed(message));
        }
        match kind {
            OperationKind::Put => self.fetch(&poller.resource_id).map(Some),
            OperationKind::Delete => Ok(None),
        }
    }
}

#[async_trait]
impl<S, P> Creator<S> for ResourceClient<P>
where
    P: ResourceKind,
    S: ResourceSpec<Resource = Resource<P>, Parameters = PutRequest<P>>,
{
    async fn get(&self, _: &Deadline, spec: &S) -> Result<Option<Resource<P>>, ProviderError> {
        let id = resource_id(spec.resource_group_name(), P::RESOURCE_TYPE, spec.resource_name());
        match self.fetch(&id) {
            Ok(resource) => Ok(Some(resource)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_or_update_async(
        &self,
        deadline: &Deadline,
        spec: &S,
        parameters: PutRequest<P>,
    ) -> Result<AsyncOperation<Resource<P>, CloudPoller>, ProviderError> {
        let properties =
            serde_json::to_value(&parameters.properties).map_err(|e| ProviderError::Rejected {
                code: "InvalidRequestBody".to_string(),
                message: e.to_string(),
            })?;
        let request = PutRequest {
            location: parameters.location,
            references: parameters.references,
            properties,
        };

        let group = spec.resource_group_name();
        let name = spec.resource_name();
        deadline.check()?;
        let operation_id = self.cloud.begin_put(group, P::RESOURCE_TYPE, name, request)?;
        debug!(resource = name, group, operation = %operation_id, "create or update accepted");

        let poller = CloudPoller {
            operation_id,
            method: Method::Put,
            resource_id: resource_id(group, P::RESOURCE_TYPE, name),
        };
        match poll_until_done(self, deadline, poller, OperationKind::Put, self.poll_interval)
            .await?
        {
            AsyncOperation::Done(Some(resource)) => Ok(AsyncOperation::Done(resource)),
            AsyncOperation::Done(None) => Err(ProviderError::NotFound(format!("{group}/{name}"))),
            AsyncOperation::InProgress(poller) => Ok(AsyncOperation::InProgress(poller)),
        }
    }
}

#[async_trait]
impl<S, P> Deleter<S> for ResourceClient<P>
where
    P: ResourceKind,
    S: ResourceSpec<Resource = Resource<P>, Parameters = PutRequest<P>>,
{
    async fn delete_async(
        &self,
        deadline: &Deadline,
        spec: &S,
    ) -> Result<AsyncOperation<(), CloudPoller>, ProviderError> {
        let id = resource_id(spec.resource_group_name(), P::RESOURCE_TYPE, spec.resource_name());
        deadline.check()?;
        let operation_id = self.cloud.begin_delete(&id)?;
        debug!(resource = %id, operation = %operation_id, "delete accepted");

        let poller = CloudPoller {
            operation_id,
            method: Method::Delete,
            resource_id: id,
        };
        match poll_until_done(self, deadline, poller, OperationKind::Delete, self.poll_interval)
            .await?
        {
            AsyncOperation::Done(_) => Ok(AsyncOperation::Done(())),
            AsyncOperation::InProgress(poller) => Ok(AsyncOperation::InProgress(poller)),
        }
    }
}
