//! Capability traits implemented by provider adapters.
//!
//! An adapter implements [`FutureHandler`] plus whichever of [`Creator`] and
//! [`Deleter`] it needs. A cleanup-only adapter implements `Deleter` alone.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::deadline::Deadline;
use crate::error::ProviderError;
use crate::operation::OperationKind;
use crate::spec::ResourceSpec;

/// Default interval between completion checks in [`poll_until_done`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of an asynchronous provider request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncOperation<T, P> {
    /// The operation completed within the deadline.
    Done(T),
    /// The provider accepted the request but the deadline expired first.
    InProgress(P),
}

/// Polls provider-side operations.
#[async_trait]
pub trait FutureHandler: Send + Sync {
    /// Serializable state needed to resume polling, persisted between attempts.
    type Poller: Serialize + DeserializeOwned + Send + Sync;
    /// Provider representation returned when an operation finishes.
    type Output: Send;

    /// Whether the operation has finished. `Ok(false)` while still pending.
    async fn is_done(&self, deadline: &Deadline, poller: &Self::Poller)
    -> Result<bool, ProviderError>;

    /// Final result of a finished operation. Only valid after `is_done` returned true.
    async fn result(
        &self,
        deadline: &Deadline,
        poller: &Self::Poller,
        kind: OperationKind,
    ) -> Result<Option<Self::Output>, ProviderError>;
}

/// Reads and creates-or-updates resources of one type.
#[async_trait]
pub trait Creator<S: ResourceSpec>: FutureHandler<Output = S::Resource> {
    /// Current provider state, `Ok(None)` if the resource does not exist.
    async fn get(&self, deadline: &Deadline, spec: &S)
    -> Result<Option<S::Resource>, ProviderError>;

    async fn create_or_update_async(
        &self,
        deadline: &Deadline,
        spec: &S,
        parameters: S::Parameters,
    ) -> Result<AsyncOperation<S::Resource, Self::Poller>, ProviderError>;
}

/// Deletes resources of one type.
#[async_trait]
pub trait Deleter<S: ResourceSpec>: FutureHandler {
    /// `Err(ProviderError::NotFound)` is treated as already deleted.
    async fn delete_async(
        &self,
        deadline: &Deadline,
        spec: &S,
    ) -> Result<AsyncOperation<(), Self::Poller>, ProviderError>;
}

/// Poll `poller` until the operation finishes or the deadline expires.
///
/// Issuers call this after the provider accepted a request. On expiry the poller
/// is handed back so the engine can persist it.
pub async fn poll_until_done<H: FutureHandler + ?Sized>(
    handler: &H,
    deadline: &Deadline,
    poller: H::Poller,
    kind: OperationKind,
    interval: Duration,
) -> Result<AsyncOperation<Option<H::Output>, H::Poller>, ProviderError> {
    loop {
        match handler.is_done(deadline, &poller).await {
            Ok(true) => {
                let output = handler.result(deadline, &poller, kind).await?;
                return Ok(AsyncOperation::Done(output));
            }
            Ok(false) => {}
            Err(ProviderError::DeadlineExceeded) => return Ok(AsyncOperation::InProgress(poller)),
            Err(e) => return Err(e),
        }

        if deadline.remaining() <= interval {
            debug!(%kind, "deadline reached while polling, handing back poller");
            return Ok(AsyncOperation::InProgress(poller));
        }
        tokio::time::sleep(interval).await;
    }
}
