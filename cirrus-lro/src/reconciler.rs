//! Per-resource create/delete state machine.
//!
//! Every call first looks for an operation left in flight by an earlier attempt
//! (possibly from another process) and polls it. Only when nothing is outstanding
//! does it issue a new request. Requests the provider accepted but did not finish
//! before the deadline are persisted as a [`LongRunningOperationState`] and
//! reported as [`OperationNotDone`].

use std::time::Duration;

use tracing::{debug, info};

use crate::deadline::Deadline;
use crate::error::{OperationNotDone, ReconcileError, Result};
use crate::operation::{LongRunningOperationState, OperationKind, decode_token, encode_token};
use crate::provider::{AsyncOperation, Creator, Deleter, FutureHandler};
use crate::spec::ResourceSpec;
use crate::status::OperationStore;

/// Requeue hint carried by [`OperationNotDone`].
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(15);

/// Result of checking for an operation left by a previous attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Ongoing<T> {
    /// Nothing outstanding for this key; a new request may be issued.
    Absent,
    /// The outstanding operation finished; its record has been removed.
    Completed(Option<T>),
}

/// Poll the operation stored for `(resource_name, service_name)`, if any.
///
/// A record of the other kind is left alone and reported as [`Ongoing::Absent`].
/// A record whose token cannot be decoded is dropped. While the operation is
/// pending the record stays and [`ReconcileError::OperationNotDone`] is returned.
pub async fn process_ongoing_operation<St, H>(
    store: &St,
    handler: &H,
    deadline: &Deadline,
    resource_name: &str,
    service_name: &str,
    kind: OperationKind,
    requeue_after: Duration,
) -> Result<Ongoing<H::Output>>
where
    St: OperationStore + ?Sized,
    H: FutureHandler + ?Sized,
{
    let Some(state) = store.get_long_running_operation_state(resource_name, service_name) else {
        debug!(resource = resource_name, service = service_name, "no long running operation found");
        return Ok(Ongoing::Absent);
    };

    if state.kind != kind {
        debug!(
            resource = resource_name,
            service = service_name,
            stored = %state.kind,
            expected = %kind,
            "ignoring long running operation of another kind"
        );
        return Ok(Ongoing::Absent);
    }

    let poller: H::Poller = match decode_token(&state.data) {
        Ok(poller) => poller,
        Err(e) => {
            debug!(
                resource = resource_name,
                service = service_name,
                error = %e,
                "could not decode operation data, resetting long running operation state"
            );
            store.delete_long_running_operation_state(resource_name, service_name);
            return Ok(Ongoing::Absent);
        }
    };

    let done = handler
        .is_done(deadline, &poller)
        .await
        .map_err(|source| ReconcileError::CheckCompletion {
            kind,
            resource_group: state.resource_group.clone(),
            resource_name: resource_name.to_string(),
            service: service_name.to_string(),
            source,
        })?;

    if !done {
        debug!(
            resource = resource_name,
            service = service_name,
            %kind,
            "long running operation still in progress"
        );
        return Err(OperationNotDone {
            kind,
            resource_group: state.resource_group,
            resource_name: resource_name.to_string(),
            requeue_after,
        }
        .into());
    }

    // Drop the record before fetching: a failed fetch must not leave us polling a
    // finished operation forever.
    store.delete_long_running_operation_state(resource_name, service_name);

    let result = handler
        .result(deadline, &poller, kind)
        .await
        .map_err(|source| ReconcileError::FetchResult {
            kind,
            resource_group: state.resource_group.clone(),
            resource_name: resource_name.to_string(),
            service: service_name.to_string(),
            source,
        })?;

    info!(
        resource = resource_name,
        group = %state.resource_group,
        service = service_name,
        %kind,
        "long running operation completed"
    );
    Ok(Ongoing::Completed(result))
}

/// Drives create/update/delete of resources through an injected store and client.
///
/// `create_resource` needs `C: Creator`, `delete_resource` needs `C: Deleter`; a
/// client only implements what its service uses.
pub struct Reconciler<St, C> {
    store: St,
    client: C,
    requeue_after: Duration,
}

impl<St, C> Reconciler<St, C>
where
    St: OperationStore,
    C: FutureHandler,
{
    pub fn new(store: St, client: C) -> Self {
        Self {
            store,
            client,
            requeue_after: DEFAULT_REQUEUE,
        }
    }

    pub fn with_requeue_after(mut self, requeue_after: Duration) -> Self {
        self.requeue_after = requeue_after;
        self
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn persist<S: ResourceSpec>(
        &self,
        spec: &S,
        service_name: &str,
        kind: OperationKind,
        poller: &C::Poller,
    ) -> Result<ReconcileError> {
        let data = encode_token(poller).map_err(|source| ReconcileError::EncodeToken {
            kind,
            resource_group: spec.resource_group_name().to_string(),
            resource_name: spec.resource_name().to_string(),
            service: service_name.to_string(),
            source,
        })?;

        self.store
            .set_long_running_operation_state(LongRunningOperationState::new(
                kind,
                service_name,
                spec.resource_name(),
                spec.resource_group_name(),
                data,
            ));

        info!(
            resource = spec.resource_name(),
            group = spec.resource_group_name(),
            service = service_name,
            %kind,
            "operation accepted but not finished, saved long running operation state"
        );

        Ok(OperationNotDone {
            kind,
            resource_group: spec.resource_group_name().to_string(),
            resource_name: spec.resource_name().to_string(),
            requeue_after: self.requeue_after,
        }
        .into())
    }

    /// Drop a `stale` record left for this key once the resource is known to be
    /// settled. Otherwise a later call of that kind would resume a finished
    /// operation and report success without issuing a request.
    fn clear_stale(&self, resource_name: &str, service_name: &str, stale: OperationKind) {
        let found = self
            .store
            .get_long_running_operation_state(resource_name, service_name)
            .is_some_and(|state| state.kind == stale);
        if !found {
            return;
        }
        debug!(
            resource = resource_name,
            service = service_name,
            %stale,
            "dropping stale long running operation state"
        );
        self.store.delete_long_running_operation_state(resource_name, service_name);
    }

    /// Create or update the resource described by `spec`.
    ///
    /// Returns the provider resource, or `None` when it does not exist and no
    /// request was needed.
    pub async fn create_resource<S>(
        &self,
        deadline: &Deadline,
        spec: &S,
        service_name: &str,
    ) -> Result<Option<S::Resource>>
    where
        S: ResourceSpec,
        C: Creator<S>,
    {
        let resource_name = spec.resource_name();
        let resource_group = spec.resource_group_name();

        if let Ongoing::Completed(result) = process_ongoing_operation(
            &self.store,
            &self.client,
            deadline,
            resource_name,
            service_name,
            OperationKind::Put,
            self.requeue_after,
        )
        .await?
        {
            return Ok(result);
        }

        let existing = match self.client.get(deadline, spec).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => None,
            Err(source) => {
                return Err(ReconcileError::GetExisting {
                    resource_group: resource_group.to_string(),
                    resource_name: resource_name.to_string(),
                    service: service_name.to_string(),
                    source,
                });
            }
        };

        let parameters = spec
            .parameters(existing.as_ref())
            .map_err(|source| ReconcileError::Parameters {
                resource_group: resource_group.to_string(),
                resource_name: resource_name.to_string(),
                service: service_name.to_string(),
                source,
            })?;

        let Some(parameters) = parameters else {
            debug!(
                resource = resource_name,
                group = resource_group,
                service = service_name,
                "resource is up to date, no request needed"
            );
            self.clear_stale(resource_name, service_name, OperationKind::Delete);
            return Ok(existing);
        };

        debug!(
            resource = resource_name,
            group = resource_group,
            service = service_name,
            "creating or updating resource"
        );
        match self
            .client
            .create_or_update_async(deadline, spec, parameters)
            .await
        {
            Ok(AsyncOperation::Done(result)) => {
                info!(
                    resource = resource_name,
                    group = resource_group,
                    service = service_name,
                    "successfully created or updated resource"
                );
                self.clear_stale(resource_name, service_name, OperationKind::Delete);
                Ok(Some(result))
            }
            Ok(AsyncOperation::InProgress(poller)) => {
                Err(self.persist(spec, service_name, OperationKind::Put, &poller)?)
            }
            Err(source) => Err(ReconcileError::Create {
                resource_group: resource_group.to_string(),
                resource_name: resource_name.to_string(),
                service: service_name.to_string(),
                source,
            }),
        }
    }

    /// Delete the resource described by `spec`. Already-absent resources succeed.
    pub async fn delete_resource<S>(
        &self,
        deadline: &Deadline,
        spec: &S,
        service_name: &str,
    ) -> Result<()>
    where
        S: ResourceSpec,
        C: Deleter<S>,
    {
        let resource_name = spec.resource_name();
        let resource_group = spec.resource_group_name();

        if let Ongoing::Completed(_) = process_ongoing_operation(
            &self.store,
            &self.client,
            deadline,
            resource_name,
            service_name,
            OperationKind::Delete,
            self.requeue_after,
        )
        .await?
        {
            return Ok(());
        }

        debug!(
            resource = resource_name,
            group = resource_group,
            service = service_name,
            "deleting resource"
        );
        match self.client.delete_async(deadline, spec).await {
            Ok(AsyncOperation::Done(())) => {
                info!(
                    resource = resource_name,
                    group = resource_group,
                    service = service_name,
                    "successfully deleted resource"
                );
                self.clear_stale(resource_name, service_name, OperationKind::Put);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(
                    resource = resource_name,
                    group = resource_group,
                    service = service_name,
                    "resource already deleted"
                );
                self.clear_stale(resource_name, service_name, OperationKind::Put);
                Ok(())
            }
            Ok(AsyncOperation::InProgress(poller)) => {
                Err(self.persist(spec, service_name, OperationKind::Delete, &poller)?)
            }
            Err(source) => Err(ReconcileError::Delete {
                resource_group: resource_group.to_string(),
                resource_name: resource_name.to_string(),
                service: service_name.to_string(),
                source,
            }),
        }
    }
}
