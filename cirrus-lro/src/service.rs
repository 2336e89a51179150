//! Service-level orchestration over a list of resource specs.
//!
//! A service reconciles every spec it owns independently of the others and
//! reports one aggregated outcome per pass:
//! fatal error > operation not done > success.

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::deadline::{DEFAULT_RECONCILE_TIMEOUT, Deadline};
use crate::error::{ReconcileError, Result};
use crate::provider::{Creator, Deleter, FutureHandler};
use crate::reconciler::Reconciler;
use crate::spec::ResourceSpec;
use crate::status::{OperationStore, StatusUpdater};

/// A unit of reconciliation owned by a cluster or machine controller.
#[async_trait]
pub trait ServiceReconciler: Send + Sync {
    fn name(&self) -> &str;

    /// Create or update everything the service owns.
    async fn reconcile(&self, deadline: &Deadline) -> Result<()>;

    /// Delete everything the service owns.
    async fn delete(&self, deadline: &Deadline) -> Result<()>;
}

/// Keeps the most pressing error seen so far.
///
/// The first fatal error wins over later ones; a not-done outcome only replaces
/// success.
#[derive(Debug, Default)]
pub struct Aggregate {
    err: Option<ReconcileError>,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: Result<()>) {
        let Err(err) = result else {
            return;
        };
        let replace = match &self.err {
            None => true,
            Some(current) => current.is_operation_not_done() && !err.is_operation_not_done(),
        };
        if replace {
            self.err = Some(err);
        }
    }

    pub fn error(&self) -> Option<&ReconcileError> {
        self.err.as_ref()
    }

    pub fn into_result(self) -> Result<()> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Reconciles a list of specs of one resource type through a [`Reconciler`].
pub struct SpecService<S, St, C, U> {
    name: String,
    condition: String,
    specs: Vec<S>,
    reconciler: Reconciler<St, C>,
    status: U,
    managed: bool,
    concurrent: bool,
    timeout: std::time::Duration,
}

impl<S, St, C, U> SpecService<S, St, C, U>
where
    S: ResourceSpec,
    St: OperationStore,
    C: FutureHandler,
    U: StatusUpdater,
{
    pub fn new(
        name: impl Into<String>,
        condition: impl Into<String>,
        specs: Vec<S>,
        reconciler: Reconciler<St, C>,
        status: U,
    ) -> Self {
        Self {
            name: name.into(),
            condition: condition.into(),
            specs,
            reconciler,
            status,
            managed: true,
            concurrent: false,
            timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }

    /// Unmanaged services skip both reconcile and delete without reporting status.
    pub fn managed(mut self, managed: bool) -> Self {
        self.managed = managed;
        self
    }

    /// Run the per-spec calls concurrently instead of one after another.
    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Upper bound for one pass, applied on top of the caller's deadline.
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn specs(&self) -> &[S] {
        &self.specs
    }

    pub fn reconciler(&self) -> &Reconciler<St, C> {
        &self.reconciler
    }

    fn skip(&self, action: &str) -> bool {
        if !self.managed {
            debug!(service = %self.name, "skipping {} of unmanaged resources", action);
            return true;
        }
        if self.specs.is_empty() {
            debug!(service = %self.name, "no specs to {}", action);
            return true;
        }
        false
    }

    fn log_outcome(&self, action: &str, aggregate: &Aggregate) {
        match aggregate.error() {
            None => info!(service = %self.name, specs = self.specs.len(), "{} complete", action),
            Some(e) if e.is_operation_not_done() => {
                info!(service = %self.name, "{} in progress: {}", action, e)
            }
            Some(e) => warn!(service = %self.name, error = %e, "{} failed", action),
        }
    }
}

impl<S, St, C, U> SpecService<S, St, C, U>
where
    S: ResourceSpec,
    St: OperationStore,
    C: Creator<S>,
    U: StatusUpdater,
{
    /// Create or update all specs, then report the put condition.
    pub async fn create_all(&self, deadline: &Deadline) -> Result<()> {
        if self.skip("reconcile") {
            return Ok(());
        }
        let deadline = deadline.shorten(self.timeout);

        let mut aggregate = Aggregate::new();
        if self.concurrent {
            let results = join_all(
                self.specs
                    .iter()
                    .map(|spec| self.reconciler.create_resource(&deadline, spec, &self.name)),
            )
            .await;
            for result in results {
                aggregate.record(result.map(|_| ()));
            }
        } else {
            for spec in &self.specs {
                let result = self
                    .reconciler
                    .create_resource(&deadline, spec, &self.name)
                    .await;
                aggregate.record(result.map(|_| ()));
            }
        }

        self.log_outcome("reconcile", &aggregate);
        self.status
            .update_put_status(&self.condition, &self.name, aggregate.error());
        aggregate.into_result()
    }
}

impl<S, St, C, U> SpecService<S, St, C, U>
where
    S: ResourceSpec,
    St: OperationStore,
    C: Deleter<S>,
    U: StatusUpdater,
{
    /// Delete all specs, then report the delete condition.
    pub async fn delete_all(&self, deadline: &Deadline) -> Result<()> {
        if self.skip("delete") {
            return Ok(());
        }
        let deadline = deadline.shorten(self.timeout);

        let mut aggregate = Aggregate::new();
        if self.concurrent {
            let results = join_all(
                self.specs
                    .iter()
                    .map(|spec| self.reconciler.delete_resource(&deadline, spec, &self.name)),
            )
            .await;
            for result in results {
                aggregate.record(result);
            }
        } else {
            for spec in &self.specs {
                aggregate.record(
                    self.reconciler
                        .delete_resource(&deadline, spec, &self.name)
                        .await,
                );
            }
        }

        self.log_outcome("delete", &aggregate);
        self.status
            .update_delete_status(&self.condition, &self.name, aggregate.error());
        aggregate.into_result()
    }
}

#[async_trait]
impl<S, St, C, U> ServiceReconciler for SpecService<S, St, C, U>
where
    S: ResourceSpec + 'static,
    St: OperationStore + 'static,
    C: Creator<S> + Deleter<S> + 'static,
    U: StatusUpdater + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn reconcile(&self, deadline: &Deadline) -> Result<()> {
        self.create_all(deadline).await
    }

    async fn delete(&self, deadline: &Deadline) -> Result<()> {
        self.delete_all(deadline).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::error::{OperationNotDone, ProviderError, SpecError};
    use crate::operation::OperationKind;
    use crate::provider::AsyncOperation;
    use crate::reconciler::testing::*;
    use crate::status::{ConditionStatus, FAILED_REASON, MemoryStatus};

    /// Records every status report.
    #[derive(Default)]
    struct RecordingStatus {
        puts: Mutex<Vec<(String, String, Option<String>)>>,
        deletes: Mutex<Vec<(String, String, Option<String>)>>,
    }

    impl StatusUpdater for RecordingStatus {
        fn update_put_status(&self, condition: &str, service: &str, err: Option<&ReconcileError>) {
            self.puts.lock().unwrap().push((
                condition.to_string(),
                service.to_string(),
                err.map(|e| e.to_string()),
            ));
        }

        fn update_delete_status(
            &self,
            condition: &str,
            service: &str,
            err: Option<&ReconcileError>,
        ) {
            self.deletes.lock().unwrap().push((
                condition.to_string(),
                service.to_string(),
                err.map(|e| e.to_string()),
            ));
        }
    }

    fn not_done(name: &str) -> ReconcileError {
        OperationNotDone {
            kind: OperationKind::Put,
            resource_group: "rg".to_string(),
            resource_name: name.to_string(),
            requeue_after: Duration::from_secs(15),
        }
        .into()
    }

    fn fatal(name: &str) -> ReconcileError {
        ReconcileError::Create {
            resource_group: "rg".to_string(),
            resource_name: name.to_string(),
            service: "svc".to_string(),
            source: ProviderError::Unavailable("down".to_string()),
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(30))
    }

    #[test]
    fn test_aggregate_precedence() {
        let mut agg = Aggregate::new();
        agg.record(Ok(()));
        assert!(agg.error().is_none());

        agg.record(Err(not_done("a")));
        assert!(agg.error().unwrap().is_operation_not_done());

        agg.record(Err(fatal("b")));
        agg.record(Err(not_done("c")));
        agg.record(Err(fatal("d")));
        agg.record(Ok(()));

        let err = agg.into_result().unwrap_err();
        assert!(!err.is_operation_not_done());
        // first fatal error wins
        assert!(err.to_string().contains("rg/b"));
    }

    #[test]
    fn test_aggregate_keeps_first_not_done() {
        let mut agg = Aggregate::new();
        agg.record(Err(not_done("a")));
        agg.record(Err(not_done("b")));
        assert_eq!(
            agg.error().unwrap().as_operation_not_done().unwrap().resource_name,
            "a"
        );
    }

    #[tokio::test]
    async fn test_create_all_keeps_going_after_failure() {
        // spec "one": create fails, spec "two": accepted and pending, spec "three": done
        let client = FakeClient::new()
            .on_get(Ok(None))
            .on_create(Err(internal_error()))
            .on_get(Ok(None))
            .on_create(Ok(AsyncOperation::InProgress(FakePoller::put())))
            .on_get(Ok(None))
            .on_create(Ok(AsyncOperation::Done("three".to_string())));
        let specs = vec![
            FakeSpec::named("one", Ok(Some("p1".to_string()))),
            FakeSpec::named("two", Ok(Some("p2".to_string()))),
            FakeSpec::named("three", Ok(Some("p3".to_string()))),
        ];
        let status = Arc::new(RecordingStatus::default());
        let service = SpecService::new(
            "test-service",
            "TestReady",
            specs,
            Reconciler::new(MemoryStatus::new(), client),
            Arc::clone(&status),
        );

        let err = service.create_all(&deadline()).await.unwrap_err();
        assert!(err.to_string().contains("failed to create resource test-group/one"));
        let client = service.reconciler().client();
        assert_eq!(client.calls(&client.create_calls), 3);

        let puts = status.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "TestReady");
        assert_eq!(puts[0].1, "test-service");
        assert!(puts[0].2.as_ref().unwrap().contains("failed to create resource"));

        // the pending one is persisted even though the pass failed
        assert!(service
            .reconciler()
            .store()
            .get_long_running_operation_state("two", "test-service")
            .is_some());
    }

    #[tokio::test]
    async fn test_create_all_reports_not_done() {
        let client = FakeClient::new()
            .on_get(Ok(None))
            .on_create(Ok(AsyncOperation::Done("one".to_string())))
            .on_get(Ok(None))
            .on_create(Ok(AsyncOperation::InProgress(FakePoller::put())));
        let specs = vec![
            FakeSpec::named("one", Ok(Some("p1".to_string()))),
            FakeSpec::named("two", Ok(Some("p2".to_string()))),
        ];
        let status = Arc::new(MemoryStatus::new());
        let service = SpecService::new(
            "test-service",
            "TestReady",
            specs,
            Reconciler::new(Arc::clone(&status), client),
            Arc::clone(&status),
        );

        let err = service.create_all(&deadline()).await.unwrap_err();
        assert!(err.is_operation_not_done());

        let snapshot = status.snapshot();
        let condition = snapshot.get_condition("TestReady").unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason.as_deref(), Some("Creating"));
        assert_eq!(snapshot.long_running_operation_states.len(), 1);
    }

    #[tokio::test]
    async fn test_create_all_success_marks_ready() {
        let client = FakeClient::new().on_get(Ok(Some("one".to_string())));
        let status = Arc::new(MemoryStatus::new());
        let service = SpecService::new(
            "test-service",
            "TestReady",
            vec![FakeSpec::named("one", Ok(None))],
            Reconciler::new(Arc::clone(&status), client),
            Arc::clone(&status),
        );

        service.create_all(&deadline()).await.unwrap();
        assert!(status.snapshot().get_condition("TestReady").unwrap().is_true());
    }

    #[tokio::test]
    async fn test_create_all_concurrent() {
        let client = FakeClient::new()
            .on_get(Ok(None))
            .on_create(Ok(AsyncOperation::Done("x".to_string())))
            .on_get(Ok(None))
            .on_create(Ok(AsyncOperation::Done("x".to_string())));
        let status = Arc::new(MemoryStatus::new());
        let service = SpecService::new(
            "test-service",
            "TestReady",
            vec![
                FakeSpec::named("one", Ok(Some("p".to_string()))),
                FakeSpec::named("two", Ok(Some("p".to_string()))),
            ],
            Reconciler::new(Arc::clone(&status), client),
            Arc::clone(&status),
        )
        .concurrent(true);

        service.create_all(&deadline()).await.unwrap();
        let client = service.reconciler().client();
        assert_eq!(client.calls(&client.create_calls), 2);
    }

    #[tokio::test]
    async fn test_delete_all_precedence_and_status() {
        let client = FakeClient::new()
            .on_delete(Ok(AsyncOperation::InProgress(FakePoller::delete())))
            .on_delete(Err(internal_error()))
            .on_delete(Err(not_found()));
        let status = Arc::new(MemoryStatus::new());
        let service = SpecService::new(
            "test-service",
            "TestReady",
            vec![
                FakeSpec::named("one", Ok(None)),
                FakeSpec::named("two", Ok(None)),
                FakeSpec::named("three", Ok(None)),
            ],
            Reconciler::new(Arc::clone(&status), client),
            Arc::clone(&status),
        );

        let err = service.delete_all(&deadline()).await.unwrap_err();
        assert!(err.to_string().contains("failed to delete resource test-group/two"));
        let snapshot = status.snapshot();
        let condition = snapshot.get_condition("TestReady").unwrap();
        assert_eq!(condition.reason.as_deref(), Some("DeletionFailed"));
        assert_eq!(snapshot.long_running_operation_states.len(), 1);
    }

    #[tokio::test]
    async fn test_unmanaged_service_is_skipped() {
        let status = Arc::new(RecordingStatus::default());
        let service = SpecService::new(
            "test-service",
            "TestReady",
            vec![FakeSpec::named("one", Ok(Some("p".to_string())))],
            Reconciler::new(MemoryStatus::new(), FakeClient::new()),
            Arc::clone(&status),
        )
        .managed(false);

        service.create_all(&deadline()).await.unwrap();
        service.delete_all(&deadline()).await.unwrap();
        assert!(status.puts.lock().unwrap().is_empty());
        assert!(status.deletes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spec_error_reports_failed_condition() {
        let client = FakeClient::new().on_get(Ok(None));
        let status = Arc::new(MemoryStatus::new());
        let service = SpecService::new(
            "test-service",
            "TestReady",
            vec![FakeSpec::named("one", Err(SpecError::new("bad rule")))],
            Reconciler::new(Arc::clone(&status), client),
            Arc::clone(&status),
        );

        let svc: &dyn ServiceReconciler = &service;
        assert_eq!(svc.name(), "test-service");
        let err = svc.reconcile(&deadline()).await.unwrap_err();
        assert!(err.to_string().contains("bad rule"));
        let snapshot = status.snapshot();
        assert_eq!(
            snapshot.get_condition("TestReady").unwrap().reason.as_deref(),
            Some(FAILED_REASON)
        );
    }
}
