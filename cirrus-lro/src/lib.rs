//! cirrus-lro: resumable reconciliation of provider resources.
//!
//! Provider-side create/update/delete operations can outlive a single
//! reconciliation attempt. The [`Reconciler`] persists just enough opaque state
//! (a [`LongRunningOperationState`]) in an injected [`OperationStore`] to resume
//! polling on a later attempt, possibly from a different process.
//!
//! # Example
//! ```ignore
//! use cirrus_lro::{Deadline, MemoryStatus, Reconciler, SpecService};
//!
//! let status = Arc::new(MemoryStatus::new());
//! let service = SpecService::new(
//!     "securitygroups",
//!     "SecurityGroupsReady",
//!     specs,
//!     Reconciler::new(Arc::clone(&status), client),
//!     Arc::clone(&status),
//! );
//! match service.create_all(&Deadline::after(timeout)).await {
//!     Err(e) if e.is_operation_not_done() => requeue(e.requeue_after()),
//!     other => other?,
//! }
//! ```

pub mod deadline;
pub mod error;
pub mod operation;
pub mod provider;
pub mod reconciler;
pub mod service;
pub mod spec;
pub mod status;

pub use deadline::{DEFAULT_RECONCILE_TIMEOUT, Deadline};
pub use error::{OperationNotDone, ProviderError, ReconcileError, Result, SpecError, TokenError};
pub use operation::{LongRunningOperationState, OperationKind, decode_token, encode_token};
pub use provider::{
    AsyncOperation, Creator, DEFAULT_POLL_INTERVAL, Deleter, FutureHandler, poll_until_done,
};
pub use reconciler::{DEFAULT_REQUEUE, Ongoing, Reconciler, process_ongoing_operation};
pub use service::{Aggregate, ServiceReconciler, SpecService};
pub use spec::ResourceSpec;
pub use status::{
    Condition, ConditionSeverity, ConditionStatus, MemoryStatus, OperationStatus, OperationStore,
    StatusUpdater,
};
