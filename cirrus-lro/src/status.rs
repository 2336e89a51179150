//! Operation state store and status conditions.
//!
//! Both live on the owning object's status. The engine only talks to the
//! [`OperationStore`] and [`StatusUpdater`] traits; [`MemoryStatus`] is the
//! in-process implementation used by tests and wrapped by persistent stores.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::operation::LongRunningOperationState;

/// Keyed persistence of in-flight operation records.
///
/// At most one record exists per (resource name, service name). Implementations
/// must be safe for concurrent access on distinct keys.
pub trait OperationStore: Send + Sync {
    fn get_long_running_operation_state(
        &self,
        resource_name: &str,
        service_name: &str,
    ) -> Option<LongRunningOperationState>;

    /// Insert or replace the record for the record's key.
    fn set_long_running_operation_state(&self, state: LongRunningOperationState);

    fn delete_long_running_operation_state(&self, resource_name: &str, service_name: &str);
}

/// Receives the aggregated outcome of a service pass.
pub trait StatusUpdater: Send + Sync {
    fn update_put_status(&self, condition: &str, service_name: &str, err: Option<&ReconcileError>);

    fn update_delete_status(
        &self,
        condition: &str,
        service_name: &str,
        err: Option<&ReconcileError>,
    );
}

impl<T: OperationStore + ?Sized> OperationStore for Arc<T> {
    fn get_long_running_operation_state(
        &self,
        resource_name: &str,
        service_name: &str,
    ) -> Option<LongRunningOperationState> {
        (**self).get_long_running_operation_state(resource_name, service_name)
    }

    fn set_long_running_operation_state(&self, state: LongRunningOperationState) {
        (**self).set_long_running_operation_state(state)
    }

    fn delete_long_running_operation_state(&self, resource_name: &str, service_name: &str) {
        (**self).delete_long_running_operation_state(resource_name, service_name)
    }
}

impl<T: StatusUpdater + ?Sized> StatusUpdater for Arc<T> {
    fn update_put_status(&self, condition: &str, service_name: &str, err: Option<&ReconcileError>) {
        (**self).update_put_status(condition, service_name, err)
    }

    fn update_delete_status(
        &self,
        condition: &str,
        service_name: &str,
        err: Option<&ReconcileError>,
    ) {
        (**self).update_delete_status(condition, service_name, err)
    }
}

// =============================================================================
// Conditions
// =============================================================================

pub const CREATING_REASON: &str = "Creating";
pub const DELETING_REASON: &str = "Deleting";
pub const DELETED_REASON: &str = "Deleted";
pub const FAILED_REASON: &str = "Failed";
pub const DELETION_FAILED_REASON: &str = "DeletionFailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
}

/// Observed state of one aspect of the owning object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Status subresource fields the engine reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    #[serde(default)]
    pub long_running_operation_states: Vec<LongRunningOperationState>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl OperationStatus {
    pub fn get_operation(
        &self,
        resource_name: &str,
        service_name: &str,
    ) -> Option<&LongRunningOperationState> {
        self.long_running_operation_states
            .iter()
            .find(|s| s.matches(resource_name, service_name))
    }

    pub fn set_operation(&mut self, state: LongRunningOperationState) {
        match self
            .long_running_operation_states
            .iter_mut()
            .find(|s| s.matches(&state.name, &state.service_name))
        {
            Some(existing) => *existing = state,
            None => self.long_running_operation_states.push(state),
        }
    }

    pub fn delete_operation(&mut self, resource_name: &str, service_name: &str) {
        self.long_running_operation_states
            .retain(|s| !s.matches(resource_name, service_name));
    }

    pub fn get_condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Set a condition. The transition time only moves when the status changes.
    pub fn set_condition(
        &mut self,
        condition_type: &str,
        status: ConditionStatus,
        severity: Option<ConditionSeverity>,
        reason: Option<&str>,
        message: Option<String>,
    ) {
        let now = Utc::now();
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.severity = severity;
                existing.reason = reason.map(str::to_string);
                existing.message = message;
            }
            None => self.conditions.push(Condition {
                condition_type: condition_type.to_string(),
                status,
                severity,
                reason: reason.map(str::to_string),
                message,
                last_transition_time: now,
            }),
        }
    }

    pub fn mark_true(&mut self, condition_type: &str) {
        self.set_condition(condition_type, ConditionStatus::True, None, None, None);
    }

    pub fn mark_false(
        &mut self,
        condition_type: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: String,
    ) {
        self.set_condition(
            condition_type,
            ConditionStatus::False,
            Some(severity),
            Some(reason),
            Some(message),
        );
    }

    pub fn update_put_status(
        &mut self,
        condition: &str,
        service_name: &str,
        err: Option<&ReconcileError>,
    ) {
        match err {
            None => self.mark_true(condition),
            Some(e) if e.is_operation_not_done() => self.mark_false(
                condition,
                CREATING_REASON,
                ConditionSeverity::Info,
                format!("{service_name} creating or updating"),
            ),
            Some(e) => self.mark_false(
                condition,
                FAILED_REASON,
                ConditionSeverity::Error,
                format!("{service_name} failed to create or update. err: {e}"),
            ),
        }
    }

    pub fn update_delete_status(
        &mut self,
        condition: &str,
        service_name: &str,
        err: Option<&ReconcileError>,
    ) {
        match err {
            None => self.mark_false(
                condition,
                DELETED_REASON,
                ConditionSeverity::Info,
                format!("{service_name} successfully deleted"),
            ),
            Some(e) if e.is_operation_not_done() => self.mark_false(
                condition,
                DELETING_REASON,
                ConditionSeverity::Info,
                format!("{service_name} deleting"),
            ),
            Some(e) => self.mark_false(
                condition,
                DELETION_FAILED_REASON,
                ConditionSeverity::Error,
                format!("{service_name} failed to delete. err: {e}"),
            ),
        }
    }
}

/// Thread-safe in-memory status, implementing both store traits.
#[derive(Debug, Default)]
pub struct MemoryStatus {
    inner: Mutex<OperationStatus>,
}

impl MemoryStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_status(status: OperationStatus) -> Self {
        Self {
            inner: Mutex::new(status),
        }
    }

    /// Copy of the current status.
    pub fn snapshot(&self) -> OperationStatus {
        self.lock().clone()
    }

    /// Apply `f` to the status under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut OperationStatus) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, OperationStatus> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OperationStore for MemoryStatus {
    fn get_long_running_operation_state(
        &self,
        resource_name: &str,
        service_name: &str,
    ) -> Option<LongRunningOperationState> {
        self.lock().get_operation(resource_name, service_name).cloned()
    }

    fn set_long_running_operation_state(&self, state: LongRunningOperationState) {
        self.lock().set_operation(state);
    }

    fn delete_long_running_operation_state(&self, resource_name: &str, service_name: &str) {
        self.lock().delete_operation(resource_name, service_name);
    }
}

impl StatusUpdater for MemoryStatus {
    fn update_put_status(&self, condition: &str, service_name: &str, err: Option<&ReconcileError>) {
        self.lock().update_put_status(condition, service_name, err);
    }

    fn update_delete_status(
        &self,
        condition: &str,
        service_name: &str,
        err: Option<&ReconcileError>,
    ) {
        self.lock()
            .update_delete_status(condition, service_name, err);
    }
}
