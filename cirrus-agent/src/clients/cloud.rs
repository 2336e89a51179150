//! Simulated infrastructure provider.
//!
//! Every PUT and DELETE is accepted immediately and completes once its latency
//! has elapsed in wall-clock time. Resources and operations are kept in a JSON
//! file when a state path is given, so operations started by one process can be
//! polled to completion by the next. Finished operations are dropped once they
//! have been kept for the retention period.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cirrus_lro::ProviderError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::status::write_json_atomic;

/// How long a finished operation stays queryable.
pub const OPERATION_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Provisioning state of a stored resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningState {
    Creating,
    Updating,
    Deleting,
    Succeeded,
    Failed,
}

impl ProvisioningState {
    /// Settled in the requested state. Anything else is failed or still changing.
    pub fn is_succeeded(&self) -> bool {
        *self == ProvisioningState::Succeeded
    }
}

/// HTTP-style method of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Put,
    Delete,
}

/// Status of a provider operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message")]
pub enum OperationState {
    InProgress,
    Succeeded,
    Failed(String),
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationState::InProgress)
    }
}

/// A resource as stored by the provider. `P` is the typed property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource<P> {
    pub id: String,
    pub name: String,
    pub resource_group: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub location: String,
    pub provisioning_state: ProvisioningState,
    pub etag: String,
    /// Ids of other resources this one depends on.
    #[serde(default)]
    pub references: Vec<String>,
    pub properties: P,
}

/// Body of a PUT request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutRequest<P> {
    pub location: String,
    #[serde(default)]
    pub references: Vec<String>,
    pub properties: P,
}

/// A provider operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudOperation {
    pub id: String,
    pub method: Method,
    pub resource_id: String,
    pub started_at: DateTime<Utc>,
    pub completes_at: DateTime<Utc>,
    pub state: OperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Resource as it will look once a PUT completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Resource<serde_json::Value>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CloudState {
    #[serde(default)]
    resources: BTreeMap<String, Resource<serde_json::Value>>,
    #[serde(default)]
    operations: BTreeMap<String, CloudOperation>,
    /// Resource ids whose next operation fails, with the failure message.
    #[serde(default)]
    failures: BTreeMap<String, String>,
}

/// Resource id for a resource of `resource_type` named `name` in `group`.
pub fn resource_id(group: &str, resource_type: &str, name: &str) -> String {
    format!("/resourceGroups/{group}/providers/{resource_type}/{name}")
}

/// In-process provider with long-running operations.
pub struct SimulatedCloud {
    state: Mutex<CloudState>,
    state_path: Option<PathBuf>,
    latency: Duration,
    retention: Duration,
}

impl SimulatedCloud {
    /// Provider without persistence.
    pub fn in_memory(latency: Duration) -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            state_path: None,
            latency,
            retention: OPERATION_RETENTION,
        }
    }

    /// Provider persisted to `path`, loading existing state if the file exists.
    pub fn open(path: impl AsRef<Path>, latency: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = std::fs::read(&path)
                .with_context(|| format!("Failed to read cloud state {}", path.display()))?;
            serde_json::from_slice(&raw)
                .with_context(|| format!("Invalid cloud state {}", path.display()))?
        } else {
            CloudState::default()
        };

        Ok(Self {
            state: Mutex::new(state),
            state_path: Some(path),
            latency,
            retention: OPERATION_RETENTION,
        })
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save(&self, state: &CloudState) {
        let Some(path) = &self.state_path else {
            return;
        };
        if let Err(e) = write_json_atomic(path, state) {
            warn!(path = %path.display(), error = %e, "Failed to persist cloud state");
        }
    }

    /// Make the next operation on `resource_id` fail with `message`.
    pub fn inject_failure(&self, resource_id: &str, message: &str) {
        let mut state = self.lock();
        state
            .failures
            .insert(resource_id.to_string(), message.to_string());
        self.save(&state);
    }

    /// Current resource. Resources still being created are visible.
    pub fn get(&self, resource_id: &str) -> Result<Resource<serde_json::Value>, ProviderError> {
        let mut state = self.lock();
        if advance(&mut state, self.retention) {
            self.save(&state);
        }
        state
            .resources
            .get(resource_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(resource_id.to_string()))
    }

    /// List resources, optionally filtered by type.
    pub fn list(&self, resource_type: Option<&str>) -> Vec<Resource<serde_json::Value>> {
        let mut state = self.lock();
        if advance(&mut state, self.retention) {
            self.save(&state);
        }
        state
            .resources
            .values()
            .filter(|r| resource_type.is_none_or(|t| r.resource_type == t))
            .cloned()
            .collect()
    }

    /// Start a create-or-update. Returns the operation id.
    pub fn begin_put(
        &self,
        group: &str,
        resource_type: &str,
        name: &str,
        request: PutRequest<serde_json::Value>,
    ) -> Result<String, ProviderError> {
        let id = resource_id(group, resource_type, name);
        let mut state = self.lock();
        advance(&mut state, self.retention);

        ensure_idle(&state, &id)?;
        for reference in &request.references {
            match state.resources.get(reference) {
                Some(r) if r.provisioning_state != ProvisioningState::Deleting => {}
                _ => {
                    return Err(ProviderError::Rejected {
                        code: "InvalidResourceReference".to_string(),
                        message: format!("{id} references missing resource {reference}"),
                    });
                }
            }
        }

        let target = Resource {
            id: id.clone(),
            name: name.to_string(),
            resource_group: group.to_string(),
            resource_type: resource_type.to_string(),
            location: request.location,
            provisioning_state: ProvisioningState::Succeeded,
            etag: Uuid::new_v4().to_string(),
            references: request.references,
            properties: request.properties,
        };

        match state.resources.get_mut(&id) {
            Some(existing) => existing.provisioning_state = ProvisioningState::Updating,
            None => {
                let mut placeholder = target.clone();
                placeholder.provisioning_state = ProvisioningState::Creating;
                state.resources.insert(id.clone(), placeholder);
            }
        }

        let op = self.new_operation(Method::Put, &id, Some(target));
        let op_id = op.id.clone();
        debug!(resource = %id, operation = %op_id, "Accepted PUT");
        state.operations.insert(op_id.clone(), op);
        self.save(&state);
        Ok(op_id)
    }

    /// Start a delete. Returns the operation id.
    pub fn begin_delete(&self, resource_id: &str) -> Result<String, ProviderError> {
        let mut state = self.lock();
        advance(&mut state, self.retention);

        if !state.resources.contains_key(resource_id) {
            return Err(ProviderError::NotFound(resource_id.to_string()));
        }
        ensure_idle(&state, resource_id)?;
        if let Some(user) = state
            .resources
            .values()
            .find(|r| r.references.iter().any(|reference| reference == resource_id))
        {
            return Err(ProviderError::Conflict(format!(
                "{resource_id} is in use by {}",
                user.id
            )));
        }

        if let Some(resource) = state.resources.get_mut(resource_id) {
            resource.provisioning_state = ProvisioningState::Deleting;
        }
        let op = self.new_operation(Method::Delete, resource_id, None);
        let op_id = op.id.clone();
        debug!(resource = %resource_id, operation = %op_id, "Accepted DELETE");
        state.operations.insert(op_id.clone(), op);
        self.save(&state);
        Ok(op_id)
    }

    /// Current state of an operation, completing it if its time has come.
    /// Operations finished longer ago than the retention period are not found.
    pub fn operation(&self, operation_id: &str) -> Result<CloudOperation, ProviderError> {
        let mut state = self.lock();
        if advance(&mut state, self.retention) {
            self.save(&state);
        }
        state
            .operations
            .get(operation_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("operation {operation_id}")))
    }

    fn new_operation(
        &self,
        method: Method,
        resource_id: &str,
        target: Option<Resource<serde_json::Value>>,
    ) -> CloudOperation {
        let now = Utc::now();
        let latency = chrono::Duration::from_std(self.latency)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        CloudOperation {
            id: Uuid::new_v4().to_string(),
            method,
            resource_id: resource_id.to_string(),
            started_at: now,
            completes_at: now + latency,
            state: OperationState::InProgress,
            finished_at: None,
            target,
        }
    }
}

fn ensure_idle(state: &CloudState, resource_id: &str) -> Result<(), ProviderError> {
    if state
        .operations
        .values()
        .any(|op| op.resource_id == resource_id && !op.state.is_terminal())
    {
        return Err(ProviderError::Conflict(format!(
            "another operation is in progress on {resource_id}"
        )));
    }
    Ok(())
}

/// Complete every operation whose time has passed and drop finished operations
/// older than `retention`. Returns true if anything changed.
fn advance(state: &mut CloudState, retention: Duration) -> bool {
    let now = Utc::now();
    let due: Vec<String> = state
        .operations
        .values()
        .filter(|op| !op.state.is_terminal() && op.completes_at <= now)
        .map(|op| op.id.clone())
        .collect();

    for op_id in &due {
        let Some(op) = state.operations.get(op_id).cloned() else {
            continue;
        };

        let outcome = match state.failures.remove(&op.resource_id) {
            Some(message) => {
                if let Some(resource) = state.resources.get_mut(&op.resource_id) {
                    resource.provisioning_state = ProvisioningState::Failed;
                }
                OperationState::Failed(message)
            }
            None => {
                match (op.method, op.target) {
                    (Method::Put, Some(target)) => {
                        state.resources.insert(op.resource_id.clone(), target);
                    }
                    (Method::Put, None) => {}
                    (Method::Delete, _) => {
                        state.resources.remove(&op.resource_id);
                    }
                }
                OperationState::Succeeded
            }
        };

        debug!(operation = %op_id, resource = %op.resource_id, ?outcome, "Operation finished");
        if let Some(stored) = state.operations.get_mut(op_id) {
            stored.state = outcome;
            stored.finished_at = Some(now);
        }
    }

    let retention =
        chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::weeks(52));
    let before = state.operations.len();
    state.operations.retain(|_, op| {
        // operations persisted without a finish time count from their due time
        let finished_at = op.finished_at.unwrap_or(op.completes_at);
        !op.state.is_terminal() || finished_at + retention > now
    });
    let pruned = before - state.operations.len();
    if pruned > 0 {
        debug!(pruned, "Dropped finished operations");
    }

    !due.is_empty() || pruned > 0
}
