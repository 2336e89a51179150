//! Status subresource persisted to a JSON file.
//!
//! The file holds the in-flight operation records and the conditions of the
//! cluster. Every mutation is written through, so an agent started later (or a
//! second one after a crash) resumes the operations this one left behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use cirrus_lro::{
    LongRunningOperationState, MemoryStatus, OperationStatus, OperationStore, ReconcileError,
    StatusUpdater,
};
use serde::Serialize;
use tracing::{debug, error};

/// Write `value` as pretty JSON to `path` via a temporary file and rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename to {}", path.display()))?;
    Ok(())
}

/// Read a status file without opening a store on it.
pub fn read_status(path: impl AsRef<Path>) -> Result<OperationStatus> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(OperationStatus::default());
    }
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read status file {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("Invalid status file {}", path.display()))
}

/// [`MemoryStatus`] written through to a JSON file.
pub struct FileStatusStore {
    inner: MemoryStatus,
    path: PathBuf,
    /// Set while the file lags behind memory.
    unsaved: AtomicBool,
}

impl FileStatusStore {
    /// Open the store at `path`, loading any status already there.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let status = read_status(&path)?;
        debug!(
            path = %path.display(),
            operations = status.long_running_operation_states.len(),
            "Loaded status"
        );
        Ok(Self {
            inner: MemoryStatus::from_status(status),
            path,
            unsaved: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> OperationStatus {
        self.inner.snapshot()
    }

    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.inner.snapshot())?;
        self.unsaved.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// True if a change could not be written. A restarted agent would not see it.
    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved.load(Ordering::SeqCst)
    }

    fn persist(&self, change: &str, key: &str) {
        if let Err(e) = self.save() {
            self.unsaved.store(true, Ordering::SeqCst);
            error!(
                path = %self.path.display(),
                change,
                key,
                error = %format!("{e:#}"),
                "Failed to persist status, change is only held in memory"
            );
        }
    }
}

fn record_key(resource_name: &str, service_name: &str) -> String {
    format!("{service_name}/{resource_name}")
}

impl OperationStore for FileStatusStore {
    fn get_long_running_operation_state(
        &self,
        resource_name: &str,
        service_name: &str,
    ) -> Option<LongRunningOperationState> {
        self.inner
            .get_long_running_operation_state(resource_name, service_name)
    }

    fn set_long_running_operation_state(&self, state: LongRunningOperationState) {
        let key = record_key(&state.name, &state.service_name);
        self.inner.set_long_running_operation_state(state);
        self.persist("save operation record", &key);
    }

    fn delete_long_running_operation_state(&self, resource_name: &str, service_name: &str) {
        self.inner
            .delete_long_running_operation_state(resource_name, service_name);
        self.persist("remove operation record", &record_key(resource_name, service_name));
    }
}

impl StatusUpdater for FileStatusStore {
    fn update_put_status(&self, condition: &str, service_name: &str, err: Option<&ReconcileError>) {
        self.inner.update_put_status(condition, service_name, err);
        self.persist("update condition", condition);
    }

    fn update_delete_status(
        &self,
        condition: &str,
        service_name: &str,
        err: Option<&ReconcileError>,
    ) {
        self.inner.update_delete_status(condition, service_name, err);
        self.persist("update condition", condition);
    }
}
