//! Resource specs describe one manageable provider resource.

use crate::error::SpecError;

/// Identity and desired state of a single provider resource.
pub trait ResourceSpec: Send + Sync {
    /// Provider representation of the resource.
    type Resource: Send + Sync;
    /// Request body for a create-or-update call.
    type Parameters: Send;

    fn resource_name(&self) -> &str;

    fn resource_group_name(&self) -> &str;

    /// Name of the parent resource, if the resource is nested (e.g. a subnet).
    fn owner_resource_name(&self) -> &str {
        ""
    }

    /// Compute the create-or-update request from the observed resource.
    ///
    /// Returns `Ok(None)` when `existing` already matches the desired state; the
    /// reconciler then issues no request.
    fn parameters(
        &self,
        existing: Option<&Self::Resource>,
    ) -> Result<Option<Self::Parameters>, SpecError>;
}
