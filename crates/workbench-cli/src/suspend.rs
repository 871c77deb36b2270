//! Suspend intent toggling
//!
//! Suspension is expressed purely as client-owned spec intent. Patching the
//! same value twice is a no-op on the server, so these calls are safe to make
//! unconditionally during cleanup.

use kube::api::DynamicObject;
use serde_json::{json, Value};
use tracing::info;

use crate::client::ControlPlane;
use crate::resource::{ResourceRef, TrackedResource};
use crate::Result;

/// Merge patch setting `spec.suspend`
pub fn suspend_patch(suspend: bool) -> Value {
    json!({ "spec": { "suspend": suspend } })
}

/// Set `spec.suspend` on an object about to be created or applied.
pub fn set_suspend(obj: &mut DynamicObject, suspend: bool) {
    if !obj.data.is_object() {
        obj.data = json!({});
    }
    let spec = &mut obj.data["spec"];
    if !spec.is_object() {
        *spec = json!({});
    }
    spec["suspend"] = Value::Bool(suspend);
}

pub struct SuspendController<'a> {
    control_plane: &'a dyn ControlPlane,
}

impl<'a> SuspendController<'a> {
    pub fn new(control_plane: &'a dyn ControlPlane) -> Self {
        Self { control_plane }
    }

    /// Record the suspend intent and return the patched snapshot.
    ///
    /// Does not wait for the workload to actually stop or start.
    pub async fn set(&self, resource: &ResourceRef, suspend: bool) -> Result<TrackedResource> {
        let obj = self
            .control_plane
            .patch_spec(resource, &suspend_patch(suspend))
            .await?;
        info!(resource = %resource, suspend, "suspend intent applied");
        TrackedResource::from_object(resource.kind, &obj)
    }

    pub async fn suspend(&self, resource: &ResourceRef) -> Result<TrackedResource> {
        self.set(resource, true).await
    }

    pub async fn unsuspend(&self, resource: &ResourceRef) -> Result<TrackedResource> {
        self.set(resource, false).await
    }
}
