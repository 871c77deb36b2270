//! Control-plane access for workbench resources
//!
//! [`ControlPlane`] is the narrow contract the orchestration core consumes:
//! create, get, merge-patch the spec, and watch a single named object. The
//! production implementation talks to the Kubernetes API through kube-rs using
//! dynamic objects, so no generated CRD types are required.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams, WatchEvent, WatchParams};
use kube::Client;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::resource::ResourceRef;
use crate::{Error, Result};

/// Field manager recorded on spec patches
pub const FIELD_MANAGER: &str = "workbench-cli";

/// Resource version that makes the API server replay current state as `Added`
const WATCH_FROM_CURRENT: &str = "0";

/// One raw record from a watch subscription.
///
/// Anything the API server sends that is not one of the four lifecycle kinds
/// is kept as `Unrecognized` so the caller can fail loudly on it.
#[derive(Clone, Debug)]
pub enum WatchRecord {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
    Error(String),
    Unrecognized(String),
}

/// Stream of watch records for a single object
pub type WatchStream = BoxStream<'static, Result<WatchRecord>>;

/// Trait abstracting control-plane operations on tracked resources
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create the object, failing with `AlreadyExists` on conflict
    async fn create(&self, resource: &ResourceRef, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Fetch the current snapshot, failing with `NotFound` if it is absent
    async fn get(&self, resource: &ResourceRef) -> Result<DynamicObject>;

    /// Apply a JSON merge patch and return the updated snapshot
    async fn patch_spec(&self, resource: &ResourceRef, patch: &Value) -> Result<DynamicObject>;

    /// Open a watch filtered to exactly this object
    async fn watch(&self, resource: &ResourceRef) -> Result<WatchStream>;
}

/// Real control plane backed by a kube client
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, resource: &ResourceRef) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            &resource.namespace,
            &resource.kind.api_resource(),
        )
    }
}

/// Map API status codes onto the taxonomy callers branch on.
fn map_kube_error(resource: &ResourceRef, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound {
            resource: resource.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 => Error::AlreadyExists {
            resource: resource.to_string(),
        },
        _ => Error::Kube(err),
    }
}

/// Watch filtered to one object. Bookmarks are never requested, so any that
/// arrive are reported as unrecognized.
fn watch_params(resource: &ResourceRef) -> WatchParams {
    WatchParams::default()
        .fields(&resource.field_selector())
        .disable_bookmarks()
}

fn into_record(event: WatchEvent<DynamicObject>) -> WatchRecord {
    match event {
        WatchEvent::Added(obj) => WatchRecord::Added(obj),
        WatchEvent::Modified(obj) => WatchRecord::Modified(obj),
        WatchEvent::Deleted(obj) => WatchRecord::Deleted(obj),
        WatchEvent::Error(e) => WatchRecord::Error(format!("{} ({})", e.message, e.code)),
        WatchEvent::Bookmark(_) => WatchRecord::Unrecognized("BOOKMARK".to_string()),
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn create(&self, resource: &ResourceRef, obj: &DynamicObject) -> Result<DynamicObject> {
        debug!(resource = %resource, "creating resource");
        self.api(resource)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error(resource, e))
    }

    async fn get(&self, resource: &ResourceRef) -> Result<DynamicObject> {
        self.api(resource)
            .get(&resource.name)
            .await
            .map_err(|e| map_kube_error(resource, e))
    }

    async fn patch_spec(&self, resource: &ResourceRef, patch: &Value) -> Result<DynamicObject> {
        debug!(resource = %resource, patch = %patch, "patching resource spec");
        self.api(resource)
            .patch(
                &resource.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| map_kube_error(resource, e))
    }

    async fn watch(&self, resource: &ResourceRef) -> Result<WatchStream> {
        let params = watch_params(resource);
        let stream = self
            .api(resource)
            .watch(&params, WATCH_FROM_CURRENT)
            .await
            .map_err(|e| map_kube_error(resource, e))?;

        debug!(resource = %resource, "watch opened");
        Ok(stream.map_ok(into_record).map_err(Error::Kube).boxed())
    }
}
