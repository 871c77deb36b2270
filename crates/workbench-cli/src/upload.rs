//! Upload-on-signal coordination
//!
//! The control plane provisions an upload destination asynchronously after the
//! resource is created with an artifact checksum. [`UploadCoordinator`] watches
//! the resource's status for that destination and transfers the prepared
//! artifact exactly once, no matter how many times the watch replays the same
//! snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artifact::{ArtifactDescriptor, ArtifactUploader};
use crate::client::ControlPlane;
use crate::resource::{ResourceRef, TrackedResource};
use crate::watch::{dispatch, EventHandler, Flow, ResourceWatcher};
use crate::{Error, Result};

/// Upload state machine. `Done` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    AwaitingTarget,
    Done,
}

/// When the watch loop ends after a successful upload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadMode {
    /// Stop as soon as the artifact is uploaded
    UploadOnly,
    /// Keep watching until the remote build reports `status.ready`
    AwaitBuild,
}

pub struct UploadCoordinator {
    artifact: ArtifactDescriptor,
    uploader: Arc<dyn ArtifactUploader>,
    mode: UploadMode,
    state: UploadState,
}

impl UploadCoordinator {
    pub fn new(
        artifact: ArtifactDescriptor,
        uploader: Arc<dyn ArtifactUploader>,
        mode: UploadMode,
    ) -> Self {
        Self {
            artifact,
            uploader,
            mode,
            state: UploadState::AwaitingTarget,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Watch `resource` and react to its status until the upload flow completes.
    ///
    /// A watch the server closes cleanly is re-opened; the fresh subscription
    /// replays current state, and a completed upload is never repeated.
    pub async fn run(
        &mut self,
        control_plane: &dyn ControlPlane,
        resource: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let watcher = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                watcher = ResourceWatcher::open(control_plane, resource) => watcher?,
            };
            match dispatch(watcher, self, cancel).await {
                Err(Error::WatchClosed { .. }) => {
                    debug!(
                        resource = %resource,
                        state = ?self.state,
                        "watch closed by server, reopening"
                    );
                }
                other => return other,
            }
        }
    }

    fn after_done(&self, resource: &TrackedResource) -> Flow {
        match self.mode {
            UploadMode::UploadOnly => Flow::Stop,
            UploadMode::AwaitBuild if resource.status.build_complete() => {
                info!(resource = %resource.reference, "remote build complete");
                Flow::Stop
            }
            UploadMode::AwaitBuild => Flow::Continue,
        }
    }
}

#[async_trait]
impl EventHandler for UploadCoordinator {
    async fn on_applied(&mut self, resource: &TrackedResource) -> Result<Flow> {
        if self.state == UploadState::Done {
            return Ok(self.after_done(resource));
        }

        let Some(url) = resource.status.upload_url.as_deref() else {
            debug!(resource = %resource.reference, "upload target not provisioned yet");
            return Ok(Flow::Continue);
        };

        info!(
            resource = %resource.reference,
            bytes = self.artifact.size,
            md5 = %self.artifact.md5_hex,
            "uploading artifact"
        );
        self.uploader.upload(url, &self.artifact).await?;
        self.state = UploadState::Done;
        info!(resource = %resource.reference, "artifact uploaded");

        Ok(self.after_done(resource))
    }
}
