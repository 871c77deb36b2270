//! Watch-driven event dispatch for a single tracked resource
//!
//! [`ResourceWatcher`] turns a raw watch subscription into typed lifecycle
//! events, decoding each snapshot exactly once. [`dispatch`] feeds those
//! events, in delivery order, to an [`EventHandler`] and maps every terminal
//! condition (deletion, watch error, unknown event kind, stream closure,
//! cancellation) onto a fatal error.

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ControlPlane, WatchRecord, WatchStream};
use crate::resource::{ResourceRef, TrackedResource};
use crate::{Error, Result};

/// Typed lifecycle event for the watched resource
#[derive(Clone, Debug)]
pub enum ResourceEvent {
    Added(TrackedResource),
    Modified(TrackedResource),
    Deleted(TrackedResource),
    Error(String),
    Unrecognized(String),
}

/// Whether the handler wants more events
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Reacts to `Added`/`Modified` snapshots of the watched resource
#[async_trait]
pub trait EventHandler: Send {
    async fn on_applied(&mut self, resource: &TrackedResource) -> Result<Flow>;
}

/// A single, non-restartable subscription to one named resource
pub struct ResourceWatcher {
    resource: ResourceRef,
    stream: WatchStream,
    terminated: bool,
}

impl ResourceWatcher {
    /// Open a subscription filtered to exactly `resource`.
    pub async fn open(control_plane: &dyn ControlPlane, resource: &ResourceRef) -> Result<Self> {
        let stream = control_plane.watch(resource).await?;
        Ok(Self::from_stream(resource.clone(), stream))
    }

    pub fn from_stream(resource: ResourceRef, stream: WatchStream) -> Self {
        Self {
            resource,
            stream,
            terminated: false,
        }
    }

    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    /// Next typed event, or `None` once the subscription has ended.
    ///
    /// A transport failure is reported once as an `Error` event, after which
    /// the watcher is terminated.
    pub async fn next(&mut self) -> Option<ResourceEvent> {
        if self.terminated {
            return None;
        }

        let record = match self.stream.next().await {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                self.terminated = true;
                return Some(ResourceEvent::Error(e.to_string()));
            }
            None => {
                self.terminated = true;
                return None;
            }
        };

        let kind = self.resource.kind;
        let event = match record {
            WatchRecord::Added(obj) => {
                TrackedResource::from_object(kind, &obj).map(ResourceEvent::Added)
            }
            WatchRecord::Modified(obj) => {
                TrackedResource::from_object(kind, &obj).map(ResourceEvent::Modified)
            }
            WatchRecord::Deleted(obj) => {
                TrackedResource::from_object(kind, &obj).map(ResourceEvent::Deleted)
            }
            WatchRecord::Error(message) => Ok(ResourceEvent::Error(message)),
            WatchRecord::Unrecognized(kind) => Ok(ResourceEvent::Unrecognized(kind)),
        };

        Some(event.unwrap_or_else(|e| {
            self.terminated = true;
            ResourceEvent::Error(format!("malformed snapshot: {}", e))
        }))
    }
}

/// Drive `handler` with events from `watcher` until it asks to stop.
///
/// Returns `Ok(())` only when the handler returns [`Flow::Stop`].
pub async fn dispatch<H>(
    mut watcher: ResourceWatcher,
    handler: &mut H,
    cancel: &CancellationToken,
) -> Result<()>
where
    H: EventHandler + ?Sized,
{
    let resource = watcher.resource().to_string();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(resource = %resource, "watch cancelled");
                return Err(Error::Cancelled);
            }
            event = watcher.next() => event,
        };

        match event {
            Some(ResourceEvent::Added(snapshot)) | Some(ResourceEvent::Modified(snapshot)) => {
                let flow = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(resource = %resource, "handler cancelled");
                        return Err(Error::Cancelled);
                    }
                    flow = handler.on_applied(&snapshot) => flow?,
                };
                if flow == Flow::Stop {
                    return Ok(());
                }
            }
            Some(ResourceEvent::Deleted(_)) => {
                warn!(resource = %resource, "resource deleted during watch");
                return Err(Error::ResourceDeleted { resource });
            }
            Some(ResourceEvent::Error(message)) => {
                return Err(Error::Watch { resource, message });
            }
            Some(ResourceEvent::Unrecognized(kind)) => {
                return Err(Error::UnrecognizedEvent { resource, kind });
            }
            None => return Err(Error::WatchClosed { resource }),
        }
    }
}
