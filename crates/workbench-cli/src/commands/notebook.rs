//! Notebook command - start a notebook, tunnel to it, and suspend it on exit
//!
//! The session runs in fixed stages: bring the resource up (optionally
//! uploading sources first), wait for `Ready`, then serve the tunnel until
//! interrupted. Once the ready wait has passed, the notebook is suspended on
//! the way out no matter how serving ended.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use kube::api::DynamicObject;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{apply_resource, read_manifest, resolve_kube_client, upload_source};
use crate::artifact::{ArtifactUploader, HttpUploader};
use crate::client::{ControlPlane, KubeControlPlane};
use crate::config::WorkbenchConfig;
use crate::readiness::ReadinessGate;
use crate::resource::{ResourceKind, ResourceRef};
use crate::suspend::{set_suspend, SuspendController};
use crate::tunnel::{KubePortForwarder, PortForwarder, PortPair, TunnelSession, NOTEBOOK_PORT};
use crate::upload::UploadMode;
use crate::{Error, Result};

/// Upper bound for the suspend call made while exiting
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Start a notebook and forward a local port to it
#[derive(Args, Debug)]
pub struct NotebookArgs {
    /// Notebook manifest (YAML) to create or update
    #[arg(short = 'f', long = "file", conflicts_with = "name")]
    pub file: Option<PathBuf>,

    /// Name of an existing notebook to resume
    #[arg(long)]
    pub name: Option<String>,

    /// Namespace, when the manifest does not set one
    #[arg(short = 'n', long)]
    pub namespace: Option<String>,

    /// Source directory to upload before starting (requires --file)
    #[arg(long, requires = "file")]
    pub dir: Option<PathBuf>,

    /// Local port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// How long to wait for the notebook to become ready (e.g. 10m)
    #[arg(long)]
    pub timeout: Option<String>,

    /// Leave the notebook running on exit
    #[arg(long)]
    pub no_suspend: bool,
}

/// Fully resolved notebook session parameters
#[derive(Debug)]
pub struct NotebookRequest {
    pub resource: ResourceRef,
    /// Manifest to apply. `None` resumes an existing notebook.
    pub manifest: Option<DynamicObject>,
    pub source: Option<PathBuf>,
    pub local_port: u16,
    pub ready_timeout: Option<Duration>,
    pub suspend_on_exit: bool,
}

impl NotebookArgs {
    /// Resolve flags against the config file into a request.
    pub fn into_request(self, config: &WorkbenchConfig) -> Result<NotebookRequest> {
        let namespace = config.namespace(self.namespace.as_deref());

        let (resource, manifest) = match (&self.file, &self.name) {
            (Some(file), _) => {
                let (resource, obj) = read_manifest(file, &namespace)?;
                if resource.kind != ResourceKind::Notebook {
                    return Err(Error::validation(format!(
                        "{} is a {}, expected a Notebook",
                        file.display(),
                        resource.kind
                    )));
                }
                (resource, Some(obj))
            }
            (None, Some(name)) => (
                ResourceRef::new(ResourceKind::Notebook, name.clone(), namespace),
                None,
            ),
            (None, None) => return Err(Error::validation("either --file or --name is required")),
        };

        if self.dir.is_some() && manifest.is_none() {
            return Err(Error::validation("--dir requires --file"));
        }

        Ok(NotebookRequest {
            resource,
            manifest,
            source: self.dir,
            local_port: config.notebook_port(self.port),
            ready_timeout: config.ready_timeout(self.timeout.as_deref())?,
            suspend_on_exit: !self.no_suspend,
        })
    }
}

/// Drives one notebook session against its collaborators
pub struct NotebookSession {
    control_plane: Arc<dyn ControlPlane>,
    uploader: Arc<dyn ArtifactUploader>,
    forwarder: Arc<dyn PortForwarder>,
}

impl NotebookSession {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        uploader: Arc<dyn ArtifactUploader>,
        forwarder: Arc<dyn PortForwarder>,
    ) -> Self {
        Self {
            control_plane,
            uploader,
            forwarder,
        }
    }

    /// Run the session until `cancel` fires or a stage fails.
    ///
    /// Cancellation while serving is the normal way out and returns `Ok`.
    pub async fn run(&self, request: &NotebookRequest, cancel: &CancellationToken) -> Result<()> {
        self.bring_up(request, cancel).await?;
        self.await_ready(request, cancel).await?;

        let outcome = self.serve(request, cancel).await;
        if request.suspend_on_exit {
            self.suspend_best_effort(&request.resource).await;
        }
        outcome
    }

    async fn bring_up(&self, request: &NotebookRequest, cancel: &CancellationToken) -> Result<()> {
        let control_plane = self.control_plane.as_ref();
        let Some(manifest) = &request.manifest else {
            SuspendController::new(control_plane)
                .unsuspend(&request.resource)
                .await?;
            return Ok(());
        };

        let mut obj = manifest.clone();
        set_suspend(&mut obj, false);
        match &request.source {
            Some(source) => {
                upload_source(
                    control_plane,
                    self.uploader.clone(),
                    &request.resource,
                    obj,
                    source,
                    UploadMode::UploadOnly,
                    cancel,
                )
                .await?;
            }
            None => {
                apply_resource(control_plane, &request.resource, &obj).await?;
            }
        }
        Ok(())
    }

    async fn await_ready(&self, request: &NotebookRequest, cancel: &CancellationToken) -> Result<()> {
        eprint!("Waiting for {} to become ready", request.resource);
        let waited = ReadinessGate::new(self.control_plane.as_ref())
            .deadline(request.ready_timeout)
            .wait(&request.resource, cancel, |_| eprint!("."))
            .await;
        eprintln!();
        waited.map(|_| ())
    }

    async fn serve(&self, request: &NotebookRequest, cancel: &CancellationToken) -> Result<()> {
        let ports = PortPair::new(request.local_port, NOTEBOOK_PORT);
        let mut handle = TunnelSession::start(
            self.forwarder.clone(),
            request.resource.clone(),
            ports,
            cancel.child_token(),
        );

        if let Err(e) = handle.serving().await {
            handle.cancel();
            return match e {
                Error::Cancelled => Ok(()),
                other => Err(other),
            };
        }
        println!(
            "Notebook {} is available at http://localhost:{}/",
            request.resource.name, request.local_port
        );
        println!("Press Ctrl+C to stop");

        handle.join().await
    }

    async fn suspend_best_effort(&self, resource: &ResourceRef) {
        let controller = SuspendController::new(self.control_plane.as_ref());
        match tokio::time::timeout(CLEANUP_TIMEOUT, controller.suspend(resource)).await {
            Ok(Ok(_)) => println!("Suspended {}", resource),
            Ok(Err(e)) => warn!(resource = %resource, error = %e, "failed to suspend on exit"),
            Err(_) => warn!(resource = %resource, "timed out suspending on exit"),
        }
    }
}

pub async fn run(
    args: NotebookArgs,
    kubeconfig: Option<&str>,
    config: &WorkbenchConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let request = args.into_request(config)?;

    let client = resolve_kube_client(kubeconfig).await?;
    let session = NotebookSession::new(
        Arc::new(KubeControlPlane::new(client.clone())),
        Arc::new(HttpUploader::new()?),
        Arc::new(KubePortForwarder::new(client)),
    );
    session.run(&request, &cancel).await
}
