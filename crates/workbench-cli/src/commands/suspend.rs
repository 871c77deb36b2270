//! Suspend and resume commands

use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;

use super::resolve_kube_client;
use crate::client::{ControlPlane, KubeControlPlane};
use crate::config::WorkbenchConfig;
use crate::readiness::ReadinessGate;
use crate::resource::{ResourceKind, ResourceRef};
use crate::suspend::SuspendController;
use crate::Result;

/// Resource addressed by kind and name
#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Resource kind (notebook, model, dataset, server)
    pub kind: ResourceKind,

    /// Resource name
    pub name: String,

    /// Namespace
    #[arg(short = 'n', long)]
    pub namespace: Option<String>,
}

impl TargetArgs {
    fn resource(&self, config: &WorkbenchConfig) -> ResourceRef {
        ResourceRef::new(
            self.kind,
            self.name.clone(),
            config.namespace(self.namespace.as_deref()),
        )
    }
}

/// Suspend a resource's workload
#[derive(Args, Debug)]
pub struct SuspendArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

/// Resume a suspended resource
#[derive(Args, Debug)]
pub struct ResumeArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Wait for the resource to report ready
    #[arg(long)]
    pub wait: bool,

    /// How long to wait with --wait (e.g. 10m)
    #[arg(long, requires = "wait")]
    pub timeout: Option<String>,
}

pub async fn run_suspend(
    args: SuspendArgs,
    kubeconfig: Option<&str>,
    config: &WorkbenchConfig,
) -> Result<()> {
    let resource = args.target.resource(config);
    let control_plane = KubeControlPlane::new(resolve_kube_client(kubeconfig).await?);

    SuspendController::new(&control_plane)
        .suspend(&resource)
        .await?;
    println!("Suspended {}", resource);
    Ok(())
}

pub async fn run_resume(
    args: ResumeArgs,
    kubeconfig: Option<&str>,
    config: &WorkbenchConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let resource = args.target.resource(config);
    let deadline = if args.wait {
        Some(config.ready_timeout(args.timeout.as_deref())?)
    } else {
        None
    };
    let control_plane = KubeControlPlane::new(resolve_kube_client(kubeconfig).await?);

    resume(&control_plane, &resource, deadline, &cancel).await?;
    println!("Resumed {}", resource);
    Ok(())
}

/// Unsuspend `resource`, then wait for readiness when `wait` is set.
///
/// `wait` carries the readiness deadline; `Some(None)` waits indefinitely.
async fn resume(
    control_plane: &dyn ControlPlane,
    resource: &ResourceRef,
    wait: Option<Option<Duration>>,
    cancel: &CancellationToken,
) -> Result<()> {
    SuspendController::new(control_plane)
        .unsuspend(resource)
        .await?;

    let Some(deadline) = wait else {
        return Ok(());
    };
    eprint!("Waiting for {} to become ready", resource);
    let waited = ReadinessGate::new(control_plane)
        .deadline(deadline)
        .wait(resource, cancel, |_| eprint!("."))
        .await;
    eprintln!();
    waited.map(|_| ())
}
