//! Upload command - package a source tree and hand it to the control plane

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;

use super::{read_manifest, resolve_kube_client, upload_source};
use crate::artifact::HttpUploader;
use crate::client::KubeControlPlane;
use crate::config::WorkbenchConfig;
use crate::upload::UploadMode;
use crate::Result;

/// Upload local sources for a resource
#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Resource manifest (YAML)
    #[arg(short = 'f', long = "file")]
    pub file: PathBuf,

    /// Source directory to package
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Namespace, when the manifest does not set one
    #[arg(short = 'n', long)]
    pub namespace: Option<String>,

    /// Keep watching until the remote build reports ready
    #[arg(long)]
    pub wait_build: bool,
}

impl UploadArgs {
    fn mode(&self) -> UploadMode {
        if self.wait_build {
            UploadMode::AwaitBuild
        } else {
            UploadMode::UploadOnly
        }
    }
}

pub async fn run(
    args: UploadArgs,
    kubeconfig: Option<&str>,
    config: &WorkbenchConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let namespace = config.namespace(args.namespace.as_deref());
    let (resource, obj) = read_manifest(&args.file, &namespace)?;

    let client = resolve_kube_client(kubeconfig).await?;
    let control_plane = KubeControlPlane::new(client);
    let uploader = Arc::new(HttpUploader::new()?);

    let artifact = upload_source(
        &control_plane,
        uploader,
        &resource,
        obj,
        &args.dir,
        args.mode(),
        &cancel,
    )
    .await?;

    println!(
        "Uploaded {} ({} bytes, md5 {})",
        resource, artifact.size, artifact.md5_hex
    );
    if args.wait_build {
        println!("Build complete");
    }
    Ok(())
}
