//! CLI commands

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artifact::{package_directory, ArtifactDescriptor, ArtifactUploader};
use crate::client::ControlPlane;
use crate::resource::{set_upload_checksum, ResourceRef};
use crate::upload::{UploadCoordinator, UploadMode};
use crate::{Error, Result};

pub mod notebook;
pub mod suspend;
pub mod upload;

/// Archive name inside the per-invocation scratch directory
const ARCHIVE_NAME: &str = "source.tar.gz";

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

/// Parse a human-friendly duration string into seconds.
///
/// Supports `Nh` (hours), `Nm` (minutes), and `Ns` (seconds).
/// Examples: "1h" → 3600, "30m" → 1800, "3600s" → 3600.
pub fn parse_duration(s: &str) -> Result<u64> {
    let s = s.trim();
    let invalid = || Error::validation(format!("invalid duration: {}", s));
    if let Some(hours) = s.strip_suffix('h') {
        let n: u64 = hours.parse().map_err(|_| invalid())?;
        n.checked_mul(3600).ok_or_else(invalid)
    } else if let Some(minutes) = s.strip_suffix('m') {
        let n: u64 = minutes.parse().map_err(|_| invalid())?;
        n.checked_mul(60).ok_or_else(invalid)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse().map_err(|_| invalid())
    } else {
        // Try parsing as raw seconds
        s.parse().map_err(|_| {
            Error::validation(format!(
                "invalid duration '{}', expected e.g. 1h, 30m, 3600s",
                s
            ))
        })
    }
}

/// Build a kube [`Client`] using the workbench kubeconfig resolution chain.
pub async fn resolve_kube_client(explicit_kubeconfig: Option<&str>) -> Result<Client> {
    match crate::config::resolve_kubeconfig(explicit_kubeconfig) {
        Some(path) => kube_client_from_path(&path).await,
        None => Client::try_default().await.cmd_err(),
    }
}

/// Build a kube [`Client`] from a kubeconfig file path (default context).
pub async fn kube_client_from_path(path: &str) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| Error::command_failed(format!("failed to read kubeconfig {}: {}", path, e)))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .cmd_err()?;
    Client::try_from(config).cmd_err()
}

/// Read and parse a manifest file.
pub fn read_manifest(path: &Path, default_namespace: &str) -> Result<(ResourceRef, DynamicObject)> {
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| Error::validation(format!("failed to read {}: {}", path.display(), e)))?;
    crate::resource::parse_manifest(&yaml, default_namespace)
}

/// Create `obj`, or merge its spec over the existing resource of the same name.
pub async fn apply_resource(
    control_plane: &dyn ControlPlane,
    resource: &ResourceRef,
    obj: &DynamicObject,
) -> Result<DynamicObject> {
    match control_plane.create(resource, obj).await {
        Ok(created) => {
            info!(resource = %resource, "created");
            Ok(created)
        }
        Err(Error::AlreadyExists { .. }) => {
            debug!(resource = %resource, "already exists, patching spec");
            let spec = obj.data.get("spec").cloned().unwrap_or_else(|| json!({}));
            let patched = control_plane
                .patch_spec(resource, &json!({ "spec": spec }))
                .await?;
            info!(resource = %resource, "updated");
            Ok(patched)
        }
        Err(e) => Err(e),
    }
}

/// Package `source`, record its digest on `obj`, apply it, and upload the
/// archive once the control plane provisions a target.
pub async fn upload_source(
    control_plane: &dyn ControlPlane,
    uploader: Arc<dyn ArtifactUploader>,
    resource: &ResourceRef,
    mut obj: DynamicObject,
    source: &Path,
    mode: UploadMode,
    cancel: &CancellationToken,
) -> Result<ArtifactDescriptor> {
    let scratch = tempfile::Builder::new().prefix("workbench-").tempdir()?;
    let archive = package_source(source.to_path_buf(), scratch.path().join(ARCHIVE_NAME)).await?;

    set_upload_checksum(&mut obj, &archive.md5_hex);
    apply_resource(control_plane, resource, &obj).await?;

    let mut coordinator = UploadCoordinator::new(archive.clone(), uploader, mode);
    coordinator.run(control_plane, resource, cancel).await?;
    Ok(archive)
}

async fn package_source(source: PathBuf, dest: PathBuf) -> Result<ArtifactDescriptor> {
    tokio::task::spawn_blocking(move || package_directory(&source, &dest))
        .await
        .cmd_err()?
}

#[cfg(test)]
pub(crate) mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::artifact::MockArtifactUploader;
    use crate::client::{MockControlPlane, WatchRecord};
    use crate::resource::parse_manifest;
    use crate::watch::tests::snapshot;

    pub(crate) const MANIFEST: &str = r#"
apiVersion: workbench.dev/v1
kind: Notebook
metadata:
  name: falcon
  namespace: ml
spec:
  suspend: false
"#;

    pub(crate) fn watch_records(
        records: Vec<WatchRecord>,
    ) -> crate::client::WatchStream {
        futures::stream::iter(records.into_iter().map(Ok)).boxed()
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("30m").unwrap(), 1800);
        assert_eq!(parse_duration("45s").unwrap(), 45);
        assert_eq!(parse_duration(" 90 ").unwrap(), 90);
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-5m").is_err());
    }

    #[test]
    fn parse_duration_rejects_overflow() {
        assert!(parse_duration("9999999999999999h").is_err());
        assert!(parse_duration("999999999999999999m").is_err());
        assert_eq!(parse_duration("5124095576030431h").unwrap(), 5124095576030431 * 3600);
    }

    #[tokio::test]
    async fn apply_creates_when_absent() {
        let (resource, obj) = parse_manifest(MANIFEST, "default").unwrap();
        let mut mock = MockControlPlane::new();
        mock.expect_create()
            .times(1)
            .returning(|_, obj| Ok(obj.clone()));
        mock.expect_patch_spec().never();

        apply_resource(&mock, &resource, &obj).await.unwrap();
    }

    #[tokio::test]
    async fn apply_patches_spec_when_present() {
        let (resource, obj) = parse_manifest(MANIFEST, "default").unwrap();
        let mut mock = MockControlPlane::new();
        mock.expect_create().returning(|r, _| {
            Err(Error::AlreadyExists {
                resource: r.to_string(),
            })
        });
        mock.expect_patch_spec()
            .withf(|_, patch| *patch == json!({"spec": {"suspend": false}}))
            .times(1)
            .returning(|_, _| Ok(snapshot(json!({}))));

        apply_resource(&mock, &resource, &obj).await.unwrap();
    }

    #[tokio::test]
    async fn upload_source_records_digest_and_uploads() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("train.py"), "print('hi')").unwrap();
        let (resource, obj) = parse_manifest(MANIFEST, "default").unwrap();

        let mut mock = MockControlPlane::new();
        mock.expect_create()
            .withf(|_, obj| {
                obj.data
                    .pointer("/spec/image/upload/md5checksum")
                    .and_then(|v| v.as_str())
                    .is_some_and(|md5| md5.len() == 32)
            })
            .times(1)
            .returning(|_, obj| Ok(obj.clone()));
        mock.expect_watch().times(1).returning(|_| {
            Ok(watch_records(vec![
                WatchRecord::Added(snapshot(json!({}))),
                WatchRecord::Modified(snapshot(json!({"uploadURL": "https://store/x"}))),
            ]))
        });

        let mut uploader = MockArtifactUploader::new();
        uploader
            .expect_upload()
            .withf(|url, artifact| url == "https://store/x" && artifact.path.exists())
            .times(1)
            .returning(|_, _| Ok(()));

        let artifact = upload_source(
            &mock,
            Arc::new(uploader),
            &resource,
            obj,
            src.path(),
            UploadMode::UploadOnly,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!artifact.path.exists(), "scratch archive is removed afterwards");
    }

    #[tokio::test]
    async fn upload_source_missing_directory_touches_nothing() {
        let (resource, obj) = parse_manifest(MANIFEST, "default").unwrap();
        let mut mock = MockControlPlane::new();
        mock.expect_create().never();
        mock.expect_watch().never();

        let err = upload_source(
            &mock,
            Arc::new(MockArtifactUploader::new()),
            &resource,
            obj,
            Path::new("/does/not/exist"),
            UploadMode::UploadOnly,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::MissingSource { .. }));
    }
}
