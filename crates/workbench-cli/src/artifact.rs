//! Artifact packaging, digests and upload transport
//!
//! A local source directory is packaged into a deterministic `.tar.gz`, its
//! MD5 digest recorded on the resource spec as lowercase hex, and the archive
//! later sent to the upload target with the digest re-encoded as base64 of the
//! raw 16 bytes in a `Content-MD5` header. The destination rejects the body if
//! the two disagree.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use walkdir::WalkDir;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Directory names never included in an archive
const EXCLUDED_DIRS: &[&str] = &[".git", "__pycache__", ".ipynb_checkpoints"];

/// Upper bound for a single artifact transfer
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A packaged artifact ready for upload. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub path: PathBuf,
    /// Lowercase hex MD5 of the archive, as recorded on the resource spec
    pub md5_hex: String,
    /// Base64 of the raw digest bytes, sent as the integrity header
    pub integrity_token: String,
    pub size: u64,
}

impl ArtifactDescriptor {
    /// Describe an existing archive on disk.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut reader = BufReader::new(File::open(&path)?);
        let mut hasher = Md5::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        let md5_hex = hex::encode(hasher.finalize());
        let integrity_token = integrity_token(&md5_hex)?;
        Ok(Self {
            path,
            md5_hex,
            integrity_token,
            size,
        })
    }
}

/// Re-encode a hex digest as base64 of the bytes it represents.
pub fn integrity_token(md5_hex: &str) -> Result<String> {
    let raw = hex::decode(md5_hex)
        .map_err(|e| Error::validation(format!("invalid hex digest '{}': {}", md5_hex, e)))?;
    Ok(STANDARD.encode(raw))
}

fn is_excluded(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
}

/// Package `src` into a gzip-compressed tarball at `dest`.
///
/// Entries are added in sorted order with normalized headers so the same tree
/// always yields the same digest.
pub fn package_directory(src: &Path, dest: &Path) -> Result<ArtifactDescriptor> {
    if !src.is_dir() {
        return Err(Error::MissingSource {
            path: src.to_path_buf(),
        });
    }

    let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    let mut files = 0usize;
    let walker = WalkDir::new(src)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_excluded(e));

    for entry in walker {
        let entry = entry.map_err(|e| Error::command_failed(format!("walking source: {}", e)))?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::command_failed(e.to_string()))?;

        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), rel)?;
            files += 1;
        }
    }

    builder.into_inner()?.finish()?;

    let artifact = ArtifactDescriptor::from_file(dest)?;
    info!(
        source = %src.display(),
        files,
        bytes = artifact.size,
        md5 = %artifact.md5_hex,
        "packaged artifact"
    );
    Ok(artifact)
}

/// Transfers an artifact to a provisioned upload target
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    async fn upload(&self, url: &str, artifact: &ArtifactDescriptor) -> Result<()>;
}

/// Uploads with a single HTTP `PUT` to a pre-signed URL
#[derive(Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::command_failed(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactUploader for HttpUploader {
    async fn upload(&self, url: &str, artifact: &ArtifactDescriptor) -> Result<()> {
        let file = tokio::fs::File::open(&artifact.path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        debug!(bytes = artifact.size, "uploading artifact");
        let response = self
            .client
            .put(url)
            .header("Content-MD5", &artifact.integrity_token)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", artifact.size)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::upload(url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::upload(url, format!("{}: {}", status, body)));
        }
        Ok(())
    }
}
