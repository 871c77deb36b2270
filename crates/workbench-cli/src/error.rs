//! Error types for the CLI

use std::path::PathBuf;
use std::time::Duration;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("artifact source not found: {path}")]
    MissingSource { path: PathBuf },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    #[error("{resource} was deleted while being watched")]
    ResourceDeleted { resource: String },

    #[error("watch on {resource} failed: {message}")]
    Watch { resource: String, message: String },

    #[error("watch on {resource} closed unexpectedly")]
    WatchClosed { resource: String },

    #[error("unrecognized watch event {kind} for {resource}")]
    UnrecognizedEvent { resource: String, kind: String },

    #[error("upload to {url} failed: {message}")]
    Upload { url: String, message: String },

    #[error("tunnel to {pod} failed: {message}")]
    Tunnel { pod: String, message: String },

    #[error("cannot bind local port {port}: {source}")]
    LocalBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("{resource} not ready after {waited:?}")]
    Timeout { resource: String, waited: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("command failed: {message}")]
    CommandFailed { message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }

    pub fn upload(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Upload {
            url: url.into(),
            message: message.into(),
        }
    }

    /// True for readiness deadline failures, as opposed to rejections.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinct_from_rejection() {
        let timeout = Error::Timeout {
            resource: "notebook/default/nb".into(),
            waited: Duration::from_secs(5),
        };
        assert!(timeout.is_timeout());
        assert!(!Error::command_failed("rejected").is_timeout());
        assert!(!Error::Cancelled.is_timeout());
    }

    #[test]
    fn local_bind_keeps_source() {
        let err = Error::LocalBind {
            port: 8888,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("8888"));
    }
}
