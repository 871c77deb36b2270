//! Workbench CLI configuration stored at `~/.workbench/config.json`.
//!
//! Holds per-user defaults so common flags can be omitted. Command-line
//! flags always win over the file, and the file over built-in defaults.
//!
//! The kubeconfig resolution chain (highest priority first):
//! 1. Explicit `--kubeconfig` flag
//! 2. `WORKBENCH_KUBECONFIG` environment variable
//! 3. Fall back to kube default (`KUBECONFIG` env / `~/.kube/config`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::commands::parse_duration;
use crate::tunnel::NOTEBOOK_PORT;
use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".workbench";
const CONFIG_FILE_NAME: &str = "config.json";
const WORKBENCH_KUBECONFIG_ENV: &str = "WORKBENCH_KUBECONFIG";

/// Namespace used when neither the flag, the manifest nor the file sets one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Persistent CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkbenchConfig {
    /// Namespace used when none is given.
    pub default_namespace: Option<String>,
    /// How long `notebook` and `resume --wait` wait for readiness, e.g. `10m`.
    pub ready_timeout: Option<String>,
    /// Local port for notebook tunnels.
    pub notebook_port: Option<u16>,
}

impl WorkbenchConfig {
    /// Namespace from `flag`, else the configured default.
    pub fn namespace(&self, flag: Option<&str>) -> String {
        flag.or(self.default_namespace.as_deref())
            .unwrap_or(DEFAULT_NAMESPACE)
            .to_string()
    }

    /// Readiness deadline from `flag`, else the configured one. `None` waits forever.
    pub fn ready_timeout(&self, flag: Option<&str>) -> Result<Option<Duration>> {
        flag.or(self.ready_timeout.as_deref())
            .map(|s| parse_duration(s).map(Duration::from_secs))
            .transpose()
    }

    /// Local tunnel port from `flag`, else the configured one, else the pod port.
    pub fn notebook_port(&self, flag: Option<u16>) -> u16 {
        flag.or(self.notebook_port).unwrap_or(NOTEBOOK_PORT)
    }
}

/// Returns `~/.workbench/`.
pub fn workbench_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::command_failed("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Path to `~/.workbench/config.json`.
pub fn config_path() -> Result<PathBuf> {
    Ok(workbench_dir()?.join(CONFIG_FILE_NAME))
}

/// Load config from `~/.workbench/config.json`, returning default if missing.
pub fn load_config() -> Result<WorkbenchConfig> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<WorkbenchConfig> {
    if !path.exists() {
        return Ok(WorkbenchConfig::default());
    }
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::command_failed(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&data)
        .map_err(|e| Error::command_failed(format!("failed to parse {}: {}", path.display(), e)))
}

/// Resolve a kubeconfig path using the priority chain.
///
/// Returns `Some(path)` if one is configured, `None` to use kube defaults.
pub fn resolve_kubeconfig(explicit: Option<&str>) -> Option<String> {
    resolve_kubeconfig_with(explicit, std::env::var(WORKBENCH_KUBECONFIG_ENV).ok())
}

fn resolve_kubeconfig_with(explicit: Option<&str>, env: Option<String>) -> Option<String> {
    if let Some(path) = explicit {
        return Some(path.to_string());
    }
    env.filter(|path| !path.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_uses_camel_case() {
        let config: WorkbenchConfig = serde_json::from_str(
            r#"{"defaultNamespace": "ml", "readyTimeout": "10m", "notebookPort": 9999}"#,
        )
        .unwrap();

        assert_eq!(config.default_namespace.as_deref(), Some("ml"));
        assert_eq!(config.ready_timeout.as_deref(), Some("10m"));
        assert_eq!(config.notebook_port, Some(9999));
    }

    #[test]
    fn flags_override_file_values() {
        let config = WorkbenchConfig {
            default_namespace: Some("ml".to_string()),
            ready_timeout: Some("10m".to_string()),
            notebook_port: Some(9999),
        };

        assert_eq!(config.namespace(Some("team")), "team");
        assert_eq!(config.namespace(None), "ml");
        assert_eq!(
            config.ready_timeout(Some("30s")).unwrap(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            config.ready_timeout(None).unwrap(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.notebook_port(Some(1234)), 1234);
        assert_eq!(config.notebook_port(None), 9999);
    }

    #[test]
    fn builtin_defaults() {
        let config = WorkbenchConfig::default();
        assert_eq!(config.namespace(None), DEFAULT_NAMESPACE);
        assert_eq!(config.ready_timeout(None).unwrap(), None);
        assert_eq!(config.notebook_port(None), NOTEBOOK_PORT);
    }

    #[test]
    fn invalid_timeout_is_rejected() {
        let config = WorkbenchConfig {
            ready_timeout: Some("soon".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.ready_timeout(None),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, WorkbenchConfig::default());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_config_from(&path).is_err());
    }

    #[test]
    fn kubeconfig_chain() {
        assert_eq!(
            resolve_kubeconfig_with(Some("/flag"), Some("/env".to_string())).as_deref(),
            Some("/flag")
        );
        assert_eq!(
            resolve_kubeconfig_with(None, Some("/env".to_string())).as_deref(),
            Some("/env")
        );
        assert_eq!(resolve_kubeconfig_with(None, Some(String::new())), None);
        assert_eq!(resolve_kubeconfig_with(None, None), None);
    }
}
