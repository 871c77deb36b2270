//! Tracked resource identity and typed status decoding
//!
//! Workbench resources (notebooks, models, datasets, servers) are custom
//! resources whose status is owned by the control plane. The client only ever
//! reads status, so each snapshot is decoded once into a [`ResourceStatus`]
//! with explicit optional fields instead of being probed as an untyped map.

use std::fmt;
use std::str::FromStr;

use kube::api::{DynamicObject, TypeMeta};
use kube::discovery::ApiResource;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{Error, Result};

/// API group of every workbench resource
pub const API_GROUP: &str = "workbench.dev";
/// Served version of every workbench resource
pub const API_VERSION: &str = "v1";
/// Condition type that marks a resource as ready
pub const CONDITION_READY: &str = "Ready";

/// Kinds of resource the CLI knows how to drive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Notebook,
    Model,
    Dataset,
    Server,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notebook => "Notebook",
            Self::Model => "Model",
            Self::Dataset => "Dataset",
            Self::Server => "Server",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            Self::Notebook => "notebooks",
            Self::Model => "models",
            Self::Dataset => "datasets",
            Self::Server => "servers",
        }
    }

    /// Build the dynamic `ApiResource` used for all API calls on this kind.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: API_GROUP.to_string(),
            version: API_VERSION.to_string(),
            api_version: format!("{}/{}", API_GROUP, API_VERSION),
            kind: self.as_str().to_string(),
            plural: self.plural().to_string(),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "notebook" | "notebooks" | "nb" => Ok(Self::Notebook),
            "model" | "models" => Ok(Self::Model),
            "dataset" | "datasets" => Ok(Self::Dataset),
            "server" | "servers" => Ok(Self::Server),
            other => Err(Error::validation(format!(
                "unsupported kind '{}', expected one of notebook, model, dataset, server",
                other
            ))),
        }
    }
}

/// Identity of a tracked resource. Never changes after creation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Name of the pod backing this resource.
    ///
    /// The controller names workload pods `<name>-<kind>`, so the pod can be
    /// located again after it is replaced.
    pub fn pod_name(&self) -> String {
        format!("{}-{}", self.name, self.kind.as_str().to_ascii_lowercase())
    }

    /// Field selector matching exactly this object.
    pub fn field_selector(&self) -> String {
        format!("metadata.name={}", self.name)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<&str> for ConditionStatus {
    fn from(s: &str) -> Self {
        match s {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

/// A typed status signal, looked up by type
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub type_: String,
    pub status: ConditionStatus,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            type_: type_.into(),
            status,
        }
    }
}

/// Decoded view of a resource's server-owned status
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceStatus {
    pub conditions: Vec<Condition>,
    /// Upload destination, `None` until the control plane provisions one
    pub upload_url: Option<String>,
    /// Build-completion flag reported by remote builds
    pub ready: Option<bool>,
}

#[derive(Deserialize, Default)]
struct RawStatus {
    #[serde(default)]
    conditions: Vec<RawCondition>,
    #[serde(rename = "uploadURL")]
    upload_url: Option<String>,
    upload: Option<RawUpload>,
    ready: Option<bool>,
}

#[derive(Deserialize)]
struct RawCondition {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct RawUpload {
    #[serde(rename = "uploadURL")]
    upload_url: Option<String>,
}

impl ResourceStatus {
    /// Decode a raw `status` document. A missing or null status is empty.
    pub fn decode(status: Option<&Value>) -> Result<Self> {
        let raw: RawStatus = match status {
            None | Some(Value::Null) => RawStatus::default(),
            Some(value) => serde_json::from_value(value.clone())?,
        };

        let upload_url = raw
            .upload
            .and_then(|u| u.upload_url)
            .filter(|url| !url.is_empty())
            .or(raw.upload_url.filter(|url| !url.is_empty()));

        Ok(Self {
            conditions: raw
                .conditions
                .into_iter()
                .map(|c| Condition::new(c.type_, ConditionStatus::from(c.status.as_str())))
                .collect(),
            upload_url,
            ready: raw.ready,
        })
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True iff a `Ready` condition reports `True`.
    pub fn is_ready(&self) -> bool {
        self.condition(CONDITION_READY)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// True once a remote build reported completion.
    pub fn build_complete(&self) -> bool {
        self.ready == Some(true)
    }
}

/// Immutable snapshot of a tracked resource as received from the control plane
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedResource {
    pub reference: ResourceRef,
    pub status: ResourceStatus,
    /// Last observed `spec.suspend` intent
    pub suspended: Option<bool>,
    pub resource_version: Option<String>,
}

impl TrackedResource {
    pub fn from_object(kind: ResourceKind, obj: &DynamicObject) -> Result<Self> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::command_failed(format!("{} object has no name", kind)))?;
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();

        Ok(Self {
            reference: ResourceRef::new(kind, name, namespace),
            status: ResourceStatus::decode(obj.data.get("status"))?,
            suspended: obj
                .data
                .pointer("/spec/suspend")
                .and_then(Value::as_bool),
            resource_version: obj.metadata.resource_version.clone(),
        })
    }
}

/// Parse a single-document YAML manifest into a workbench object.
///
/// The namespace falls back to `default_namespace` when the manifest omits it.
pub fn parse_manifest(yaml: &str, default_namespace: &str) -> Result<(ResourceRef, DynamicObject)> {
    let mut obj: DynamicObject = serde_yaml::from_str(yaml)?;

    let types = obj
        .types
        .clone()
        .ok_or_else(|| Error::validation("manifest is missing apiVersion/kind"))?;
    let kind: ResourceKind = types.kind.parse()?;

    let expected = kind.api_resource().api_version;
    if types.api_version != expected {
        return Err(Error::validation(format!(
            "unsupported apiVersion '{}' for {}, expected {}",
            types.api_version, kind, expected
        )));
    }

    let name = obj
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::validation("manifest is missing metadata.name"))?;
    let namespace = obj
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| default_namespace.to_string());
    obj.metadata.namespace = Some(namespace.clone());
    obj.types = Some(TypeMeta {
        api_version: expected,
        kind: kind.as_str().to_string(),
    });

    Ok((ResourceRef::new(kind, name, namespace), obj))
}

/// Merge patch recording the artifact digest the upload target must verify.
pub fn checksum_patch(md5_hex: &str) -> Value {
    json!({ "spec": { "image": { "upload": { "md5checksum": md5_hex } } } })
}

/// Set `spec.image.upload.md5checksum` on an object about to be created.
pub fn set_upload_checksum(obj: &mut DynamicObject, md5_hex: &str) {
    if !obj.data.is_object() {
        obj.data = json!({});
    }
    let spec = &mut obj.data["spec"];
    if !spec.is_object() {
        *spec = json!({});
    }
    let image = &mut spec["image"];
    if !image.is_object() {
        *image = json!({});
    }
    image["upload"] = json!({ "md5checksum": md5_hex });
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTEBOOK_YAML: &str = r#"
apiVersion: workbench.dev/v1
kind: Notebook
metadata:
  name: falcon
spec:
  suspend: false
"#;

    #[test]
    fn kind_parses_case_insensitive_and_plural() {
        assert_eq!("Notebook".parse::<ResourceKind>().unwrap(), ResourceKind::Notebook);
        assert_eq!("notebooks".parse::<ResourceKind>().unwrap(), ResourceKind::Notebook);
        assert_eq!("DATASET".parse::<ResourceKind>().unwrap(), ResourceKind::Dataset);
        assert!("deployment".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn api_resource_uses_workbench_group() {
        let ar = ResourceKind::Model.api_resource();
        assert_eq!(ar.api_version, "workbench.dev/v1");
        assert_eq!(ar.plural, "models");
        assert_eq!(ar.kind, "Model");
    }

    #[test]
    fn pod_name_follows_naming_convention() {
        let nb = ResourceRef::new(ResourceKind::Notebook, "falcon", "ml");
        assert_eq!(nb.pod_name(), "falcon-notebook");
        assert_eq!(nb.field_selector(), "metadata.name=falcon");
    }

    #[test]
    fn decode_missing_status_is_empty() {
        let status = ResourceStatus::decode(None).unwrap();
        assert_eq!(status, ResourceStatus::default());
        assert!(!status.is_ready());
        assert!(ResourceStatus::decode(Some(&Value::Null)).unwrap().upload_url.is_none());
    }

    #[test]
    fn decode_ready_condition() {
        let raw = json!({
            "conditions": [
                {"type": "Built", "status": "True"},
                {"type": "Ready", "status": "True"}
            ]
        });
        let status = ResourceStatus::decode(Some(&raw)).unwrap();
        assert!(status.is_ready());
        assert_eq!(
            status.condition("Built").map(|c| c.status),
            Some(ConditionStatus::True)
        );
    }

    #[test]
    fn decode_ready_false_or_unknown_is_not_ready() {
        let raw = json!({"conditions": [{"type": "Ready", "status": "False"}]});
        assert!(!ResourceStatus::decode(Some(&raw)).unwrap().is_ready());

        let raw = json!({"conditions": [{"type": "Ready", "status": "Maybe"}]});
        let status = ResourceStatus::decode(Some(&raw)).unwrap();
        assert_eq!(
            status.condition(CONDITION_READY).map(|c| c.status),
            Some(ConditionStatus::Unknown)
        );
    }

    #[test]
    fn decode_upload_url_from_either_location() {
        let nested = json!({"upload": {"uploadURL": "https://store/a"}});
        assert_eq!(
            ResourceStatus::decode(Some(&nested)).unwrap().upload_url.as_deref(),
            Some("https://store/a")
        );

        let flat = json!({"uploadURL": "https://store/b"});
        assert_eq!(
            ResourceStatus::decode(Some(&flat)).unwrap().upload_url.as_deref(),
            Some("https://store/b")
        );
    }

    #[test]
    fn decode_empty_upload_url_is_absent() {
        let raw = json!({"upload": {"uploadURL": ""}, "uploadURL": ""});
        assert!(ResourceStatus::decode(Some(&raw)).unwrap().upload_url.is_none());
    }

    #[test]
    fn decode_build_ready_flag() {
        let raw = json!({"ready": true});
        assert!(ResourceStatus::decode(Some(&raw)).unwrap().build_complete());
        assert!(!ResourceStatus::default().build_complete());
    }

    #[test]
    fn decode_malformed_status_fails() {
        let raw = json!({"conditions": "not-a-list"});
        assert!(ResourceStatus::decode(Some(&raw)).is_err());
    }

    #[test]
    fn tracked_resource_from_object() {
        let ar = ResourceKind::Notebook.api_resource();
        let mut obj = DynamicObject::new("falcon", &ar).within("ml");
        obj.data = json!({
            "spec": {"suspend": true},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        });

        let tracked = TrackedResource::from_object(ResourceKind::Notebook, &obj).unwrap();
        assert_eq!(tracked.reference.name, "falcon");
        assert_eq!(tracked.reference.namespace, "ml");
        assert_eq!(tracked.suspended, Some(true));
        assert!(tracked.status.is_ready());
    }

    #[test]
    fn parse_manifest_defaults_namespace() {
        let (reference, obj) = parse_manifest(NOTEBOOK_YAML, "team-a").unwrap();
        assert_eq!(reference.kind, ResourceKind::Notebook);
        assert_eq!(reference.name, "falcon");
        assert_eq!(reference.namespace, "team-a");
        assert_eq!(obj.metadata.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn parse_manifest_rejects_foreign_group() {
        let yaml = NOTEBOOK_YAML.replace("workbench.dev/v1", "apps/v1");
        let err = parse_manifest(&yaml, "default").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn parse_manifest_requires_name() {
        let yaml = "apiVersion: workbench.dev/v1\nkind: Model\nmetadata: {}\n";
        assert!(parse_manifest(yaml, "default").is_err());
    }

    #[test]
    fn set_upload_checksum_keeps_existing_spec() {
        let (_, mut obj) = parse_manifest(NOTEBOOK_YAML, "default").unwrap();
        obj.data["spec"] = json!({"gpu": "a100"});
        set_upload_checksum(&mut obj, "abc123");
        assert_eq!(obj.data["spec"]["gpu"], "a100");
        assert_eq!(obj.data["spec"]["image"]["upload"]["md5checksum"], "abc123");
    }

    #[test]
    fn checksum_patch_shape() {
        let patch = checksum_patch("d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            patch.pointer("/spec/image/upload/md5checksum").and_then(Value::as_str),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
    }
}
