//! K8s-style resource manifests.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DeployError, Result};

/// Kinds that carry a pod template and can be targeted by sync or local mode.
pub const SYNCABLE_KINDS: &[&str] = &["Deployment", "DaemonSet", "StatefulSet"];

/// Kinds whose objects are not namespaced.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

/// Metadata fields owned by the API server.
pub const SERVER_METADATA_FIELDS: &[&str] = &[
    "creationTimestamp",
    "generation",
    "managedFields",
    "resourceVersion",
    "selfLink",
    "uid",
];

/// Metadata for a resource, following K8s conventions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// The name of the resource, unique within kind and namespace.
    #[serde(default)]
    pub name: String,

    /// Target namespace. `None` means "the deploy namespace" for namespaced kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Key-value labels for organizing and selecting resources.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Key-value annotations used for provenance, hashes and mode tags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Anything else the API server or the user put in `metadata`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ObjectMeta {
    /// Creates a new ObjectMeta with just a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Adds a label to the metadata.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Sets the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// A single declarative resource description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// `spec`, `data`, `items`, `status` and any other top-level fields.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Manifest {
    /// Creates a manifest with the given identity and an empty body.
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: ObjectMeta::new(name),
            body: Map::new(),
        }
    }

    /// Sets a top-level body field (e.g. `spec` or `data`).
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.body.insert(key.to_string(), value);
        self
    }

    /// Returns the name of the resource.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The manifest key, `<Kind>/<name>`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.metadata.name)
    }

    /// Whether objects of this kind live in a namespace.
    pub fn is_namespaced(&self) -> bool {
        is_namespaced_kind(&self.kind)
    }

    /// The effective namespace, falling back to `default_namespace` for namespaced kinds.
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> Option<&'a str> {
        if !self.is_namespaced() {
            return None;
        }
        Some(self.metadata.namespace.as_deref().unwrap_or(default_namespace))
    }

    /// Reference to the live object this manifest describes.
    pub fn resource_ref(&self, default_namespace: &str) -> ResourceRef {
        ResourceRef {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace_or(default_namespace).map(str::to_string),
            name: self.metadata.name.clone(),
        }
    }

    /// Returns an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    /// Sets an annotation.
    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.annotations.insert(key.into(), value.into());
    }

    /// Whether this is a `*List` wrapper whose items should be flattened.
    pub fn is_list(&self) -> bool {
        self.kind.ends_with("List") && self.body.get("items").is_some_and(Value::is_array)
    }

    /// Returns `spec`, if present.
    pub fn spec(&self) -> Option<&Value> {
        self.body.get("spec")
    }

    /// Returns `status`, if present.
    pub fn status(&self) -> Option<&Value> {
        self.body.get("status")
    }

    /// Follows a path of object keys from the body root.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.body.get(*first)?;
        for key in rest {
            current = current.get(*key)?;
        }
        Some(current)
    }

    /// Mutable access to the pod spec for workload kinds and pods.
    pub fn pod_spec_mut(&mut self) -> Option<&mut Map<String, Value>> {
        let path: &[&str] = match self.kind.as_str() {
            "Pod" => &["spec"],
            "CronJob" => &["spec", "jobTemplate", "spec", "template", "spec"],
            "Deployment" | "DaemonSet" | "StatefulSet" | "ReplicaSet" | "Job" => {
                &["spec", "template", "spec"]
            }
            _ => return None,
        };
        let (first, rest) = path.split_first()?;
        let mut current = self.body.get_mut(*first)?;
        for key in rest {
            current = current.get_mut(*key)?;
        }
        current.as_object_mut()
    }

    /// Read-only access to the pod spec for workload kinds and pods.
    pub fn pod_spec(&self) -> Option<&Map<String, Value>> {
        let path: &[&str] = match self.kind.as_str() {
            "Pod" => &["spec"],
            "CronJob" => &["spec", "jobTemplate", "spec", "template", "spec"],
            "Deployment" | "DaemonSet" | "StatefulSet" | "ReplicaSet" | "Job" => {
                &["spec", "template", "spec"]
            }
            _ => return None,
        };
        self.get_path(path)?.as_object()
    }

    /// Labels on the pod template, used for pod-selector matching.
    pub fn pod_template_labels(&self) -> BTreeMap<String, String> {
        let labels = match self.kind.as_str() {
            "Pod" => return self.metadata.labels.clone(),
            _ => self.get_path(&["spec", "template", "metadata", "labels"]),
        };
        labels
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `spec.selector.matchLabels` of a workload.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        self.get_path(&["spec", "selector", "matchLabels"])
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of the owners of the given kind, from `metadata.ownerReferences`.
    pub fn owners(&self, kind: &str) -> Vec<&str> {
        self.metadata
            .extra
            .get("ownerReferences")
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter(|r| r.get("kind").and_then(Value::as_str) == Some(kind))
                    .filter_map(|r| r.get("name").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A copy without `status` and server-owned metadata, suitable for re-applying.
    pub fn without_server_fields(&self) -> Manifest {
        let mut clean = self.clone();
        for key in SERVER_METADATA_FIELDS {
            clean.metadata.extra.remove(*key);
        }
        clean.body.remove("status");
        clean
    }

    /// Converts to a JSON value.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parses from a JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Whether objects of `kind` are namespaced.
pub fn is_namespaced_kind(kind: &str) -> bool {
    !CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Identifies a live object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        let kind = kind.into();
        let namespace = if is_namespaced_kind(&kind) {
            namespace.map(str::to_string)
        } else {
            None
        };
        Self {
            api_version: api_version.into(),
            kind,
            namespace,
            name: name.into(),
        }
    }

    /// The manifest key, `<Kind>/<name>`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} (namespace {})", self.kind, self.name, ns),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Parses every YAML document in `content` into manifests.
///
/// Empty documents are skipped; a document without `kind`/`apiVersion` is an error.
pub fn parse_manifests(content: &str, path: &Path) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| DeployError::ParseYaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if value.is_null() {
            continue;
        }
        let manifest: Manifest =
            serde_yaml::from_value(value).map_err(|e| DeployError::ParseYaml {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        manifests.push(manifest);
    }
    Ok(manifests)
}

/// Expands `*List` manifests into their items, recursively.
pub fn flatten_lists(manifests: Vec<Manifest>) -> Result<Vec<Manifest>> {
    let mut out = Vec::with_capacity(manifests.len());
    for manifest in manifests {
        if manifest.is_list() {
            let items = match manifest.body.get("items") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            let parsed = items
                .into_iter()
                .map(Manifest::from_value)
                .collect::<Result<Vec<_>>>()?;
            out.extend(flatten_lists(parsed)?);
        } else {
            out.push(manifest);
        }
    }
    Ok(out)
}

/// Whether every `selector` label is present with the same value in `labels`.
pub fn labels_match(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}
