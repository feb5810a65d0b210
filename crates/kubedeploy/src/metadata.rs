//! The metadata record: a ConfigMap describing what was last applied.
//!
//! It is written after every successful apply, read by status checks, and
//! deleted on teardown. "Not found" is a normal outcome of every operation,
//! since status checks race with deploys and teardowns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cluster::ClusterApi;
use crate::config::DeploymentIdentity;
use crate::error::{DeployError, Result};
use crate::manifest::annotations::{ACTION_NAME_LABEL, METADATA_LABEL};
use crate::manifest::{Manifest, ResourceRef};

/// Name prefix of metadata ConfigMaps.
pub const METADATA_PREFIX: &str = "garden-meta-deploy-";

/// Where one declared manifest lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    pub key: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ManifestMetadata {
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(
            &self.api_version,
            &self.kind,
            self.namespace.as_deref(),
            &self.name,
        )
    }
}

/// Contents of a metadata ConfigMap.
///
/// `mode` is kept verbatim so that a record written with an unknown mode
/// compares as different rather than failing to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub action_name: String,
    pub project_name: String,
    pub resolved_version: String,
    pub mode: String,
    pub manifest_metadata: BTreeMap<String, ManifestMetadata>,
}

/// Name of the metadata ConfigMap for an action.
pub fn metadata_name(action_name: &str) -> String {
    let sanitized: String = action_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    format!("{}{}", METADATA_PREFIX, sanitized)
}

fn metadata_ref(action_name: &str, namespace: &str) -> ResourceRef {
    ResourceRef::new("v1", "ConfigMap", Some(namespace), metadata_name(action_name))
}

impl MetadataRecord {
    /// Builds the record for a deploy of `declared`.
    pub fn new(identity: &DeploymentIdentity, project_name: &str, declared: &[Manifest]) -> Self {
        let manifest_metadata = declared
            .iter()
            .map(|m| {
                let key = m.key();
                let entry = ManifestMetadata {
                    key: key.clone(),
                    api_version: m.api_version.clone(),
                    kind: m.kind.clone(),
                    name: m.name().to_string(),
                    namespace: m.namespace_or(&identity.namespace).map(str::to_string),
                };
                (key, entry)
            })
            .collect();

        Self {
            action_name: identity.action_name.clone(),
            project_name: project_name.to_string(),
            resolved_version: identity.resolved_version.clone(),
            mode: identity.mode.to_string(),
            manifest_metadata,
        }
    }

    /// Renders the record as a ConfigMap in `namespace`.
    pub fn to_manifest(&self, namespace: &str) -> Result<Manifest> {
        let mut manifest = Manifest::new("v1", "ConfigMap", metadata_name(&self.action_name))
            .with_field(
                "data",
                json!({
                    "actionName": self.action_name,
                    "projectName": self.project_name,
                    "resolvedVersion": self.resolved_version,
                    "mode": self.mode,
                    "manifestMetadata": serde_json::to_string(&self.manifest_metadata)?,
                }),
            );
        manifest.metadata.namespace = Some(namespace.to_string());
        manifest
            .metadata
            .labels
            .insert(METADATA_LABEL.to_string(), "true".to_string());
        manifest
            .metadata
            .labels
            .insert(ACTION_NAME_LABEL.to_string(), self.action_name.clone());
        Ok(manifest)
    }

    /// Parses a record from its ConfigMap.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        let data = manifest
            .body
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                DeployError::NotFound(format!("data of metadata record {}", manifest.name()))
            })?;
        let field = |key: &str| -> String {
            data.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let manifest_metadata = match data.get("manifestMetadata").and_then(Value::as_str) {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                log::warn!(
                    "Ignoring unreadable manifest metadata in {}: {}",
                    manifest.name(),
                    e
                );
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };

        Ok(Self {
            action_name: field("actionName"),
            project_name: field("projectName"),
            resolved_version: field("resolvedVersion"),
            mode: field("mode"),
            manifest_metadata,
        })
    }
}

/// The metadata ConfigMap for a deploy of `declared`.
pub fn get_metadata_manifest(
    identity: &DeploymentIdentity,
    project_name: &str,
    declared: &[Manifest],
) -> Result<Manifest> {
    MetadataRecord::new(identity, project_name, declared).to_manifest(&identity.namespace)
}

/// Creates or overwrites a metadata record.
pub async fn write(cluster: &dyn ClusterApi, record: &Manifest) -> Result<()> {
    cluster.apply(record).await?;
    Ok(())
}

/// Reads the record for an action. `Ok(None)` if there is none.
pub async fn read(
    cluster: &dyn ClusterApi,
    action_name: &str,
    namespace: &str,
) -> Result<Option<MetadataRecord>> {
    let found = match cluster.get(&metadata_ref(action_name, namespace)).await {
        Ok(found) => found,
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };
    match found {
        Some(manifest) => match MetadataRecord::from_manifest(&manifest) {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        },
        None => Ok(None),
    }
}

/// Deletes the record for an action. Returns whether one existed.
pub async fn delete(cluster: &dyn ClusterApi, action_name: &str, namespace: &str) -> Result<bool> {
    match cluster.delete(&metadata_ref(action_name, namespace)).await {
        Ok(deleted) => Ok(deleted),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
