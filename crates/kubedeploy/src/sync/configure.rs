//! Rewrites workload manifests for sync and local mode.
//!
//! The target workload's pod template gets a shared `emptyDir` volume, an init
//! container that copies the sync agent into it, and a mount of that volume on
//! the target container. Existing spec fields are kept; provider image pull
//! secrets are appended to those already declared.

use serde_json::{json, Map, Value};

use super::spec::{SyncSpec, TargetSpec};
use crate::config::{DeployMode, LocalModeSpec, ProviderConfig};
use crate::error::{DeployError, Result};
use crate::manifest::annotations::MODE;
use crate::manifest::resource::{labels_match, SYNCABLE_KINDS};
use crate::manifest::Manifest;

/// Name of the shared volume.
pub const SYNC_VOLUME_NAME: &str = "garden";

/// Where the shared volume is mounted.
pub const SYNC_VOLUME_MOUNT_PATH: &str = "/.garden";

/// Name of the init container that installs the sync agent.
pub const SYNC_INIT_CONTAINER_NAME: &str = "garden-dev-init";

/// Path of the sync agent inside the shared volume.
pub const SYNC_AGENT_PATH: &str = "/.garden/mutagen-agent";

/// Result of a rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfiguredManifests {
    /// Keys (`Kind/name`) of the manifests that were changed.
    pub updated: Vec<String>,
    pub manifests: Vec<Manifest>,
}

/// Finds the manifests a target refers to.
///
/// A `kind`+`name` target must name a declared workload; a pod selector matches
/// every declared workload whose pod template carries the selector's labels.
pub fn resolve_target(
    action: &str,
    manifests: &[Manifest],
    target: &TargetSpec,
) -> Result<Vec<usize>> {
    if let (Some(kind), Some(name)) = (&target.kind, &target.name) {
        if !SYNCABLE_KINDS.contains(&kind.as_str()) {
            return Err(DeployError::config(
                action,
                format!(
                    "target kind {} is not supported, must be one of {}",
                    kind,
                    SYNCABLE_KINDS.join(", ")
                ),
            ));
        }
        return manifests
            .iter()
            .position(|m| &m.kind == kind && m.name() == name)
            .map(|i| vec![i])
            .ok_or_else(|| {
                DeployError::config(
                    action,
                    format!("could not find {}/{} among the declared manifests", kind, name),
                )
            });
    }

    if let Some(selector) = target.pod_selector.as_ref().filter(|s| !s.is_empty()) {
        let matched: Vec<usize> = manifests
            .iter()
            .enumerate()
            .filter(|(_, m)| SYNCABLE_KINDS.contains(&m.kind.as_str()))
            .filter(|(_, m)| labels_match(selector, &m.pod_template_labels()))
            .map(|(i, _)| i)
            .collect();
        if matched.is_empty() {
            return Err(DeployError::config(
                action,
                format!("no declared workload matches the target {}", target),
            ));
        }
        return Ok(matched);
    }

    Err(DeployError::config(
        action,
        "target must specify kind and name, or a podSelector",
    ))
}

/// The explicit target, or the default, or an error naming what lacks one.
pub(crate) fn effective_target<'a>(
    action: &str,
    what: &str,
    target: Option<&'a TargetSpec>,
    default_target: Option<&'a TargetSpec>,
) -> Result<&'a TargetSpec> {
    target
        .filter(|t| t.is_specified())
        .or(default_target.filter(|t| t.is_specified()))
        .ok_or_else(|| {
            DeployError::config(
                action,
                format!(
                    "{} must specify a target (kind and name, or podSelector), or the action must set a defaultTarget",
                    what
                ),
            )
        })
}

fn array_field<'a>(object: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Vec<Value>> {
    object
        .entry(key)
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
}

fn has_named(items: &[Value], name: &str) -> bool {
    items
        .iter()
        .any(|v| v.get("name").and_then(Value::as_str) == Some(name))
}

pub(crate) fn container_index(pod_spec: &Map<String, Value>, container_name: Option<&str>) -> Option<usize> {
    let containers = pod_spec.get("containers")?.as_array()?;
    match container_name {
        Some(name) => containers
            .iter()
            .position(|c| c.get("name").and_then(Value::as_str) == Some(name)),
        None => (!containers.is_empty()).then_some(0),
    }
}

/// Mutable access to the target container of a workload.
fn target_container<'a>(
    action: &str,
    manifest: &'a mut Manifest,
    container_name: Option<&str>,
) -> Result<&'a mut Map<String, Value>> {
    let key = manifest.key();
    let pod_spec = manifest
        .pod_spec_mut()
        .ok_or_else(|| DeployError::config(action, format!("{} has no pod template", key)))?;
    let index = container_index(pod_spec, container_name).ok_or_else(|| {
        DeployError::config(
            action,
            match container_name {
                Some(name) => format!("{} has no container named {}", key, name),
                None => format!("{} declares no containers", key),
            },
        )
    })?;
    pod_spec
        .get_mut("containers")
        .and_then(Value::as_array_mut)
        .and_then(|c| c.get_mut(index))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| DeployError::config(action, format!("{} has a malformed container", key)))
}

fn set_mode_annotations(manifest: &mut Manifest, mode: DeployMode) {
    manifest.set_annotation(MODE, mode.as_str());
    if let Some(template) = manifest
        .body
        .get_mut("spec")
        .and_then(|s| s.get_mut("template"))
        .and_then(Value::as_object_mut)
    {
        let metadata = template
            .entry("metadata")
            .or_insert_with(|| json!({}));
        if let Some(metadata) = metadata.as_object_mut() {
            let annotations = metadata
                .entry("annotations")
                .or_insert_with(|| json!({}));
            if let Some(annotations) = annotations.as_object_mut() {
                annotations.insert(MODE.to_string(), json!(mode.as_str()));
            }
        }
    }
}

/// Adds the shared volume, the agent init container, the target container's
/// mount and the provider's image pull secrets.
pub fn add_sync_agent(
    action: &str,
    manifest: &mut Manifest,
    container_name: Option<&str>,
    provider: &ProviderConfig,
    mode: DeployMode,
) -> Result<()> {
    let key = manifest.key();
    let mount = json!({"name": SYNC_VOLUME_NAME, "mountPath": SYNC_VOLUME_MOUNT_PATH});

    {
        let pod_spec = manifest
            .pod_spec_mut()
            .ok_or_else(|| DeployError::config(action, format!("{} has no pod template", key)))?;

        if let Some(volumes) = array_field(pod_spec, "volumes") {
            if !has_named(volumes, SYNC_VOLUME_NAME) {
                volumes.push(json!({"name": SYNC_VOLUME_NAME, "emptyDir": {}}));
            }
        }

        if let Some(init_containers) = array_field(pod_spec, "initContainers") {
            if !has_named(init_containers, SYNC_INIT_CONTAINER_NAME) {
                init_containers.push(json!({
                    "name": SYNC_INIT_CONTAINER_NAME,
                    "image": provider.sync_util_image,
                    "imagePullPolicy": "IfNotPresent",
                    "command": [
                        "/bin/sh",
                        "-c",
                        format!("cp /usr/local/bin/mutagen-agent {}", SYNC_AGENT_PATH),
                    ],
                    "volumeMounts": [mount.clone()],
                }));
            }
        }

        if !provider.image_pull_secrets.is_empty() {
            if let Some(secrets) = array_field(pod_spec, "imagePullSecrets") {
                for secret in &provider.image_pull_secrets {
                    if !has_named(secrets, &secret.name) {
                        secrets.push(json!({"name": secret.name}));
                    }
                }
            }
        }
    }

    let container = target_container(action, manifest, container_name)?;
    if let Some(mounts) = array_field(container, "volumeMounts") {
        let mounted = mounts
            .iter()
            .any(|m| m.get("mountPath").and_then(Value::as_str) == Some(SYNC_VOLUME_MOUNT_PATH));
        if !mounted {
            mounts.push(mount);
        }
    }

    set_mode_annotations(manifest, mode);
    Ok(())
}

fn mark_updated(updated: &mut Vec<String>, key: String) {
    if !updated.contains(&key) {
        updated.push(key);
    }
}

/// Rewrites the manifests targeted by a sync spec.
pub fn configure_sync_mode(
    action: &str,
    mut manifests: Vec<Manifest>,
    spec: &SyncSpec,
    default_target: Option<&TargetSpec>,
    provider: &ProviderConfig,
) -> Result<ConfiguredManifests> {
    let mut updated = Vec::new();

    for (index, path) in spec.paths.iter().enumerate() {
        let what = format!("sync path {} ({})", index, path.container_path);
        let target = effective_target(action, &what, path.target.as_ref(), default_target)?;
        for i in resolve_target(action, &manifests, target)? {
            let manifest = &mut manifests[i];
            add_sync_agent(
                action,
                manifest,
                target.container_name.as_deref(),
                provider,
                DeployMode::Sync,
            )?;
            mark_updated(&mut updated, manifest.key());
        }
    }

    for (index, over) in spec.overrides.iter().enumerate() {
        let what = format!("sync override {}", index);
        let target = effective_target(action, &what, over.target.as_ref(), default_target)?;
        for i in resolve_target(action, &manifests, target)? {
            let manifest = &mut manifests[i];
            let key = manifest.key();
            let container = target_container(action, manifest, target.container_name.as_deref())?;
            if let Some(command) = &over.command {
                container.insert("command".to_string(), json!(command));
            }
            if let Some(args) = &over.args {
                container.insert("args".to_string(), json!(args));
            }
            if let Some(image) = &over.image {
                container.insert("image".to_string(), json!(image));
            }
            set_mode_annotations(manifest, DeployMode::Sync);
            mark_updated(&mut updated, key);
        }
    }

    Ok(ConfiguredManifests { updated, manifests })
}

/// Rewrites the target of a local mode spec.
///
/// Like sync mode, plus probes removed from the target container, the command
/// overridden when given, and a single replica.
pub fn configure_local_mode(
    action: &str,
    mut manifests: Vec<Manifest>,
    spec: &LocalModeSpec,
    default_target: Option<&TargetSpec>,
    provider: &ProviderConfig,
) -> Result<ConfiguredManifests> {
    let target = effective_target(action, "localMode", spec.target.as_ref(), default_target)?;
    let mut updated = Vec::new();

    for i in resolve_target(action, &manifests, target)? {
        let manifest = &mut manifests[i];
        let container_name = target.container_name.as_deref();
        add_sync_agent(action, manifest, container_name, provider, DeployMode::Local)?;

        let container = target_container(action, manifest, container_name)?;
        for probe in ["livenessProbe", "readinessProbe", "startupProbe"] {
            container.remove(probe);
        }
        if let Some(command) = &spec.command {
            container.insert("command".to_string(), json!(command));
        }

        if manifest.kind != "DaemonSet" {
            if let Some(workload) = manifest.body.get_mut("spec").and_then(Value::as_object_mut) {
                workload.insert("replicas".to_string(), json!(1));
            }
        }
        mark_updated(&mut updated, manifest.key());
    }

    Ok(ConfiguredManifests { updated, manifests })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretRef;
    use crate::sync::spec::{SyncOverride, SyncPathSpec};
    use std::collections::BTreeMap;

    fn deployment(name: &str, app: &str) -> Manifest {
        Manifest::new("apps/v1", "Deployment", name).with_field(
            "spec",
            json!({
                "replicas": 3,
                "selector": {"matchLabels": {"app": app}},
                "template": {
                    "metadata": {"labels": {"app": app}},
                    "spec": {
                        "imagePullSecrets": [{"name": "existing"}],
                        "containers": [{
                            "name": "main",
                            "image": "busybox",
                            "readinessProbe": {"httpGet": {"path": "/", "port": 80}},
                        }],
                    },
                },
            }),
        )
    }

    fn provider() -> ProviderConfig {
        ProviderConfig {
            image_pull_secrets: vec![SecretRef {
                name: "regcred".into(),
                namespace: None,
            }],
            ..Default::default()
        }
    }

    fn sync_spec(target: Option<TargetSpec>) -> SyncSpec {
        let mut path = SyncPathSpec::new(".", "/app");
        path.target = target;
        SyncSpec {
            paths: vec![path],
            overrides: Vec::new(),
        }
    }

    #[test]
    fn test_sync_rewrite_is_additive() {
        let manifests = vec![deployment("api", "api"), Manifest::new("v1", "Service", "api")];
        let result = configure_sync_mode(
            "api",
            manifests,
            &sync_spec(Some(TargetSpec::workload("Deployment", "api"))),
            None,
            &provider(),
        )
        .unwrap();
        assert_eq!(result.updated, vec!["Deployment/api"]);

        let m = &result.manifests[0];
        assert_eq!(m.annotation(MODE), Some("sync"));
        let pod = m.pod_spec().unwrap();
        assert_eq!(pod["volumes"][0]["name"], SYNC_VOLUME_NAME);
        assert_eq!(pod["initContainers"][0]["name"], SYNC_INIT_CONTAINER_NAME);
        assert_eq!(pod["containers"][0]["volumeMounts"][0]["mountPath"], "/.garden");
        assert_eq!(pod["containers"][0]["image"], "busybox");
        let secrets: Vec<&str> = pod["imagePullSecrets"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        assert_eq!(secrets, vec!["existing", "regcred"]);
        assert_eq!(
            m.get_path(&["spec", "template", "metadata", "annotations", MODE]),
            Some(&json!("sync"))
        );
        assert_eq!(result.manifests[1], Manifest::new("v1", "Service", "api"));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let spec = sync_spec(Some(TargetSpec::workload("Deployment", "api")));
        let once = configure_sync_mode("api", vec![deployment("api", "api")], &spec, None, &provider())
            .unwrap();
        let twice =
            configure_sync_mode("api", once.manifests.clone(), &spec, None, &provider()).unwrap();
        assert_eq!(once.manifests, twice.manifests);
    }

    #[test]
    fn test_default_target_and_missing_target() {
        let default = TargetSpec::workload("Deployment", "api");
        let result = configure_sync_mode(
            "api",
            vec![deployment("api", "api")],
            &sync_spec(None),
            Some(&default),
            &provider(),
        )
        .unwrap();
        assert_eq!(result.updated.len(), 1);

        let err = configure_sync_mode(
            "my-action",
            vec![deployment("api", "api")],
            &sync_spec(None),
            None,
            &provider(),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("my-action"));
        assert!(msg.contains("must specify a target"));
    }

    #[test]
    fn test_pod_selector_matches_all_workloads() {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "web".to_string());
        let manifests = vec![
            deployment("a", "web"),
            deployment("b", "web"),
            deployment("c", "other"),
        ];
        let result = configure_sync_mode(
            "web",
            manifests,
            &sync_spec(Some(TargetSpec::selector(selector))),
            None,
            &provider(),
        )
        .unwrap();
        assert_eq!(result.updated, vec!["Deployment/a", "Deployment/b"]);
        assert!(result.manifests[2].annotation(MODE).is_none());
    }

    #[test]
    fn test_unknown_target_is_config_error() {
        let err = configure_sync_mode(
            "api",
            vec![deployment("api", "api")],
            &sync_spec(Some(TargetSpec::workload("Deployment", "nope"))),
            None,
            &provider(),
        )
        .unwrap_err();
        assert!(matches!(err, DeployError::Configuration { .. }));

        let err = configure_sync_mode(
            "api",
            vec![deployment("api", "api")],
            &sync_spec(Some(TargetSpec::workload("Service", "api"))),
            None,
            &provider(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_overrides() {
        let spec = SyncSpec {
            paths: Vec::new(),
            overrides: vec![SyncOverride {
                target: Some(TargetSpec::workload("Deployment", "api")),
                command: Some(vec!["npm".into(), "run".into(), "dev".into()]),
                args: None,
                image: Some("node:20".into()),
            }],
        };
        let result =
            configure_sync_mode("api", vec![deployment("api", "api")], &spec, None, &provider())
                .unwrap();
        let container = &result.manifests[0].pod_spec().unwrap()["containers"][0];
        assert_eq!(container["command"], json!(["npm", "run", "dev"]));
        assert_eq!(container["image"], "node:20");
    }

    #[test]
    fn test_local_mode() {
        let spec = LocalModeSpec {
            target: Some(TargetSpec::workload("Deployment", "api")),
            ports: Vec::new(),
            command: None,
        };
        let result =
            configure_local_mode("api", vec![deployment("api", "api")], &spec, None, &provider())
                .unwrap();
        let m = &result.manifests[0];
        assert_eq!(m.annotation(MODE), Some("local"));
        assert_eq!(m.get_path(&["spec", "replicas"]), Some(&json!(1)));
        assert!(m.pod_spec().unwrap()["containers"][0]
            .get("readinessProbe")
            .is_none());
    }
}
