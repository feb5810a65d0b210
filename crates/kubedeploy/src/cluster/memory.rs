//! An in-memory [`ClusterApi`].
//!
//! Behaves like a small API server: server-owned metadata and `status`
//! survive re-applies, `metadata.generation` only moves when content changes,
//! deleting a namespace deletes everything in it, and namespaced objects can
//! only be created in namespaces that exist. Workload rollouts complete
//! instantly unless disabled or scripted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ClusterApi, ClusterEvent};
use crate::error::{DeployError, Result};
use crate::manifest::resource::labels_match;
use crate::manifest::{Manifest, ResourceRef};

/// Kinds served out of the box.
const BUILTIN_KINDS: &[&str] = &[
    "ConfigMap",
    "CronJob",
    "DaemonSet",
    "Deployment",
    "Ingress",
    "Job",
    "Namespace",
    "PersistentVolumeClaim",
    "Pod",
    "ReplicaSet",
    "Role",
    "RoleBinding",
    "Secret",
    "Service",
    "ServiceAccount",
    "StatefulSet",
];

type ObjectKey = (String, Option<String>, String);

fn object_key(resource: &ResourceRef) -> ObjectKey {
    (
        resource.kind.clone(),
        resource.namespace.clone(),
        resource.name.clone(),
    )
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Manifest>,
    kinds: HashSet<String>,
    scripted_status: HashMap<(String, String), Value>,
    events: HashMap<String, Vec<ClusterEvent>>,
    logs: HashMap<(String, String, String), String>,
    transient_failures: usize,
    rollout: bool,
    next_uid: u64,
}

/// A cluster kept in process memory.
pub struct InMemoryCluster {
    state: Mutex<State>,
    applies: AtomicUsize,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// An empty cluster with the `default` namespace and instant rollouts.
    pub fn new() -> Self {
        let mut state = State {
            kinds: BUILTIN_KINDS.iter().map(|k| k.to_string()).collect(),
            rollout: true,
            ..Default::default()
        };
        let namespace = Manifest::new("v1", "Namespace", "default");
        state.objects.insert(
            ("Namespace".to_string(), None, "default".to_string()),
            namespace,
        );
        Self {
            state: Mutex::new(state),
            applies: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Disables instant rollouts. Workloads then stay pending unless scripted.
    pub fn without_rollouts(self) -> Self {
        self.state().rollout = false;
        self
    }

    /// Serves an additional kind, e.g. a custom resource.
    pub fn register_kind(&self, kind: impl Into<String>) {
        self.state().kinds.insert(kind.into());
    }

    /// Status to set on `kind/name` whenever it is applied, instead of a rollout.
    pub fn script_status(&self, kind: &str, name: &str, status: Value) {
        self.state()
            .scripted_status
            .insert((kind.to_string(), name.to_string()), status);
    }

    pub fn add_event(&self, namespace: &str, event: ClusterEvent) {
        self.state()
            .events
            .entry(namespace.to_string())
            .or_default()
            .push(event);
    }

    pub fn set_logs(&self, namespace: &str, pod: &str, container: &str, logs: impl Into<String>) {
        self.state().logs.insert(
            (namespace.to_string(), pod.to_string(), container.to_string()),
            logs.into(),
        );
    }

    /// Makes the next `count` reads fail with a transient API error.
    pub fn fail_next_reads(&self, count: usize) {
        self.state().transient_failures = count;
    }

    /// Stores an object as-is, bypassing apply semantics.
    pub fn insert(&self, manifest: Manifest) {
        let key = object_key(&manifest.resource_ref("default"));
        self.state().objects.insert(key, manifest);
    }

    /// Replaces an annotation on a stored object.
    pub fn set_annotation(&self, resource: &ResourceRef, key: &str, value: &str) -> bool {
        match self.state().objects.get_mut(&object_key(resource)) {
            Some(object) => {
                object.set_annotation(key, value);
                true
            }
            None => false,
        }
    }

    /// Replaces a `data` entry on a stored object.
    pub fn set_data(&self, resource: &ResourceRef, key: &str, value: &str) -> bool {
        let mut state = self.state();
        let Some(object) = state.objects.get_mut(&object_key(resource)) else {
            return false;
        };
        let data = object
            .body
            .entry("data")
            .or_insert_with(|| Value::Object(Default::default()));
        match data.as_object_mut() {
            Some(map) => {
                map.insert(key.to_string(), Value::String(value.to_string()));
                true
            }
            None => false,
        }
    }

    /// Snapshot of a stored object.
    pub fn object(&self, resource: &ResourceRef) -> Option<Manifest> {
        self.state().objects.get(&object_key(resource)).cloned()
    }

    pub fn contains(&self, kind: &str, namespace: Option<&str>, name: &str) -> bool {
        let key = (
            kind.to_string(),
            namespace.map(str::to_string),
            name.to_string(),
        );
        self.state().objects.contains_key(&key)
    }

    /// Number of `apply` calls made so far.
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn check_read(state: &mut State) -> Result<()> {
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(DeployError::Api {
                message: "Unable to connect to the server: i/o timeout".to_string(),
                transient: true,
            });
        }
        Ok(())
    }

    fn check_kind(state: &State, api_version: &str, kind: &str) -> Result<()> {
        if state.kinds.contains(kind) {
            Ok(())
        } else {
            Err(DeployError::UnknownKind {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            })
        }
    }
}

/// The status a controller would report once a workload has rolled out.
fn rolled_out_status(manifest: &Manifest, generation: i64) -> Option<Value> {
    let replicas = manifest
        .get_path(&["spec", "replicas"])
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let status = match manifest.kind.as_str() {
        "Deployment" => json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "updatedReplicas": replicas,
            "readyReplicas": replicas,
            "availableReplicas": replicas,
            "conditions": [{"type": "Available", "status": "True"}],
        }),
        "StatefulSet" => json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "readyReplicas": replicas,
            "currentReplicas": replicas,
            "updatedReplicas": replicas,
            "currentRevision": format!("{}-{}", manifest.name(), generation),
            "updateRevision": format!("{}-{}", manifest.name(), generation),
        }),
        "DaemonSet" => json!({
            "observedGeneration": generation,
            "desiredNumberScheduled": 1,
            "numberReady": 1,
            "updatedNumberScheduled": 1,
            "numberAvailable": 1,
        }),
        "ReplicaSet" => json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "readyReplicas": replicas,
        }),
        "Job" => json!({
            "succeeded": 1,
            "conditions": [{"type": "Complete", "status": "True"}],
        }),
        "Pod" => json!({
            "phase": "Running",
            "conditions": [{"type": "Ready", "status": "True"}],
        }),
        _ => return None,
    };
    Some(status)
}

/// Content the generation counter tracks: everything but metadata and status.
fn content_of(manifest: &Manifest) -> Value {
    let mut body = manifest.body.clone();
    body.remove("status");
    Value::Object(body)
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get(&self, resource: &ResourceRef) -> Result<Option<Manifest>> {
        let mut state = self.state();
        Self::check_read(&mut state)?;
        Self::check_kind(&state, &resource.api_version, &resource.kind)?;
        Ok(state.objects.get(&object_key(resource)).cloned())
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Manifest>> {
        let mut state = self.state();
        Self::check_read(&mut state)?;
        Self::check_kind(&state, api_version, kind)?;
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| k == kind && (namespace.is_none() || ns.as_deref() == namespace))
            .filter(|(_, m)| selector.is_empty() || labels_match(selector, &m.metadata.labels))
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn apply(&self, manifest: &Manifest) -> Result<Manifest> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        Self::check_kind(&state, &manifest.api_version, &manifest.kind)?;

        let resource = manifest.resource_ref("default");
        if let Some(namespace) = &resource.namespace {
            let ns_key = ("Namespace".to_string(), None, namespace.clone());
            if !state.objects.contains_key(&ns_key) {
                return Err(DeployError::NotFound(format!(
                    "namespaces \"{}\" not found",
                    namespace
                )));
            }
        }

        let key = object_key(&resource);
        let existing = state.objects.get(&key).cloned();

        let mut stored = manifest.clone();
        stored.metadata.namespace = resource.namespace.clone();
        stored.body.remove("status");

        let generation = match &existing {
            Some(previous) => {
                let previous_generation = previous
                    .metadata
                    .extra
                    .get("generation")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                if content_of(previous) == content_of(&stored) {
                    previous_generation
                } else {
                    previous_generation + 1
                }
            }
            None => 1,
        };

        let uid = match existing
            .as_ref()
            .and_then(|p| p.metadata.extra.get("uid").cloned())
        {
            Some(uid) => uid,
            None => {
                state.next_uid += 1;
                Value::String(format!("uid-{}", state.next_uid))
            }
        };
        stored.metadata.extra.insert("uid".to_string(), uid);
        stored
            .metadata
            .extra
            .insert("generation".to_string(), json!(generation));

        let scripted = state
            .scripted_status
            .get(&(manifest.kind.clone(), manifest.name().to_string()))
            .cloned();
        let status = match scripted {
            Some(status) => Some(status),
            None if state.rollout => rolled_out_status(&stored, generation),
            None => existing.as_ref().and_then(|p| p.status().cloned()),
        };
        if let Some(status) = status {
            stored.body.insert("status".to_string(), status);
        }

        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<bool> {
        let mut state = self.state();
        Self::check_kind(&state, &resource.api_version, &resource.kind)?;
        let removed = state.objects.remove(&object_key(resource)).is_some();
        if removed && resource.kind == "Namespace" {
            let namespace = Some(resource.name.clone());
            state.objects.retain(|(_, ns, _), _| *ns != namespace);
        }
        Ok(removed)
    }

    async fn events(&self, namespace: &str) -> Result<Vec<ClusterEvent>> {
        let mut state = self.state();
        Self::check_read(&mut state)?;
        Ok(state.events.get(namespace).cloned().unwrap_or_default())
    }

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail: usize,
    ) -> Result<String> {
        let state = self.state();
        let logs = state
            .logs
            .get(&(namespace.to_string(), pod.to_string(), container.to_string()))
            .ok_or_else(|| {
                DeployError::NotFound(format!("container {} in pod {}", container, pod))
            })?;
        let lines: Vec<&str> = logs.lines().collect();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines[skip..].join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Manifest {
        Manifest::new("apps/v1", "Deployment", "api").with_field(
            "spec",
            json!({"replicas": 2, "template": {"spec": {"containers": [{"name": "api"}]}}}),
        )
    }

    #[tokio::test]
    async fn test_apply_then_get() {
        let cluster = InMemoryCluster::new();
        let stored = cluster.apply(&deployment()).await.unwrap();
        assert_eq!(stored.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(stored.status().unwrap()["readyReplicas"], 2);

        let fetched = cluster
            .get(&deployment().resource_ref("default"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, stored);
    }

    #[tokio::test]
    async fn test_generation_moves_only_on_change() {
        let cluster = InMemoryCluster::new();
        let first = cluster.apply(&deployment()).await.unwrap();
        let second = cluster.apply(&deployment()).await.unwrap();
        assert_eq!(first.metadata.extra["generation"], second.metadata.extra["generation"]);
        assert_eq!(first.metadata.extra["uid"], second.metadata.extra["uid"]);

        let changed = deployment().with_field("spec", json!({"replicas": 3}));
        let third = cluster.apply(&changed).await.unwrap();
        assert_eq!(third.metadata.extra["generation"], 2);
        assert_eq!(cluster.apply_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let cluster = InMemoryCluster::new();
        let crd = ResourceRef::new("example.com/v1", "Widget", Some("default"), "w");
        assert!(matches!(
            cluster.get(&crd).await,
            Err(DeployError::UnknownKind { .. })
        ));
        cluster.register_kind("Widget");
        assert!(cluster.get(&crd).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_namespace_must_exist_and_cascades() {
        let cluster = InMemoryCluster::new();
        let mut cm = Manifest::new("v1", "ConfigMap", "cfg");
        cm.metadata.namespace = Some("ns-1".into());
        assert!(cluster.apply(&cm).await.unwrap_err().is_not_found());

        cluster
            .apply(&Manifest::new("v1", "Namespace", "ns-1"))
            .await
            .unwrap();
        cluster.apply(&cm).await.unwrap();
        assert!(cluster.contains("ConfigMap", Some("ns-1"), "cfg"));

        let ns = ResourceRef::new("v1", "Namespace", None, "ns-1");
        assert!(cluster.delete(&ns).await.unwrap());
        assert!(!cluster.contains("ConfigMap", Some("ns-1"), "cfg"));
        assert!(!cluster.delete(&ns).await.unwrap());
    }

    #[tokio::test]
    async fn test_transient_failures() {
        let cluster = InMemoryCluster::new();
        cluster.fail_next_reads(1);
        let err = cluster
            .list("v1", "ConfigMap", Some("default"), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        cluster
            .list("v1", "ConfigMap", Some("default"), &BTreeMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scripted_status_and_logs() {
        let cluster = InMemoryCluster::new().without_rollouts();
        cluster.script_status("Deployment", "api", json!({"replicas": 0}));
        let stored = cluster.apply(&deployment()).await.unwrap();
        assert_eq!(stored.status().unwrap()["replicas"], 0);

        cluster.set_logs("default", "api-1", "api", "a\nb\nc");
        assert_eq!(
            cluster.container_logs("default", "api-1", "api", 2).await.unwrap(),
            "b\nc"
        );
    }
}
