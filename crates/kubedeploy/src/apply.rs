//! Applying an action's manifests to the cluster, and tearing them down.
//!
//! An apply runs under a per action+namespace lock: ensure the namespace,
//! apply every manifest (namespaces first), wait for workloads, then write the
//! metadata record. Without `atomic` the wait stops at the first unhealthy
//! workload. With `atomic` it runs to the timeout and then restores whatever
//! the apply replaced.

use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cluster::health::workload_pods;
use crate::cluster::{collect_diagnostics, failed_containers, workload_health, Diagnostics, Health};
use crate::config::{DeployAction, DeployMode, ProviderConfig};
use crate::context::DeployContext;
use crate::error::{DeployError, Result};
use crate::events::DeployEvent;
use crate::manifest::annotations::{is_preserved, LAST_DEPLOYED, MANIFEST_HASH};
use crate::manifest::{annotate_hash, get_manifests, Manifest, ResourceRef};
use crate::metadata;
use crate::status::{status_of, DeployState};
use crate::sync::configure::{configure_local_mode, configure_sync_mode};

/// Kinds whose readiness an apply waits for.
const WATCHED_KINDS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet", "ReplicaSet", "Job", "Pod"];

/// Resolves the desired manifests of an action, ready to compare or apply.
///
/// Namespaced manifests without a namespace get the action's, the sync or
/// local mode rewrite runs when the action is deployed in that mode, and every
/// manifest is stamped with its content hash.
pub async fn prepare_manifests(
    ctx: &DeployContext,
    action: &DeployAction,
    read_from_src_dir: bool,
) -> Result<Vec<Manifest>> {
    let namespace = action.namespace(&ctx.provider);
    let mut manifests = get_manifests(action, &ctx.provider, &ctx.locks, read_from_src_dir).await?;

    for manifest in &mut manifests {
        if manifest.is_namespaced() && manifest.metadata.namespace.is_none() {
            manifest.metadata.namespace = Some(namespace.clone());
        }
    }

    let default_target = action.spec.default_target.as_ref();
    let mut manifests = match (action.effective_mode(), &action.spec.sync, &action.spec.local_mode) {
        (DeployMode::Sync, Some(spec), _) => {
            let configured =
                configure_sync_mode(&action.name, manifests, spec, default_target, &ctx.provider)?;
            debug!("Configured sync mode on {:?}", configured.updated);
            configured.manifests
        }
        (DeployMode::Local, _, Some(spec)) => {
            let configured =
                configure_local_mode(&action.name, manifests, spec, default_target, &ctx.provider)?;
            debug!("Configured local mode on {:?}", configured.updated);
            configured.manifests
        }
        _ => manifests,
    };

    for manifest in &mut manifests {
        annotate_hash(manifest)?;
    }
    Ok(manifests)
}

/// How an apply behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Apply even if the deploy is already ready.
    pub force: bool,
    /// Roll back on failure, after waiting the full timeout.
    pub atomic: bool,
    /// Wait for workloads to become ready.
    pub wait: bool,
    pub timeout: Duration,
}

impl ApplyOptions {
    pub fn from_action(action: &DeployAction, provider: &ProviderConfig) -> Self {
        Self {
            force: false,
            atomic: action.spec.atomic,
            wait: action.spec.wait || action.spec.atomic,
            timeout: action.timeout(provider),
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    /// Keys of manifests whose live object was created or changed.
    pub updated_manifests: Vec<String>,
    /// Objects as stored by the cluster, or the desired manifests for a no-op.
    pub applied_manifests: Vec<Manifest>,
    pub state: DeployState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    /// Keys of the objects that existed and were deleted.
    pub deleted: Vec<String>,
    pub metadata_deleted: bool,
}

/// What an object looked like before this apply touched it.
struct JournalEntry {
    resource: ResourceRef,
    previous: Option<Manifest>,
}

fn lock_key(namespace: &str, action: &str) -> String {
    format!("deploy:{}/{}", namespace, action)
}

fn apply_order(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        _ => 2,
    }
}

/// Applies prepared manifests for an action and records the deploy.
pub async fn apply(
    ctx: &DeployContext,
    action: &DeployAction,
    manifests: Vec<Manifest>,
    options: &ApplyOptions,
) -> Result<ApplyResult> {
    let identity = action.identity(&ctx.provider);
    let namespace = identity.namespace.clone();
    let span = info_span!("apply", action = %action.name, namespace = %namespace, mode = %identity.mode);

    async move {
        let _guard = ctx.locks.lock(&lock_key(&namespace, &action.name)).await;

        if !options.force {
            let status = status_of(ctx, action, &manifests).await?;
            if status.state.is_ready() {
                info!("{} is already up to date", action.name);
                return Ok(ApplyResult {
                    updated_manifests: Vec::new(),
                    applied_manifests: manifests,
                    state: DeployState::Ready,
                });
            }
        }

        ensure_namespace(ctx, &namespace).await?;

        let mut ordered = manifests.clone();
        ordered.sort_by_key(|m| apply_order(&m.kind));

        let mut journal = Vec::new();
        let outcome = match apply_all(ctx, action, &namespace, &ordered, &mut journal).await {
            Ok((updated, applied)) if options.wait => {
                wait_for_workloads(ctx, action, &namespace, &applied, options)
                    .await
                    .map(|_| (updated, applied))
            }
            other => other,
        };

        let (updated_manifests, applied_manifests) = match outcome {
            Ok(result) => result,
            Err(e) if options.atomic => {
                rollback(ctx, &journal).await;
                ctx.events
                    .send(DeployEvent::deploy_status(&action.name, DeployState::NotReady.as_str()));
                return Err(atomic_failure(&action.name, e));
            }
            Err(e) => {
                ctx.events
                    .send(DeployEvent::deploy_status(&action.name, DeployState::NotReady.as_str()));
                return Err(e);
            }
        };

        let record = metadata::get_metadata_manifest(&identity, &ctx.provider.project_name, &manifests)?;
        metadata::write(ctx.cluster(), &record).await?;

        info!(
            updated = updated_manifests.len(),
            "Deployed {} ({} manifests)",
            action.name,
            applied_manifests.len()
        );
        ctx.events
            .send(DeployEvent::deploy_status(&action.name, DeployState::Ready.as_str()));

        Ok(ApplyResult {
            updated_manifests,
            applied_manifests,
            state: DeployState::Ready,
        })
    }
    .instrument(span)
    .await
}

async fn apply_all(
    ctx: &DeployContext,
    action: &DeployAction,
    namespace: &str,
    manifests: &[Manifest],
    journal: &mut Vec<JournalEntry>,
) -> Result<(Vec<String>, Vec<Manifest>)> {
    let mut updated = Vec::new();
    let mut applied = Vec::with_capacity(manifests.len());

    for manifest in manifests {
        let resource = manifest.resource_ref(namespace);
        let previous = ctx.cluster.get(&resource).await?;

        let mut desired = manifest.clone();
        if let Some(live) = &previous {
            for (key, value) in &live.metadata.annotations {
                if is_preserved(key) {
                    desired
                        .metadata
                        .annotations
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
        }

        let changed = previous
            .as_ref()
            .and_then(|live| live.annotation(MANIFEST_HASH))
            != desired.annotation(MANIFEST_HASH);

        journal.push(JournalEntry {
            resource: resource.clone(),
            previous,
        });
        let stored = ctx.cluster.apply(&desired).await?;
        debug!("Applied {}", resource);

        ctx.events
            .send(DeployEvent::resource_applied(&action.name, &manifest.key()));
        if changed {
            updated.push(manifest.key());
        }
        applied.push(stored);
    }

    Ok((updated, applied))
}

/// Creates the namespace, or refreshes its last-deployed annotation.
///
/// Returns whether the namespace was created.
pub async fn ensure_namespace(ctx: &DeployContext, namespace: &str) -> Result<bool> {
    let resource = ResourceRef::new("v1", "Namespace", None, namespace);
    let (mut manifest, created) = match ctx.cluster.get(&resource).await? {
        Some(live) => (live.without_server_fields(), false),
        None => (Manifest::new("v1", "Namespace", namespace), true),
    };
    manifest.set_annotation(
        LAST_DEPLOYED,
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    ctx.cluster.apply(&manifest).await?;

    if created {
        info!("Created namespace {}", namespace);
    }
    ctx.events.send(DeployEvent::namespace_status(namespace, "ready"));
    Ok(created)
}

/// Progress of one workload during the wait.
enum Progress {
    Ready,
    Waiting(String),
    Failed { live: Manifest, reason: String },
}

/// The first workload holding up the wait.
enum Blocked {
    Failed(Manifest, String),
    Pending(ResourceRef, String),
}

async fn check_workload(ctx: &DeployContext, namespace: &str, resource: &ResourceRef) -> Result<Progress> {
    let Some(live) = ctx.cluster.get(resource).await? else {
        return Ok(Progress::Waiting(format!("{} does not exist yet", resource)));
    };

    let waiting = match workload_health(&live) {
        Health::Unhealthy(reason) => return Ok(Progress::Failed { live, reason }),
        Health::Pending(reason) => Some(reason),
        Health::Ready => None,
    };

    if live.kind != "Pod" {
        let pods = workload_pods(ctx.cluster(), namespace, &live).await?;
        if let Some(failed) = pods.iter().flat_map(failed_containers).next() {
            let reason = format!(
                "container {} in Pod {} is {}",
                failed.container, failed.pod, failed.reason
            );
            return Ok(Progress::Failed { live, reason });
        }
    }

    Ok(match waiting {
        Some(reason) => Progress::Waiting(reason),
        None => Progress::Ready,
    })
}

async fn diagnostics_for(ctx: &DeployContext, namespace: &str, live: &Manifest) -> Diagnostics {
    match collect_diagnostics(ctx.cluster(), namespace, live).await {
        Ok(diagnostics) => diagnostics,
        Err(e) => {
            warn!("Unable to collect diagnostics for {}: {}", live.key(), e);
            Diagnostics::default()
        }
    }
}

/// Polls applied workloads until all are ready.
///
/// Fails at the first unhealthy workload unless `atomic` is set, in which case
/// it keeps polling until the timeout.
async fn wait_for_workloads(
    ctx: &DeployContext,
    action: &DeployAction,
    namespace: &str,
    applied: &[Manifest],
    options: &ApplyOptions,
) -> Result<()> {
    let watched: Vec<ResourceRef> = applied
        .iter()
        .filter(|m| WATCHED_KINDS.contains(&m.kind.as_str()))
        .map(|m| m.resource_ref(namespace))
        .collect();
    if watched.is_empty() {
        return Ok(());
    }

    let deadline = Instant::now() + options.timeout;
    let poll_interval = ctx.provider.status_poll_interval();

    loop {
        let mut pending: Option<Blocked> = None;
        let mut failure: Option<Blocked> = None;

        for resource in &watched {
            match check_workload(ctx, namespace, resource).await? {
                Progress::Ready => {}
                Progress::Waiting(reason) => {
                    pending.get_or_insert(Blocked::Pending(resource.clone(), reason));
                }
                Progress::Failed { live, reason } => {
                    if !options.atomic {
                        let diagnostics = diagnostics_for(ctx, namespace, &live).await;
                        return Err(DeployError::Deployment {
                            action: action.name.clone(),
                            resource: live.key(),
                            message: format!("{} is unhealthy: {}", live.key(), reason),
                            diagnostics: diagnostics.to_string(),
                        });
                    }
                    failure.get_or_insert(Blocked::Failed(live, reason));
                }
            }
        }

        let Some(blocked) = failure.or(pending) else {
            return Ok(());
        };

        let now = Instant::now();
        if now >= deadline {
            let seconds = options.timeout.as_secs();
            return Err(match blocked {
                Blocked::Failed(live, reason) => {
                    let diagnostics = diagnostics_for(ctx, namespace, &live).await;
                    DeployError::Deployment {
                        action: action.name.clone(),
                        resource: live.key(),
                        message: format!(
                            "timed out after {}s waiting for {}: {}",
                            seconds,
                            live.key(),
                            reason
                        ),
                        diagnostics: diagnostics.to_string(),
                    }
                }
                Blocked::Pending(resource, reason) => DeployError::Timeout {
                    operation: format!(
                        "Deploy of {} (waiting for {}: {})",
                        action.name, resource, reason
                    ),
                    seconds,
                },
            });
        }

        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

/// Puts back every object the apply replaced and deletes the ones it created.
async fn rollback(ctx: &DeployContext, journal: &[JournalEntry]) {
    for entry in journal.iter().rev() {
        let result = match &entry.previous {
            Some(previous) => ctx
                .cluster
                .apply(&previous.without_server_fields())
                .await
                .map(|_| ()),
            None => ctx.cluster.delete(&entry.resource).await.map(|_| ()),
        };
        match result {
            Ok(()) => debug!("Rolled back {}", entry.resource),
            Err(e) => warn!("Failed to roll back {}: {}", entry.resource, e),
        }
    }
}

fn atomic_failure(action: &str, error: DeployError) -> DeployError {
    let prefix = format!(
        "Release {} failed, and has been uninstalled due to atomic being set",
        action
    );
    match error {
        DeployError::Deployment {
            action,
            resource,
            message,
            diagnostics,
        } => DeployError::Deployment {
            action,
            resource,
            message: format!("{}: {}", prefix, message),
            diagnostics,
        },
        other => DeployError::Deployment {
            action: action.to_string(),
            resource: String::new(),
            message: format!("{}: {}", prefix, other),
            diagnostics: String::new(),
        },
    }
}

/// Deletes the manifests an action currently declares, then its metadata record.
///
/// Objects that are already gone are skipped. Namespaces go last, and only if
/// declared.
pub async fn delete(ctx: &DeployContext, action: &DeployAction) -> Result<DeleteResult> {
    let namespace = action.namespace(&ctx.provider);
    let span = info_span!("delete", action = %action.name, namespace = %namespace);

    async move {
        let _guard = ctx.locks.lock(&lock_key(&namespace, &action.name)).await;

        let mut manifests = get_manifests(action, &ctx.provider, &ctx.locks, false).await?;
        manifests.reverse();
        manifests.sort_by_key(|m| std::cmp::Reverse(apply_order(&m.kind)));

        let mut result = DeleteResult::default();
        for manifest in &manifests {
            let resource = manifest.resource_ref(&namespace);
            let deleted = match ctx.cluster.delete(&resource).await {
                Ok(deleted) => deleted,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            if deleted {
                debug!("Deleted {}", resource);
                result.deleted.push(manifest.key());
            }
        }

        result.metadata_deleted = metadata::delete(ctx.cluster(), &action.name, &namespace).await?;
        info!("Deleted {} ({} objects)", action.name, result.deleted.len());
        ctx.events
            .send(DeployEvent::deploy_status(&action.name, DeployState::Missing.as_str()));
        Ok(result)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterApi, ClusterEvent, InMemoryCluster};
    use crate::config::KubernetesDeploySpec;
    use crate::manifest::annotations::AEC_STATUS;
    use serde_json::json;
    use std::sync::Arc;

    fn provider() -> ProviderConfig {
        ProviderConfig {
            status_poll_interval_ms: 10,
            ..Default::default()
        }
    }

    fn deployment(name: &str) -> Manifest {
        Manifest::new("apps/v1", "Deployment", name).with_field(
            "spec",
            json!({
                "replicas": 1,
                "selector": {"matchLabels": {"app": name}},
                "template": {
                    "metadata": {"labels": {"app": name}},
                    "spec": {"containers": [{"name": "main", "image": "busybox"}]},
                },
            }),
        )
    }

    fn action(manifests: Vec<Manifest>) -> DeployAction {
        let spec = KubernetesDeploySpec {
            manifests,
            ..Default::default()
        };
        DeployAction::new("api", "/tmp", spec).unwrap()
    }

    fn setup(cluster: &Arc<InMemoryCluster>) -> DeployContext {
        DeployContext::new(provider(), cluster.clone())
    }

    #[tokio::test]
    async fn test_prepare_sets_namespace_and_hash() {
        let cluster = Arc::new(InMemoryCluster::new());
        let ctx = setup(&cluster);
        let manifests = prepare_manifests(&ctx, &action(vec![deployment("api")]), false)
            .await
            .unwrap();
        assert_eq!(manifests[0].metadata.namespace.as_deref(), Some("default"));
        assert!(manifests[0].annotation(MANIFEST_HASH).is_some());
    }

    #[tokio::test]
    async fn test_second_apply_is_noop() {
        let cluster = Arc::new(InMemoryCluster::new());
        let ctx = setup(&cluster);
        let action = action(vec![deployment("api")]);
        let options = ApplyOptions::from_action(&action, &ctx.provider);

        let manifests = prepare_manifests(&ctx, &action, false).await.unwrap();
        let first = apply(&ctx, &action, manifests.clone(), &options).await.unwrap();
        assert_eq!(first.updated_manifests, vec!["Deployment/api"]);

        let applies = cluster.apply_count();
        let second = apply(&ctx, &action, manifests.clone(), &options).await.unwrap();
        assert!(second.updated_manifests.is_empty());
        assert_eq!(cluster.apply_count(), applies);

        let forced = apply(&ctx, &action, manifests, &options.clone().with_force(true))
            .await
            .unwrap();
        assert!(forced.updated_manifests.is_empty());
        assert!(cluster.apply_count() > applies);
    }

    #[tokio::test]
    async fn test_preserves_cleanup_annotations() {
        let cluster = Arc::new(InMemoryCluster::new());
        let ctx = setup(&cluster);
        let action = action(vec![Manifest::new("v1", "ConfigMap", "cfg")]);
        let options = ApplyOptions::from_action(&action, &ctx.provider).with_force(true);
        let manifests = prepare_manifests(&ctx, &action, false).await.unwrap();
        apply(&ctx, &action, manifests.clone(), &options).await.unwrap();

        let cfg = ResourceRef::new("v1", "ConfigMap", Some("default"), "cfg");
        let ns = ResourceRef::new("v1", "Namespace", None, "default");
        cluster.set_annotation(&cfg, AEC_STATUS, "paused");
        cluster.set_annotation(&ns, AEC_STATUS, "paused");

        apply(&ctx, &action, manifests, &options).await.unwrap();
        assert_eq!(cluster.object(&cfg).unwrap().annotation(AEC_STATUS), Some("paused"));
        let namespace = cluster.object(&ns).unwrap();
        assert_eq!(namespace.annotation(AEC_STATUS), Some("paused"));
        assert!(namespace.annotation(LAST_DEPLOYED).is_some());
    }

    #[tokio::test]
    async fn test_ensure_namespace_creates() {
        let cluster = Arc::new(InMemoryCluster::new());
        let ctx = setup(&cluster);
        assert!(ensure_namespace(&ctx, "dev").await.unwrap());
        assert!(!ensure_namespace(&ctx, "dev").await.unwrap());
        let ns = cluster
            .object(&ResourceRef::new("v1", "Namespace", None, "dev"))
            .unwrap();
        assert!(ns.annotation(LAST_DEPLOYED).is_some());
    }

    fn crash_looping(cluster: &InMemoryCluster) {
        cluster.script_status(
            "Deployment",
            "api",
            json!({"observedGeneration": 1, "replicas": 1, "updatedReplicas": 1, "availableReplicas": 0}),
        );
        let pod = Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "api-5d8f", "namespace": "default", "labels": {"app": "api"}},
            "status": {"containerStatuses": [
                {"name": "main", "state": {"waiting": {"reason": "CrashLoopBackOff"}}},
            ]},
        }))
        .unwrap();
        cluster.insert(pod);
        cluster.add_event(
            "default",
            ClusterEvent::warning("Pod", "api-5d8f", "BackOff", "Back-off restarting failed container"),
        );
        cluster.set_logs("default", "api-5d8f", "main", "boom");
    }

    #[tokio::test]
    async fn test_fail_fast_attaches_diagnostics() {
        let cluster = Arc::new(InMemoryCluster::new().without_rollouts());
        crash_looping(&cluster);
        let ctx = setup(&cluster);
        let action = action(vec![deployment("api")]);
        let mut options = ApplyOptions::from_action(&action, &ctx.provider);
        options.timeout = Duration::from_secs(30);

        let manifests = prepare_manifests(&ctx, &action, false).await.unwrap();
        let started = Instant::now();
        let err = apply(&ctx, &action, manifests, &options).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));

        let message = err.to_string();
        assert!(message.contains("BackOff"), "{message}");
        assert!(message.contains("boom"), "{message}");
        assert!(metadata::read(ctx.cluster(), "api", "default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_atomic_rolls_back() {
        let cluster = Arc::new(InMemoryCluster::new().without_rollouts());
        crash_looping(&cluster);
        let ctx = setup(&cluster);
        let mut action = action(vec![deployment("api"), Manifest::new("v1", "ConfigMap", "cfg")]);
        action.spec.atomic = true;
        let mut options = ApplyOptions::from_action(&action, &ctx.provider);
        options.timeout = Duration::from_millis(200);

        let manifests = prepare_manifests(&ctx, &action, false).await.unwrap();
        let started = Instant::now();
        let err = apply(&ctx, &action, manifests, &options).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(err.to_string().contains("due to atomic being set"));

        assert!(!cluster.contains("Deployment", Some("default"), "api"));
        assert!(!cluster.contains("ConfigMap", Some("default"), "cfg"));
    }

    #[tokio::test]
    async fn test_delete_only_declared() {
        let cluster = Arc::new(InMemoryCluster::new());
        let ctx = setup(&cluster);
        let mut unrelated = Manifest::new("v1", "ConfigMap", "other");
        unrelated.metadata.namespace = Some("default".into());
        cluster.apply(&unrelated).await.unwrap();

        let action = action(vec![Manifest::new("v1", "ConfigMap", "cfg")]);
        let options = ApplyOptions::from_action(&action, &ctx.provider);
        let manifests = prepare_manifests(&ctx, &action, false).await.unwrap();
        apply(&ctx, &action, manifests, &options).await.unwrap();

        let result = delete(&ctx, &action).await.unwrap();
        assert_eq!(result.deleted, vec!["ConfigMap/cfg"]);
        assert!(result.metadata_deleted);
        assert!(cluster.contains("ConfigMap", Some("default"), "other"));
        assert!(cluster.contains("Namespace", None, "default"));

        let again = delete(&ctx, &action).await.unwrap();
        assert!(again.deleted.is_empty());
        assert!(!again.metadata_deleted);
    }
}
