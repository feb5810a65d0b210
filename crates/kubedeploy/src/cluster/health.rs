//! Workload health and failure diagnostics.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::{ClusterApi, ClusterEvent};
use crate::error::Result;
use crate::manifest::Manifest;

/// Container waiting reasons that will not resolve on their own.
pub const UNHEALTHY_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "CreateContainerConfigError",
    "CreateContainerError",
    "InvalidImageName",
    "RunContainerError",
];

/// Lines of log output kept per failed container.
pub const LOG_TAIL_LINES: usize = 30;

/// Events attached to a failure.
pub const MAX_EVENTS: usize = 5;

/// Health of a live object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Ready,
    /// Still rolling out.
    Pending(String),
    /// Will not become ready without intervention.
    Unhealthy(String),
}

impl Health {
    pub fn is_ready(&self) -> bool {
        matches!(self, Health::Ready)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Health::Unhealthy(_))
    }
}

fn int_at(value: Option<&Value>, key: &str) -> Option<i64> {
    value?.get(key)?.as_i64()
}

fn conditions(status: Option<&Value>) -> Vec<&Value> {
    status
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .map(|c| c.iter().collect())
        .unwrap_or_default()
}

fn condition_is(condition: &Value, kind: &str, status: &str) -> bool {
    condition.get("type").and_then(Value::as_str) == Some(kind)
        && condition.get("status").and_then(Value::as_str) == Some(status)
}

fn generation_observed(manifest: &Manifest) -> bool {
    let generation = manifest.metadata.extra.get("generation").and_then(Value::as_i64);
    let observed = int_at(manifest.status(), "observedGeneration");
    match (generation, observed) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        _ => true,
    }
}

/// Classifies a live object's health from its `status`.
///
/// Kinds without a rollout notion are ready as soon as they exist.
pub fn workload_health(manifest: &Manifest) -> Health {
    let status = manifest.status();
    let desired = manifest
        .get_path(&["spec", "replicas"])
        .and_then(Value::as_i64)
        .unwrap_or(1);

    match manifest.kind.as_str() {
        "Deployment" => {
            if conditions(status).iter().any(|c| {
                c.get("reason").and_then(Value::as_str) == Some("ProgressDeadlineExceeded")
            }) {
                return Health::Unhealthy(format!(
                    "Deployment {} exceeded its progress deadline",
                    manifest.name()
                ));
            }
            if !generation_observed(manifest) {
                return Health::Pending("waiting for the rollout to be observed".to_string());
            }
            let updated = int_at(status, "updatedReplicas").unwrap_or(0);
            let available = int_at(status, "availableReplicas").unwrap_or(0);
            let total = int_at(status, "replicas").unwrap_or(0);
            if updated < desired {
                Health::Pending(format!("{} of {} replicas updated", updated, desired))
            } else if total > updated {
                Health::Pending(format!("{} old replicas pending termination", total - updated))
            } else if available < desired {
                Health::Pending(format!("{} of {} replicas available", available, desired))
            } else {
                Health::Ready
            }
        }
        "StatefulSet" => {
            if !generation_observed(manifest) {
                return Health::Pending("waiting for the rollout to be observed".to_string());
            }
            let ready = int_at(status, "readyReplicas").unwrap_or(0);
            let current = status.and_then(|s| s.get("currentRevision"));
            let update = status.and_then(|s| s.get("updateRevision"));
            if ready < desired {
                Health::Pending(format!("{} of {} replicas ready", ready, desired))
            } else if update.is_some() && current != update {
                Health::Pending("waiting for the update revision to roll out".to_string())
            } else {
                Health::Ready
            }
        }
        "DaemonSet" => {
            if !generation_observed(manifest) {
                return Health::Pending("waiting for the rollout to be observed".to_string());
            }
            let scheduled = int_at(status, "desiredNumberScheduled").unwrap_or(0);
            let ready = int_at(status, "numberReady").unwrap_or(0);
            let updated = int_at(status, "updatedNumberScheduled").unwrap_or(0);
            if ready < scheduled || updated < scheduled {
                Health::Pending(format!("{} of {} pods ready", ready, scheduled))
            } else {
                Health::Ready
            }
        }
        "ReplicaSet" => {
            let ready = int_at(status, "readyReplicas").unwrap_or(0);
            if ready < desired {
                Health::Pending(format!("{} of {} replicas ready", ready, desired))
            } else {
                Health::Ready
            }
        }
        "Job" => {
            if conditions(status).iter().any(|c| condition_is(c, "Failed", "True")) {
                return Health::Unhealthy(format!("Job {} failed", manifest.name()));
            }
            let completions = manifest
                .get_path(&["spec", "completions"])
                .and_then(Value::as_i64)
                .unwrap_or(1);
            let succeeded = int_at(status, "succeeded").unwrap_or(0);
            if succeeded >= completions {
                Health::Ready
            } else {
                Health::Pending(format!("{} of {} completions", succeeded, completions))
            }
        }
        "Pod" => pod_health(manifest),
        _ => Health::Ready,
    }
}

fn pod_health(pod: &Manifest) -> Health {
    if let Some(failed) = failed_containers(pod).into_iter().next() {
        return Health::Unhealthy(format!(
            "container {} in Pod {} is {}",
            failed.container, failed.pod, failed.reason
        ));
    }
    let status = pod.status();
    match status.and_then(|s| s.get("phase")).and_then(Value::as_str) {
        Some("Succeeded") => Health::Ready,
        Some("Failed") => Health::Unhealthy(format!("Pod {} failed", pod.name())),
        Some("Running")
            if conditions(status).iter().any(|c| condition_is(c, "Ready", "True")) =>
        {
            Health::Ready
        }
        Some(phase) => Health::Pending(format!("Pod {} is {}", pod.name(), phase)),
        None => Health::Pending(format!("Pod {} has no status yet", pod.name())),
    }
}

/// A container that is crash-looping or exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedContainer {
    pub pod: String,
    pub container: String,
    pub reason: String,
}

/// Containers of a pod that failed. Healthy siblings are not included.
pub fn failed_containers(pod: &Manifest) -> Vec<FailedContainer> {
    let statuses = pod
        .status()
        .and_then(|s| s.get("containerStatuses"))
        .and_then(Value::as_array);
    let Some(statuses) = statuses else {
        return Vec::new();
    };

    statuses
        .iter()
        .filter_map(|cs| {
            let name = cs.get("name").and_then(Value::as_str)?;
            let reason = container_failure(cs)?;
            Some(FailedContainer {
                pod: pod.name().to_string(),
                container: name.to_string(),
                reason,
            })
        })
        .collect()
}

fn container_failure(container_status: &Value) -> Option<String> {
    let state = container_status.get("state")?;

    let waiting = state
        .get("waiting")
        .and_then(|w| w.get("reason"))
        .and_then(Value::as_str);
    if let Some(reason) = waiting.filter(|r| UNHEALTHY_WAITING_REASONS.contains(r)) {
        return Some(reason.to_string());
    }

    let exit_code = state
        .get("terminated")
        .and_then(|t| t.get("exitCode"))
        .and_then(Value::as_i64)?;
    (exit_code != 0).then(|| format!("terminated with exit code {}", exit_code))
}

/// Events and failed-container logs attached to a deployment failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub events: Vec<ClusterEvent>,
    /// `(pod, container, log tail)` for failed containers only.
    pub logs: Vec<(String, String, String)>,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.logs.is_empty()
    }
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.events.is_empty() {
            write!(f, "\n\nLatest events:")?;
            for event in &self.events {
                write!(
                    f,
                    "\n  {} {}: {} {} - {}",
                    event.involved_kind,
                    event.involved_name,
                    event.event_type,
                    event.reason,
                    event.message
                )?;
            }
        }
        if !self.logs.is_empty() {
            write!(f, "\n\nLogs from failed containers:")?;
            for (pod, container, logs) in &self.logs {
                write!(f, "\n  {}/{}:", pod, container)?;
                for line in logs.lines() {
                    write!(f, "\n    {}", line)?;
                }
            }
        }
        Ok(())
    }
}

/// Pods belonging to a workload, by its selector.
pub async fn workload_pods(
    cluster: &dyn ClusterApi,
    namespace: &str,
    workload: &Manifest,
) -> Result<Vec<Manifest>> {
    if workload.kind == "Pod" {
        return Ok(vec![workload.clone()]);
    }
    let selector: BTreeMap<String, String> = match workload.kind.as_str() {
        "Job" => {
            let mut labels = workload.pod_template_labels();
            if labels.is_empty() {
                labels.insert("job-name".to_string(), workload.name().to_string());
            }
            labels
        }
        _ => workload.selector_labels(),
    };
    if selector.is_empty() {
        return Ok(Vec::new());
    }
    cluster.list("v1", "Pod", Some(namespace), &selector).await
}

/// ReplicaSets a Deployment owns, by its selector and owner references.
async fn owned_replica_sets(
    cluster: &dyn ClusterApi,
    namespace: &str,
    workload: &Manifest,
) -> Result<Vec<String>> {
    let selector = workload.selector_labels();
    if workload.kind != "Deployment" || selector.is_empty() {
        return Ok(Vec::new());
    }
    let replica_sets = cluster
        .list("apps/v1", "ReplicaSet", Some(namespace), &selector)
        .await?;
    Ok(replica_sets
        .iter()
        .filter(|rs| rs.owners("Deployment").contains(&workload.name()))
        .map(|rs| rs.name().to_string())
        .collect())
}

/// Gathers recent events and failed-container logs for an unhealthy workload.
///
/// Only events about the workload, its ReplicaSets and its failing pods are kept.
pub async fn collect_diagnostics(
    cluster: &dyn ClusterApi,
    namespace: &str,
    workload: &Manifest,
) -> Result<Diagnostics> {
    let pods = workload_pods(cluster, namespace, workload).await?;

    let mut logs = Vec::new();
    let mut involved: BTreeSet<(String, String)> = BTreeSet::new();
    involved.insert((workload.kind.clone(), workload.name().to_string()));
    for replica_set in owned_replica_sets(cluster, namespace, workload).await? {
        involved.insert(("ReplicaSet".to_string(), replica_set));
    }
    for pod in &pods {
        let failed = failed_containers(pod);
        if failed.is_empty() {
            continue;
        }
        involved.insert(("Pod".to_string(), pod.name().to_string()));
        for container in failed {
            let text = cluster
                .container_logs(namespace, &container.pod, &container.container, LOG_TAIL_LINES)
                .await
                .unwrap_or_else(|e| format!("<unable to fetch logs: {}>", e));
            logs.push((container.pod, container.container, text));
        }
    }

    let mut events: Vec<ClusterEvent> = cluster
        .events(namespace)
        .await?
        .into_iter()
        .filter(|e| involved.contains(&(e.involved_kind.clone(), e.involved_name.clone())))
        .collect();
    events.sort_by_key(|e| e.timestamp);
    let skip = events.len().saturating_sub(MAX_EVENTS);
    let events = events.into_iter().skip(skip).collect();

    Ok(Diagnostics { events, logs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use serde_json::json;

    fn deployment(status: Value) -> Manifest {
        let mut m = Manifest::new("apps/v1", "Deployment", "api")
            .with_field(
                "spec",
                json!({"replicas": 1, "selector": {"matchLabels": {"app": "api"}}}),
            )
            .with_field("status", status);
        m.metadata.extra.insert("generation".into(), json!(2));
        m
    }

    fn crashing_pod() -> Manifest {
        let mut pod = Manifest::new("v1", "Pod", "api-7d9f-abcde").with_field(
            "status",
            json!({
                "phase": "Running",
                "containerStatuses": [
                    {"name": "api", "state": {"waiting": {"reason": "CrashLoopBackOff"}}},
                    {"name": "sidecar", "state": {"running": {}}},
                    {"name": "init-done", "state": {"terminated": {"exitCode": 0}}},
                ],
            }),
        );
        pod.metadata.namespace = Some("default".into());
        pod.metadata.labels.insert("app".into(), "api".into());
        pod
    }

    #[test]
    fn test_deployment_health() {
        let ready = deployment(json!({
            "observedGeneration": 2, "replicas": 1, "updatedReplicas": 1, "availableReplicas": 1
        }));
        assert_eq!(workload_health(&ready), Health::Ready);

        let stale = deployment(json!({
            "observedGeneration": 1, "replicas": 1, "updatedReplicas": 1, "availableReplicas": 1
        }));
        assert!(matches!(workload_health(&stale), Health::Pending(_)));

        let stuck = deployment(json!({
            "conditions": [{"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}]
        }));
        assert!(workload_health(&stuck).is_unhealthy());
    }

    #[test]
    fn test_job_and_plain_kinds() {
        let failed = Manifest::new("batch/v1", "Job", "migrate").with_field(
            "status",
            json!({"conditions": [{"type": "Failed", "status": "True"}]}),
        );
        assert!(workload_health(&failed).is_unhealthy());
        assert!(workload_health(&Manifest::new("v1", "ConfigMap", "cfg")).is_ready());
    }

    #[test]
    fn test_failed_containers_excludes_healthy_siblings() {
        let failed = failed_containers(&crashing_pod());
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].container, "api");
        assert_eq!(failed[0].reason, "CrashLoopBackOff");
        assert!(workload_health(&crashing_pod()).is_unhealthy());
    }

    #[tokio::test]
    async fn test_collect_diagnostics() {
        let cluster = InMemoryCluster::new();
        cluster.insert(crashing_pod());
        cluster.set_logs("default", "api-7d9f-abcde", "api", "hello");
        cluster.set_logs("default", "api-7d9f-abcde", "sidecar", "sidecar chatter");
        cluster.add_event(
            "default",
            ClusterEvent::warning("Pod", "api-7d9f-abcde", "BackOff", "Back-off restarting failed container"),
        );
        cluster.add_event(
            "default",
            ClusterEvent::warning("Pod", "unrelated-1", "Failed", "not ours"),
        );
        cluster.add_event(
            "default",
            ClusterEvent::warning("Pod", "api-worker-5f6d-abcde", "BackOff", "other workload"),
        );
        cluster.add_event(
            "default",
            ClusterEvent::warning("ReplicaSet", "api-worker-5f6d", "FailedCreate", "other replica set"),
        );

        let mut replica_set = Manifest::new("apps/v1", "ReplicaSet", "api-7d9f");
        replica_set.metadata.namespace = Some("default".into());
        replica_set.metadata.labels.insert("app".into(), "api".into());
        replica_set.metadata.extra.insert(
            "ownerReferences".into(),
            json!([{"apiVersion": "apps/v1", "kind": "Deployment", "name": "api"}]),
        );
        cluster.insert(replica_set);
        cluster.add_event(
            "default",
            ClusterEvent::warning("ReplicaSet", "api-7d9f", "FailedCreate", "quota exceeded"),
        );

        let workload = deployment(json!({}));
        let diagnostics = collect_diagnostics(&cluster, "default", &workload)
            .await
            .unwrap();
        assert_eq!(diagnostics.logs.len(), 1);
        assert_eq!(diagnostics.events.len(), 2);

        let rendered = diagnostics.to_string();
        assert!(rendered.contains("BackOff"));
        assert!(rendered.contains("hello"));
        assert!(!rendered.contains("sidecar chatter"));
        assert!(!rendered.contains("not ours"));
        assert!(rendered.contains("quota exceeded"));
        assert!(!rendered.contains("other workload"));
        assert!(!rendered.contains("other replica set"));
    }
}
