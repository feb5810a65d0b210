//! [`ClusterApi`] backed by the `kubectl` binary.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{ClusterApi, ClusterEvent};
use crate::error::{classify_kubectl_error, DeployError, Result};
use crate::manifest::{Manifest, ResourceRef};
use crate::process::{args, Tool, ToolOutput};

/// Upper bound for a single kubectl call.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Talks to a cluster by running kubectl and exchanging JSON.
pub struct KubectlClient {
    kubectl: Tool,
    timeout: Duration,
}

impl KubectlClient {
    pub fn new(kubectl: Tool) -> Self {
        Self {
            kubectl,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call(&self, args: &[String], stdin: Option<&str>) -> Result<ToolOutput> {
        self.kubectl.run(args, stdin, Some(self.timeout)).await
    }

    fn failure(&self, args: &[String], output: &ToolOutput) -> DeployError {
        classify_kubectl_error(
            &self.kubectl.describe(args),
            output.exit_code,
            &output.stderr,
            &output.stdout,
        )
    }
}

/// `kind.version.group` for kubectl, or just the kind for the core group.
pub fn resource_type(api_version: &str, kind: &str) -> String {
    match api_version.split_once('/') {
        Some((group, version)) => format!("{}.{}.{}", kind, version, group),
        None => kind.to_string(),
    }
}

fn namespace_args(namespace: Option<&str>) -> Vec<String> {
    match namespace {
        Some(ns) => args(["--namespace", ns]),
        None => Vec::new(),
    }
}

fn selector_arg(selector: &BTreeMap<String, String>) -> Option<String> {
    if selector.is_empty() {
        return None;
    }
    let pairs: Vec<String> = selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    Some(format!("--selector={}", pairs.join(",")))
}

fn parse_items(stdout: &str) -> Result<Vec<Manifest>> {
    let list: Value = serde_json::from_str(stdout)?;
    let items = match list.get("items") {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    items.into_iter().map(Manifest::from_value).collect()
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_event(item: &Value) -> ClusterEvent {
    let text = |path: &[&str]| -> String {
        let mut current = Some(item);
        for key in path {
            current = current.and_then(|v| v.get(*key));
        }
        current.and_then(Value::as_str).unwrap_or_default().to_string()
    };
    let timestamp = parse_timestamp(item.get("lastTimestamp"))
        .or_else(|| parse_timestamp(item.get("eventTime")))
        .or_else(|| parse_timestamp(item.get("metadata").and_then(|m| m.get("creationTimestamp"))));

    ClusterEvent {
        involved_kind: text(&["involvedObject", "kind"]),
        involved_name: text(&["involvedObject", "name"]),
        reason: text(&["reason"]),
        message: text(&["message"]),
        event_type: text(&["type"]),
        timestamp,
    }
}

#[async_trait]
impl ClusterApi for KubectlClient {
    async fn get(&self, resource: &ResourceRef) -> Result<Option<Manifest>> {
        let mut call = args([
            "get".to_string(),
            format!(
                "{}/{}",
                resource_type(&resource.api_version, &resource.kind),
                resource.name
            ),
            "--ignore-not-found".to_string(),
            "--output=json".to_string(),
        ]);
        call.extend(namespace_args(resource.namespace.as_deref()));

        let output = self.call(&call, None).await?;
        if !output.success() {
            return match self.failure(&call, &output) {
                DeployError::UnknownKind { .. } => Err(DeployError::UnknownKind {
                    api_version: resource.api_version.clone(),
                    kind: resource.kind.clone(),
                }),
                DeployError::NotFound(_) => Ok(None),
                other => Err(other),
            };
        }
        if output.stdout.trim().is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(&output.stdout)?;
        Ok(Some(Manifest::from_value(value)?))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Manifest>> {
        let mut call = args(["get".to_string(), resource_type(api_version, kind)]);
        call.push("--output=json".to_string());
        call.extend(namespace_args(namespace));
        call.extend(selector_arg(selector));

        let output = self.call(&call, None).await?;
        if !output.success() {
            return Err(match self.failure(&call, &output) {
                DeployError::UnknownKind { .. } => DeployError::UnknownKind {
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                },
                other => other,
            });
        }
        parse_items(&output.stdout)
    }

    async fn apply(&self, manifest: &Manifest) -> Result<Manifest> {
        let call = args(["apply", "--filename=-", "--output=json"]);
        let body = serde_json::to_string(manifest)?;

        let output = self.call(&call, Some(&body)).await?;
        if !output.success() {
            return Err(self.failure(&call, &output));
        }
        let value: Value = serde_json::from_str(&output.stdout)?;
        Manifest::from_value(value)
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<bool> {
        let mut call = args([
            "delete".to_string(),
            format!(
                "{}/{}",
                resource_type(&resource.api_version, &resource.kind),
                resource.name
            ),
            "--ignore-not-found".to_string(),
            "--output=name".to_string(),
        ]);
        call.extend(namespace_args(resource.namespace.as_deref()));

        let output = self.call(&call, None).await?;
        if !output.success() {
            return match self.failure(&call, &output) {
                DeployError::NotFound(_) => Ok(false),
                other => Err(other),
            };
        }
        Ok(!output.stdout.trim().is_empty())
    }

    async fn events(&self, namespace: &str) -> Result<Vec<ClusterEvent>> {
        let mut call = args(["get", "events", "--output=json"]);
        call.extend(namespace_args(Some(namespace)));

        let output = self.call(&call, None).await?;
        if !output.success() {
            return Err(self.failure(&call, &output));
        }
        let list: Value = serde_json::from_str(&output.stdout)?;
        Ok(list
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(parse_event).collect())
            .unwrap_or_default())
    }

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail: usize,
    ) -> Result<String> {
        let base = args([
            "logs".to_string(),
            pod.to_string(),
            format!("--container={}", container),
            format!("--tail={}", tail),
            format!("--namespace={}", namespace),
        ]);

        let output = self.call(&base, None).await?;
        if output.success() && !output.stdout.trim().is_empty() {
            return Ok(output.stdout);
        }

        // A crash-looping container's output lives in its previous instance
        let mut previous = base.clone();
        previous.push("--previous".to_string());
        let retry = self.call(&previous, None).await?;
        if retry.success() {
            Ok(retry.stdout)
        } else if output.success() {
            Ok(output.stdout)
        } else {
            Err(self.failure(&base, &output))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_type() {
        assert_eq!(resource_type("v1", "ConfigMap"), "ConfigMap");
        assert_eq!(resource_type("apps/v1", "Deployment"), "Deployment.v1.apps");
    }

    #[test]
    fn test_selector_arg() {
        let mut selector = BTreeMap::new();
        assert_eq!(selector_arg(&selector), None);
        selector.insert("app".to_string(), "api".to_string());
        selector.insert("tier".to_string(), "web".to_string());
        assert_eq!(
            selector_arg(&selector).as_deref(),
            Some("--selector=app=api,tier=web")
        );
    }

    #[test]
    fn test_parse_event() {
        let event = parse_event(&json!({
            "involvedObject": {"kind": "Pod", "name": "api-1"},
            "reason": "BackOff",
            "message": "Back-off restarting failed container",
            "type": "Warning",
            "lastTimestamp": "2024-01-01T00:00:00Z",
        }));
        assert_eq!(event.involved_name, "api-1");
        assert_eq!(event.reason, "BackOff");
        assert!(event.timestamp.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_get_not_found_is_none() {
        let client = KubectlClient::new(Tool::new("sh").with_base_arg("-c").with_base_arg(
            "echo 'Error from server (NotFound): configmaps \"x\" not found' >&2; exit 1",
        ));
        let found = client
            .get(&ResourceRef::new("v1", "ConfigMap", Some("default"), "x"))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_unknown_kind() {
        let client = KubectlClient::new(Tool::new("sh").with_base_arg("-c").with_base_arg(
            "echo 'error: the server doesn'\"'\"'t have a resource type \"widgets\"' >&2; exit 1",
        ));
        let err = client
            .list("example.com/v1", "Widget", Some("default"), &BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            DeployError::UnknownKind { kind, .. } => assert_eq!(kind, "Widget"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
