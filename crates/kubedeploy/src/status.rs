//! Deployment status: desired manifests compared against the live cluster.
//!
//! Nothing here is cached. Every call re-reads the metadata record and each
//! declared object, so a check that races an apply may see `outdated` or
//! `not-ready` for a moment.

use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, Instrument};

use crate::apply::prepare_manifests;
use crate::cluster::{workload_health, Health};
use crate::config::DeployAction;
use crate::context::DeployContext;
use crate::error::{DeployError, Result};
use crate::events::DeployEvent;
use crate::manifest::annotations::MANIFEST_HASH;
use crate::manifest::{is_valid_hash, Manifest, ResourceRef};
use crate::metadata::{self, MetadataRecord};

/// Aggregate state of a deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployState {
    Ready,
    Outdated,
    Missing,
    NotReady,
}

impl DeployState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployState::Ready => "ready",
            DeployState::Outdated => "outdated",
            DeployState::Missing => "missing",
            DeployState::NotReady => "not-ready",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, DeployState::Ready)
    }
}

impl std::fmt::Display for DeployState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one declared object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub key: String,
    pub resource: ResourceRef,
    pub state: DeployState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetail {
    /// Mode of the running deploy, or the requested one if nothing is deployed.
    pub mode: String,
    /// Version recorded by the last successful apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub namespace: String,
    pub resources: Vec<ResourceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployStatus {
    pub state: DeployState,
    pub detail: StatusDetail,
}

/// Computes the status of an action against the live cluster.
///
/// Emits one namespace status event and one deploy status event. Transient API
/// errors are returned rather than reported as `not-ready`.
pub async fn get_status(ctx: &DeployContext, action: &DeployAction) -> Result<DeployStatus> {
    let namespace = action.namespace(&ctx.provider);
    let span = info_span!("status", action = %action.name, namespace = %namespace);
    async {
        let manifests = prepare_manifests(ctx, action, false).await?;
        let status = status_of(ctx, action, &manifests).await?;
        debug!(state = %status.state, "Computed status of {}", action.name);
        Ok(status)
    }
    .instrument(span)
    .await
}

/// Status of an action whose desired manifests are already prepared.
pub async fn status_of(
    ctx: &DeployContext,
    action: &DeployAction,
    manifests: &[Manifest],
) -> Result<DeployStatus> {
    let identity = action.identity(&ctx.provider);
    let namespace = identity.namespace.clone();

    let namespace_ref = ResourceRef::new("v1", "Namespace", None, namespace.as_str());
    let namespace_exists = ctx.cluster.get(&namespace_ref).await?.is_some();
    ctx.events.send(DeployEvent::namespace_status(
        &namespace,
        if namespace_exists { "ready" } else { "missing" },
    ));

    let record = if namespace_exists {
        metadata::read(ctx.cluster(), &action.name, &namespace).await?
    } else {
        None
    };

    let status = match record {
        None => DeployStatus {
            state: DeployState::Missing,
            detail: StatusDetail {
                mode: identity.mode.to_string(),
                version: None,
                namespace,
                resources: Vec::new(),
            },
        },
        Some(record) => {
            let (state, resources) =
                if record_matches(&record, &identity.resolved_version, identity.mode.as_str()) {
                    let resources = resource_statuses(ctx, &namespace, manifests).await?;
                    (aggregate(&resources), resources)
                } else {
                    (DeployState::Outdated, Vec::new())
                };
            DeployStatus {
                state,
                detail: StatusDetail {
                    mode: record.mode,
                    version: Some(record.resolved_version),
                    namespace,
                    resources,
                },
            }
        }
    };

    ctx.events
        .send(DeployEvent::deploy_status(&action.name, status.state.as_str()));
    Ok(status)
}

fn record_matches(record: &MetadataRecord, version: &str, mode: &str) -> bool {
    record.resolved_version == version && record.mode == mode
}

/// `outdated` beats `not-ready`; an empty set is ready.
fn aggregate(resources: &[ResourceStatus]) -> DeployState {
    if resources.iter().any(|r| r.state == DeployState::Outdated) {
        DeployState::Outdated
    } else if resources.iter().any(|r| r.state == DeployState::NotReady) {
        DeployState::NotReady
    } else {
        DeployState::Ready
    }
}

async fn resource_statuses(
    ctx: &DeployContext,
    namespace: &str,
    manifests: &[Manifest],
) -> Result<Vec<ResourceStatus>> {
    let mut statuses = Vec::with_capacity(manifests.len());
    for manifest in manifests {
        let resource = manifest.resource_ref(namespace);
        let (state, message) = match ctx.cluster.get(&resource).await {
            Ok(Some(live)) => compare(manifest, &live),
            Ok(None) => (DeployState::NotReady, Some("not found in the cluster".to_string())),
            Err(DeployError::UnknownKind { api_version, kind }) => (
                DeployState::NotReady,
                Some(format!("resource type {}/{} is not served by the cluster", api_version, kind)),
            ),
            Err(e) => return Err(e),
        };
        statuses.push(ResourceStatus {
            key: manifest.key(),
            resource,
            state,
            message,
        });
    }
    Ok(statuses)
}

/// Compares one declared manifest with its live object.
pub fn compare(desired: &Manifest, live: &Manifest) -> (DeployState, Option<String>) {
    let Some(live_hash) = live.annotation(MANIFEST_HASH) else {
        return (DeployState::Outdated, Some("no manifest hash annotation".to_string()));
    };
    if !is_valid_hash(live_hash) {
        return (
            DeployState::Outdated,
            Some(format!("invalid manifest hash annotation '{}'", live_hash)),
        );
    }
    if desired.annotation(MANIFEST_HASH) != Some(live_hash) {
        return (DeployState::Outdated, Some("manifest has changed".to_string()));
    }

    match workload_health(live) {
        Health::Ready => (DeployState::Ready, None),
        Health::Pending(reason) | Health::Unhealthy(reason) => (DeployState::NotReady, Some(reason)),
    }
}
