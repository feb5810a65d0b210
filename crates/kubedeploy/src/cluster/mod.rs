//! Access to the live cluster.
//!
//! Everything that reads or writes cluster state goes through [`ClusterApi`].
//! [`KubectlClient`] talks to a real cluster through `kubectl`;
//! [`InMemoryCluster`] keeps objects in memory and is used in tests.

pub mod health;
pub mod kubectl;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::manifest::{Manifest, ResourceRef};

pub use health::{collect_diagnostics, failed_containers, workload_health, Diagnostics, Health};
pub use kubectl::KubectlClient;
pub use memory::InMemoryCluster;

/// A cluster event about some object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEvent {
    pub involved_kind: String,
    pub involved_name: String,
    pub reason: String,
    pub message: String,
    /// `Normal` or `Warning`.
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ClusterEvent {
    pub fn warning(
        involved_kind: impl Into<String>,
        involved_name: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            involved_kind: involved_kind.into(),
            involved_name: involved_name.into(),
            reason: reason.into(),
            message: message.into(),
            event_type: "Warning".to_string(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Operations the deploy engine needs from a cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetches a live object. `Ok(None)` if it does not exist; `Err(UnknownKind)`
    /// if the API does not serve its kind.
    async fn get(&self, resource: &ResourceRef) -> Result<Option<Manifest>>;

    /// Lists objects of a kind, optionally scoped to a namespace and label selector.
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Manifest>>;

    /// Creates or updates an object and returns it as stored.
    async fn apply(&self, manifest: &Manifest) -> Result<Manifest>;

    /// Deletes an object. Returns whether anything was deleted.
    async fn delete(&self, resource: &ResourceRef) -> Result<bool>;

    /// Events recorded in a namespace.
    async fn events(&self, namespace: &str) -> Result<Vec<ClusterEvent>>;

    /// The last `tail` lines of a container's logs.
    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail: usize,
    ) -> Result<String>;
}
