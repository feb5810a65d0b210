//! Shared handles passed to every deploy operation.

use std::sync::Arc;

use crate::cluster::{ClusterApi, KubectlClient};
use crate::config::ProviderConfig;
use crate::events::EventBroadcaster;
use crate::lock::KeyedMutex;

/// The provider, cluster, event channel and locks a deploy operation works with.
#[derive(Clone)]
pub struct DeployContext {
    pub provider: Arc<ProviderConfig>,
    pub cluster: Arc<dyn ClusterApi>,
    pub events: EventBroadcaster,
    pub locks: Arc<KeyedMutex>,
}

impl DeployContext {
    pub fn new(provider: ProviderConfig, cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            provider: Arc::new(provider),
            cluster,
            events: EventBroadcaster::default(),
            locks: Arc::new(KeyedMutex::new()),
        }
    }

    /// A context that talks to the cluster through kubectl.
    pub fn kubectl(provider: ProviderConfig) -> Self {
        let client = KubectlClient::new(provider.kubectl());
        Self::new(provider, Arc::new(client))
    }

    /// Uses an existing event channel, e.g. one the caller already subscribed to.
    pub fn with_events(mut self, events: EventBroadcaster) -> Self {
        self.events = events;
        self
    }

    pub fn cluster(&self) -> &dyn ClusterApi {
        self.cluster.as_ref()
    }
}
