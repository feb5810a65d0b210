//! Observability events for the surrounding orchestrator.
//!
//! Events are part of the API contract (callers assert on them), unlike log
//! lines. They travel over a tokio broadcast channel; sending with no
//! subscribers is fine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Plugin name carried by namespace status events.
pub const PLUGIN_NAME: &str = "kubernetes";

/// An event emitted by the deploy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeployEvent {
    /// The state of the namespace a status check or deploy resolved to.
    #[serde(rename_all = "camelCase")]
    NamespaceStatus {
        plugin_name: String,
        namespace_name: String,
        state: String,
        timestamp: DateTime<Utc>,
    },
    /// A manifest was applied to the cluster.
    #[serde(rename_all = "camelCase")]
    ResourceApplied {
        action: String,
        key: String,
        timestamp: DateTime<Utc>,
    },
    /// The aggregate status of a deploy changed or was computed.
    #[serde(rename_all = "camelCase")]
    DeployStatus {
        action: String,
        state: String,
        timestamp: DateTime<Utc>,
    },
    /// A sync session changed state.
    #[serde(rename_all = "camelCase")]
    SyncStatus {
        action: String,
        session: String,
        state: String,
        timestamp: DateTime<Utc>,
    },
}

impl DeployEvent {
    pub fn namespace_status(namespace: &str, state: &str) -> Self {
        DeployEvent::NamespaceStatus {
            plugin_name: PLUGIN_NAME.to_string(),
            namespace_name: namespace.to_string(),
            state: state.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn resource_applied(action: &str, key: &str) -> Self {
        DeployEvent::ResourceApplied {
            action: action.to_string(),
            key: key.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn deploy_status(action: &str, state: &str) -> Self {
        DeployEvent::DeployStatus {
            action: action.to_string(),
            state: state.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn sync_status(action: &str, session: &str, state: &str) -> Self {
        DeployEvent::SyncStatus {
            action: action.to_string(),
            session: session.to_string(),
            state: state.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Broadcasts deploy events to any number of subscribers.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: Arc<broadcast::Sender<DeployEvent>>,
}

impl EventBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: DeployEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<DeployEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
