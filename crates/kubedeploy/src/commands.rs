//! Library entry points behind the `sync-status`, `sync-pause` and
//! `sync-resume` commands.
//!
//! Each command runs over a set of resolved actions and reports every session
//! separately, so one paused path among several is visible.

use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::config::{DeployAction, ProviderConfig};
use crate::error::Result;
use crate::sync::{SessionManager, SessionStatus};

/// Summary of an action's sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionSyncState {
    /// No sessions exist.
    NotActive,
    /// Every session is watching for changes.
    Active,
    /// Every session is paused.
    Paused,
    /// A session reported an error.
    Failed,
    /// Some sessions are still syncing, or only some are paused.
    Syncing,
}

impl ActionSyncState {
    fn of(sessions: &[SessionStatus]) -> Self {
        if sessions.is_empty() {
            ActionSyncState::NotActive
        } else if sessions.iter().any(|s| s.last_error.is_some()) {
            ActionSyncState::Failed
        } else if sessions.iter().all(|s| s.paused) {
            ActionSyncState::Paused
        } else if sessions.iter().all(SessionStatus::is_ready) {
            ActionSyncState::Active
        } else {
            ActionSyncState::Syncing
        }
    }
}

/// Sessions of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSyncStatus {
    pub action: String,
    pub namespace: String,
    pub state: ActionSyncState,
    pub sessions: Vec<SessionStatus>,
}

impl ActionSyncStatus {
    fn new(action: &DeployAction, namespace: String, sessions: Vec<SessionStatus>) -> Self {
        Self {
            action: action.name.clone(),
            namespace,
            state: ActionSyncState::of(&sessions),
            sessions,
        }
    }
}

/// Session status of each action. Actions are queried concurrently.
pub async fn sync_status(
    manager: &SessionManager,
    provider: &ProviderConfig,
    actions: &[DeployAction],
) -> Result<Vec<ActionSyncStatus>> {
    try_join_all(actions.iter().map(|action| async move {
        let namespace = action.namespace(provider);
        let sessions = manager.status(&action.name, &namespace).await?;
        Ok(ActionSyncStatus::new(action, namespace, sessions))
    }))
    .await
}

/// Pauses every session of the given actions.
pub async fn sync_pause(
    manager: &SessionManager,
    provider: &ProviderConfig,
    actions: &[DeployAction],
) -> Result<Vec<ActionSyncStatus>> {
    let mut results = Vec::with_capacity(actions.len());
    for action in actions {
        let namespace = action.namespace(provider);
        let sessions = manager.pause(&action.name, &namespace).await?;
        log::info!("Paused {} sync session(s) of {}", sessions.len(), action.name);
        results.push(ActionSyncStatus::new(action, namespace, sessions));
    }
    Ok(results)
}

/// Resumes every paused session of the given actions.
pub async fn sync_resume(
    manager: &SessionManager,
    provider: &ProviderConfig,
    actions: &[DeployAction],
) -> Result<Vec<ActionSyncStatus>> {
    let mut results = Vec::with_capacity(actions.len());
    for action in actions {
        let namespace = action.namespace(provider);
        let sessions = manager.resume(&action.name, &namespace).await?;
        log::info!("Resumed {} sync session(s) of {}", sessions.len(), action.name);
        results.push(ActionSyncStatus::new(action, namespace, sessions));
    }
    Ok(results)
}
