//! End-to-end deploy flow: resolve, check, apply, record, then sync.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Instrument};

use crate::apply::{self, prepare_manifests, ApplyOptions, ApplyResult, DeleteResult};
use crate::config::{DeployAction, DeployMode};
use crate::context::DeployContext;
use crate::error::Result;
use crate::status::{get_status, DeployStatus};
use crate::sync::{MutagenBackend, SessionManager, SessionStatus, SyncBackend};

/// Outcome of [`Deployer::deploy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutcome {
    #[serde(flatten)]
    pub apply: ApplyResult,
    /// Sync sessions running after the deploy. Empty unless deployed in sync mode.
    pub sessions: Vec<SessionStatus>,
}

/// Runs status checks, deploys and teardowns for kubernetes Deploy actions.
#[derive(Clone)]
pub struct Deployer {
    ctx: DeployContext,
    sessions: SessionManager,
}

impl Deployer {
    pub fn new(ctx: DeployContext, backend: Arc<dyn SyncBackend>) -> Self {
        let sessions = SessionManager::new(backend, ctx.events.clone(), &ctx.provider);
        Self { ctx, sessions }
    }

    /// A deployer that syncs through mutagen.
    pub fn with_mutagen(ctx: DeployContext) -> Self {
        let backend = Arc::new(MutagenBackend::new(&ctx.provider));
        Self::new(ctx, backend)
    }

    pub fn context(&self) -> &DeployContext {
        &self.ctx
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn status(&self, action: &DeployAction) -> Result<DeployStatus> {
        get_status(&self.ctx, action).await
    }

    /// Deploys an action in its effective mode.
    ///
    /// Sync sessions start after a successful apply in sync mode, and are
    /// stopped when the action is deployed in any other mode.
    pub async fn deploy(&self, action: &DeployAction, force: bool) -> Result<DeployOutcome> {
        let namespace = action.namespace(&self.ctx.provider);
        let mode = action.effective_mode();
        let span = info_span!("deploy", action = %action.name, namespace = %namespace, mode = %mode);

        async {
            let manifests = prepare_manifests(&self.ctx, action, false).await?;
            let options = ApplyOptions::from_action(action, &self.ctx.provider).with_force(force);
            let result = apply::apply(&self.ctx, action, manifests.clone(), &options).await?;

            let sessions = if mode == DeployMode::Sync {
                self.sessions.start(&self.ctx.provider, action, &manifests).await?
            } else {
                self.sessions.stop(&action.name, &namespace).await?;
                Vec::new()
            };

            info!(
                "Deployed {} ({} updated, {} sync sessions)",
                action.name,
                result.updated_manifests.len(),
                sessions.len()
            );
            Ok(DeployOutcome {
                apply: result,
                sessions,
            })
        }
        .instrument(span)
        .await
    }

    /// Stops sync, then deletes the action's resources and metadata record.
    pub async fn delete(&self, action: &DeployAction) -> Result<DeleteResult> {
        let namespace = action.namespace(&self.ctx.provider);
        self.sessions.stop(&action.name, &namespace).await?;
        apply::delete(&self.ctx, action).await
    }
}
