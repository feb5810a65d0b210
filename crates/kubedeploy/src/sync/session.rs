//! Sync session lifecycle for a deployed action.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};

use super::backend::{RemoteTarget, SessionSpec, SessionStatus, SyncBackend};
use super::configure::{container_index, effective_target, resolve_target};
use super::spec::ResolvedSyncPath;
use crate::config::{DeployAction, ProviderConfig};
use crate::error::{DeployError, Result};
use crate::events::{DeployEvent, EventBroadcaster};
use crate::manifest::annotations::ACTION_NAME_LABEL;
use crate::manifest::hash::hash_bytes;
use crate::manifest::Manifest;

/// Label carrying the namespace a session belongs to.
pub const NAMESPACE_LABEL: &str = "garden.io/namespace";

/// Label carrying a fingerprint of the session's configuration.
pub const CONFIG_LABEL: &str = "garden.io/sync-config";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Deterministic session name, restricted to `[a-z0-9-]`.
pub fn session_name(namespace: &str, action_name: &str, index: usize) -> String {
    format!("k8s--{}--{}--{}", namespace, action_name, index)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Labels identifying the sessions of one action in one namespace.
pub fn session_labels(action_name: &str, namespace: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(ACTION_NAME_LABEL.to_string(), action_name.to_string());
    labels.insert(NAMESPACE_LABEL.to_string(), namespace.to_string());
    labels
}

/// Short hash over everything that defines a session except its labels.
///
/// A session is only reused while this stays the same.
pub fn config_fingerprint(spec: &SessionSpec) -> Result<String> {
    let unlabeled = SessionSpec {
        labels: BTreeMap::new(),
        ..spec.clone()
    };
    let serialized = serde_json::to_string(&unlabeled)?;
    Ok(hash_bytes(serialized.as_bytes())[..16].to_string())
}

/// Builds one session per sync path of the action.
///
/// A pod selector matching several workloads syncs into the first of them.
pub fn session_specs(
    provider: &ProviderConfig,
    action: &DeployAction,
    manifests: &[Manifest],
    backend: &dyn SyncBackend,
) -> Result<Vec<SessionSpec>> {
    let Some(sync) = &action.spec.sync else {
        return Ok(Vec::new());
    };
    let namespace = action.namespace(provider);
    let labels = session_labels(&action.name, &namespace);

    sync.paths
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let what = format!("sync path {} ({})", index, path.container_path);
            let target = effective_target(
                &action.name,
                &what,
                path.target.as_ref(),
                action.spec.default_target.as_ref(),
            )?;
            let matched = resolve_target(&action.name, manifests, target)?;
            let Some(workload) = matched.first().map(|&i| &manifests[i]) else {
                return Err(DeployError::config(&action.name, format!("{} has no target workload", what)));
            };

            let container = workload
                .pod_spec()
                .and_then(|pod_spec| {
                    let i = container_index(pod_spec, target.container_name.as_deref())?;
                    pod_spec.get("containers")?.get(i)?.get("name")?.as_str().map(str::to_string)
                })
                .ok_or_else(|| {
                    DeployError::config(
                        &action.name,
                        format!(
                            "{}: {} has no container{}",
                            what,
                            workload.key(),
                            target
                                .container_name
                                .as_ref()
                                .map(|n| format!(" named {}", n))
                                .unwrap_or_default()
                        ),
                    )
                })?;

            let resolved = ResolvedSyncPath::resolve(path, &provider.sync.defaults, &action.source_dir);
            let remote = backend.endpoint(&RemoteTarget {
                namespace: workload
                    .namespace_or(&namespace)
                    .unwrap_or(namespace.as_str())
                    .to_string(),
                kind: workload.kind.clone(),
                name: workload.name().to_string(),
                container,
                container_path: resolved.container_path.clone(),
            });
            let local = resolved.source_path.display().to_string();
            let (alpha, beta) = if resolved.mode.is_reverse() {
                (remote, local)
            } else {
                (local, remote)
            };

            let mut spec = SessionSpec {
                name: session_name(&namespace, &action.name, index),
                alpha,
                beta,
                mode: resolved.mode,
                ignore: resolved.exclude,
                default_file_mode: resolved.default_file_mode,
                default_directory_mode: resolved.default_directory_mode,
                default_owner: resolved.default_owner,
                default_group: resolved.default_group,
                labels: labels.clone(),
            };
            let fingerprint = config_fingerprint(&spec)?;
            spec.labels.insert(CONFIG_LABEL.to_string(), fingerprint);
            Ok(spec)
        })
        .collect()
}

/// Starts, inspects and stops the sync sessions of deployed actions.
#[derive(Clone)]
pub struct SessionManager {
    backend: Arc<dyn SyncBackend>,
    events: EventBroadcaster,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn SyncBackend>, events: EventBroadcaster, provider: &ProviderConfig) -> Self {
        Self {
            backend,
            events,
            ready_timeout: provider.sync_flush_timeout(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn backend(&self) -> &dyn SyncBackend {
        self.backend.as_ref()
    }

    /// Starts every session of the action and waits for the initial sync.
    ///
    /// An existing session with the same name and configuration fingerprint is
    /// kept (and resumed if paused). Sessions whose mode, excludes, endpoints or
    /// permissions changed are terminated and recreated, as are duplicates.
    pub async fn start(
        &self,
        provider: &ProviderConfig,
        action: &DeployAction,
        manifests: &[Manifest],
    ) -> Result<Vec<SessionStatus>> {
        let namespace = action.namespace(provider);
        let span = info_span!("sync", action = %action.name, namespace = %namespace);
        async {
            let specs = session_specs(provider, action, manifests, self.backend.as_ref())?;
            self.backend.ensure_daemon().await?;

            let existing = self.backend.list(&session_labels(&action.name, &namespace)).await?;
            let mut kept: BTreeMap<String, String> = BTreeMap::new();
            for session in existing {
                let wanted = specs.iter().find(|s| s.name == session.name);
                let reusable = wanted.is_some_and(|s| {
                    s.alpha == session.alpha
                        && s.beta == session.beta
                        && s.labels.get(CONFIG_LABEL) == session.labels.get(CONFIG_LABEL)
                }) && !kept.contains_key(&session.name);
                if reusable {
                    if session.paused {
                        self.backend.resume(&session.identifier).await?;
                    }
                    debug!("Reusing sync session {}", session.name);
                    kept.insert(session.name.clone(), session.identifier.clone());
                } else {
                    debug!("Terminating stale sync session {} ({})", session.name, session.identifier);
                    self.backend.terminate(&session.identifier).await?;
                }
            }

            let mut started = Vec::with_capacity(specs.len());
            for spec in &specs {
                let identifier = match kept.get(&spec.name) {
                    Some(identifier) => identifier.clone(),
                    None => {
                        self.events
                            .send(DeployEvent::sync_status(&action.name, &spec.name, "starting"));
                        self.backend.create(spec).await?
                    }
                };
                let status = self.wait_until_ready(&spec.name, &identifier).await?;
                self.events
                    .send(DeployEvent::sync_status(&action.name, &spec.name, &status.state));
                info!("Syncing {} to {} ({})", spec.alpha, spec.beta, spec.mode);
                started.push(status);
            }
            Ok(started)
        }
        .instrument(span)
        .await
    }

    async fn wait_until_ready(&self, name: &str, identifier: &str) -> Result<SessionStatus> {
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            let sessions = self.backend.list(&BTreeMap::new()).await?;
            let current = sessions.into_iter().find(|s| s.identifier == identifier);
            match current {
                Some(status) if status.is_ready() => return Ok(status),
                Some(status) if status.last_error.is_some() => {
                    warn!(
                        "Sync session {} reported an error: {}",
                        name,
                        status.last_error.as_deref().unwrap_or_default()
                    );
                }
                Some(_) => {}
                None => {
                    return Err(DeployError::Sync(format!(
                        "sync session {} disappeared while starting",
                        name
                    )))
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DeployError::Timeout {
                    operation: format!("initial sync of session {}", name),
                    seconds: self.ready_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Sessions of an action, in name order.
    pub async fn status(&self, action_name: &str, namespace: &str) -> Result<Vec<SessionStatus>> {
        let mut sessions = self.backend.list(&session_labels(action_name, namespace)).await?;
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sessions)
    }

    /// Terminates every session of an action. Returns how many were stopped.
    pub async fn stop(&self, action_name: &str, namespace: &str) -> Result<usize> {
        let sessions = self.status(action_name, namespace).await?;
        for session in &sessions {
            self.backend.terminate(&session.identifier).await?;
            self.events
                .send(DeployEvent::sync_status(action_name, &session.name, "terminated"));
        }
        if !sessions.is_empty() {
            info!("Stopped {} sync session(s) of {}", sessions.len(), action_name);
        }
        Ok(sessions.len())
    }

    pub async fn pause(&self, action_name: &str, namespace: &str) -> Result<Vec<SessionStatus>> {
        for session in self.status(action_name, namespace).await? {
            if !session.paused {
                self.backend.pause(&session.identifier).await?;
                self.events
                    .send(DeployEvent::sync_status(action_name, &session.name, "paused"));
            }
        }
        self.status(action_name, namespace).await
    }

    pub async fn resume(&self, action_name: &str, namespace: &str) -> Result<Vec<SessionStatus>> {
        for session in self.status(action_name, namespace).await? {
            if session.paused {
                self.backend.resume(&session.identifier).await?;
                self.events
                    .send(DeployEvent::sync_status(action_name, &session.name, "resumed"));
            }
        }
        self.status(action_name, namespace).await
    }

    /// Flushes every active session, bounded by the flush timeout.
    pub async fn flush(&self, action_name: &str, namespace: &str) -> Result<()> {
        let sessions = self.status(action_name, namespace).await?;
        let flush_all = async {
            for session in sessions.iter().filter(|s| !s.paused) {
                self.backend.flush(&session.identifier).await?;
            }
            Ok::<(), DeployError>(())
        };
        tokio::time::timeout(self.ready_timeout, flush_all)
            .await
            .map_err(|_| DeployError::Timeout {
                operation: format!("sync flush of {}", action_name),
                seconds: self.ready_timeout.as_secs(),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeployMode, KubernetesDeploySpec};
    use crate::sync::backend::LocalBackend;
    use crate::sync::spec::{SyncMode, SyncPathSpec, SyncSpec, TargetSpec};
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use serde_json::json;

    fn deployment() -> Manifest {
        Manifest::new("apps/v1", "Deployment", "api").with_field(
            "spec",
            json!({
                "selector": {"matchLabels": {"app": "api"}},
                "template": {
                    "metadata": {"labels": {"app": "api"}},
                    "spec": {"containers": [{"name": "main", "image": "api"}, {"name": "sidecar", "image": "proxy"}]}
                }
            }),
        )
    }

    fn action(dir: &std::path::Path, mode: SyncMode) -> DeployAction {
        let mut path = SyncPathSpec::new(".", "/app");
        path.mode = mode;
        path.exclude = vec!["somedir".into()];
        let spec = KubernetesDeploySpec {
            sync: Some(SyncSpec {
                paths: vec![path],
                overrides: vec![],
            }),
            default_target: Some(TargetSpec::workload("Deployment", "api")),
            ..Default::default()
        };
        DeployAction::new("api", dir, spec).unwrap().with_mode(DeployMode::Sync)
    }

    #[test]
    fn test_session_name_is_sanitized() {
        assert_eq!(session_name("dev", "api", 0), "k8s--dev--api--0");
        assert_eq!(session_name("Dev", "my_api.v2", 3), "k8s--dev--my-api-v2--3");
    }

    #[test]
    fn test_session_specs() {
        let dir = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let backend = LocalBackend::new(root.path());
        let provider = ProviderConfig::default();

        let specs = session_specs(&provider, &action(dir.path(), SyncMode::TwoWay), &[deployment()], &backend).unwrap();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.name, "k8s--default--api--0");
        assert_eq!(spec.alpha, dir.path().join(".").display().to_string());
        assert!(spec.beta.ends_with("deployment-api/main/app"));
        assert!(spec.ignore.contains(&"somedir".to_string()));
        assert_eq!(spec.labels.get(ACTION_NAME_LABEL).map(String::as_str), Some("api"));
        assert_eq!(spec.labels.get(CONFIG_LABEL).map(String::len), Some(16));

        let reverse = session_specs(&provider, &action(dir.path(), SyncMode::OneWayReverse), &[deployment()], &backend).unwrap();
        assert!(reverse[0].alpha.ends_with("deployment-api/main/app"));
        assert_ne!(reverse[0].labels.get(CONFIG_LABEL), spec.labels.get(CONFIG_LABEL));
    }

    #[test]
    fn test_fingerprint_tracks_excludes_and_modes() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        let provider = ProviderConfig::default();
        let base = action(dir.path(), SyncMode::OneWay);
        let fingerprint = |action: &DeployAction| {
            session_specs(&provider, action, &[deployment()], &backend).unwrap()[0]
                .labels
                .get(CONFIG_LABEL)
                .cloned()
        };

        assert_eq!(fingerprint(&base), fingerprint(&base.clone()));

        let mut excluded = base.clone();
        excluded.spec.sync.as_mut().unwrap().paths[0].exclude.push("secret.txt".into());
        assert_ne!(fingerprint(&excluded), fingerprint(&base));

        let mut file_mode = base.clone();
        file_mode.spec.sync.as_mut().unwrap().paths[0].default_file_mode = Some(0o600);
        assert_ne!(fingerprint(&file_mode), fingerprint(&base));
    }

    #[test]
    fn test_session_specs_named_container() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        let mut action = action(dir.path(), SyncMode::OneWay);
        action.spec.default_target.as_mut().unwrap().container_name = Some("sidecar".into());
        let specs = session_specs(&ProviderConfig::default(), &action, &[deployment()], &backend).unwrap();
        assert!(specs[0].beta.contains("/sidecar/"));

        action.spec.default_target.as_mut().unwrap().container_name = Some("nope".into());
        let err = session_specs(&ProviderConfig::default(), &action, &[deployment()], &backend).unwrap_err();
        assert!(err.to_string().contains("named nope"));
    }

    #[test]
    fn test_missing_target_names_action() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        let mut action = action(dir.path(), SyncMode::OneWay);
        action.spec.default_target = None;
        let err = session_specs(&ProviderConfig::default(), &action, &[deployment()], &backend).unwrap_err();
        assert!(matches!(err, DeployError::Configuration { action: ref name, .. } if name == "api"));
    }

    #[tokio::test]
    async fn test_start_reuses_and_stops() {
        let dir = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        dir.child("app.js").write_str("1").unwrap();
        let provider = ProviderConfig::default();
        let manager = SessionManager::new(
            Arc::new(LocalBackend::new(root.path())),
            EventBroadcaster::default(),
            &provider,
        )
        .with_poll_interval(Duration::from_millis(20));
        let mut rx = manager.events.subscribe();

        let action = action(dir.path(), SyncMode::OneWay);
        let first = manager.start(&provider, &action, &[deployment()]).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].is_ready());

        let second = manager.start(&provider, &action, &[deployment()]).await.unwrap();
        assert_eq!(second[0].identifier, first[0].identifier);

        let mut changed = action.clone();
        changed.spec.sync.as_mut().unwrap().paths[0].mode = SyncMode::TwoWay;
        let third = manager.start(&provider, &changed, &[deployment()]).await.unwrap();
        assert_ne!(third[0].identifier, first[0].identifier);
        assert_eq!(third[0].mode, "two-way");
        assert_eq!(manager.status("api", "default").await.unwrap().len(), 1);

        let paused = manager.pause("api", "default").await.unwrap();
        assert!(paused[0].paused);
        let resumed = manager.resume("api", "default").await.unwrap();
        assert!(!resumed[0].paused);

        assert_eq!(manager.stop("api", "default").await.unwrap(), 1);
        assert!(manager.status("api", "default").await.unwrap().is_empty());

        let mut states = Vec::new();
        while let Ok(DeployEvent::SyncStatus { state, .. }) = rx.try_recv() {
            states.push(state);
        }
        assert_eq!(states.first().map(String::as_str), Some("starting"));
        assert_eq!(states.last().map(String::as_str), Some("terminated"));
    }
}
