//! Sync session backends.
//!
//! [`MutagenBackend`] drives the `mutagen` CLI against a sync agent running in
//! the container. [`LocalBackend`] runs the native [`SyncEngine`] between two
//! local directories and re-syncs on filesystem changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::configure::SYNC_AGENT_PATH;
use super::engine::{CycleReport, SyncEngine};
use super::spec::{Ownership, SyncMode};
use crate::config::ProviderConfig;
use crate::error::{DeployError, Result};
use crate::process::{args, Tool};

/// Session state once the initial sync has completed.
pub const STATE_WATCHING: &str = "watching";

/// Everything needed to create one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    pub name: String,
    /// Source endpoint for one-way modes.
    pub alpha: String,
    pub beta: String,
    pub mode: SyncMode,
    pub ignore: Vec<String>,
    pub default_file_mode: u32,
    pub default_directory_mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_owner: Option<Ownership>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_group: Option<Ownership>,
    pub labels: BTreeMap<String, String>,
}

/// A session as reported by its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub identifier: String,
    pub name: String,
    pub alpha: String,
    pub beta: String,
    pub mode: String,
    pub paused: bool,
    pub state: String,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl SessionStatus {
    /// Initial sync done and changes are being watched.
    pub fn is_ready(&self) -> bool {
        !self.paused && self.state == STATE_WATCHING
    }
}

/// The container side of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub container: String,
    pub container_path: String,
}

/// Creates and controls sync sessions.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Starts the sync daemon. A no-op if it is already running.
    async fn ensure_daemon(&self) -> Result<()>;

    /// Creates a session and returns its identifier.
    async fn create(&self, spec: &SessionSpec) -> Result<String>;

    /// Sessions carrying all of `labels`.
    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<SessionStatus>>;

    async fn pause(&self, identifier: &str) -> Result<()>;

    async fn resume(&self, identifier: &str) -> Result<()>;

    /// Runs a full sync cycle and waits for it to finish.
    async fn flush(&self, identifier: &str) -> Result<()>;

    async fn terminate(&self, identifier: &str) -> Result<()>;

    /// The endpoint string addressing a path in a container.
    fn endpoint(&self, target: &RemoteTarget) -> String;
}

fn label_arg(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Sessions managed by the `mutagen` CLI.
pub struct MutagenBackend {
    mutagen: Tool,
    kubectl: PathBuf,
    context: Option<String>,
    timeout: Duration,
}

impl MutagenBackend {
    pub fn new(provider: &ProviderConfig) -> Self {
        Self {
            mutagen: provider.mutagen(),
            kubectl: provider.kubectl_path.clone(),
            context: provider.context.clone(),
            timeout: provider.sync_flush_timeout(),
        }
    }

    /// Arguments of `mutagen sync create`.
    pub fn create_args(spec: &SessionSpec) -> Vec<String> {
        let mut out = args(["sync", "create"]);
        out.push(spec.alpha.clone());
        out.push(spec.beta.clone());
        out.push(format!("--name={}", spec.name));
        out.push(format!("--sync-mode={}", spec.mode.mutagen_mode()));
        for pattern in &spec.ignore {
            out.push(format!("--ignore={}", pattern));
        }
        out.push(format!("--default-file-mode={:04o}", spec.default_file_mode));
        out.push(format!("--default-directory-mode={:04o}", spec.default_directory_mode));
        // Ownership applies to whichever side is the container
        let side = if spec.mode.is_reverse() { "alpha" } else { "beta" };
        if let Some(owner) = &spec.default_owner {
            out.push(format!("--default-owner-{}={}", side, owner));
        }
        if let Some(group) = &spec.default_group {
            out.push(format!("--default-group-{}={}", side, group));
        }
        for (key, value) in &spec.labels {
            out.push(format!("--label={}={}", key, value));
        }
        out
    }

    async fn session_command(&self, command: &str, identifier: &str) -> Result<()> {
        self.mutagen
            .exec(&args(["sync", command, identifier]), None, Some(self.timeout))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SyncBackend for MutagenBackend {
    async fn ensure_daemon(&self) -> Result<()> {
        self.mutagen
            .exec(&args(["daemon", "start"]), None, Some(self.timeout))
            .await?;
        Ok(())
    }

    async fn create(&self, spec: &SessionSpec) -> Result<String> {
        let stdout = self
            .mutagen
            .exec(&Self::create_args(spec), None, Some(self.timeout))
            .await?;
        // "Created session sync_..."; the name works as an identifier too
        Ok(stdout
            .split_whitespace()
            .find(|token| token.starts_with("sync_"))
            .map(str::to_string)
            .unwrap_or_else(|| spec.name.clone()))
    }

    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<SessionStatus>> {
        let mut list_args = args(["sync", "list", "--template", "{{ json . }}"]);
        if !labels.is_empty() {
            list_args.push(format!("--label-selector={}", label_arg(labels)));
        }
        let stdout = self.mutagen.exec(&list_args, None, Some(self.timeout)).await?;
        parse_mutagen_sessions(&stdout)
    }

    async fn pause(&self, identifier: &str) -> Result<()> {
        self.session_command("pause", identifier).await
    }

    async fn resume(&self, identifier: &str) -> Result<()> {
        self.session_command("resume", identifier).await
    }

    async fn flush(&self, identifier: &str) -> Result<()> {
        self.session_command("flush", identifier).await
    }

    async fn terminate(&self, identifier: &str) -> Result<()> {
        self.session_command("terminate", identifier).await
    }

    fn endpoint(&self, target: &RemoteTarget) -> String {
        let mut command = vec![self.kubectl.display().to_string(), "exec".into(), "-i".into()];
        if let Some(context) = &self.context {
            command.push(format!("--context={}", context));
        }
        command.push(format!("--namespace={}", target.namespace));
        command.push(format!("--container={}", target.container));
        command.push(format!("{}/{}", target.kind.to_lowercase(), target.name));
        command.extend(["--".to_string(), SYNC_AGENT_PATH.to_string(), "synchronizer".to_string()]);
        format!("exec:'{}':{}", command.join(" "), target.container_path)
    }
}

/// Parses `mutagen sync list --template '{{ json . }}'` output.
///
/// Unknown fields are ignored and missing ones default, so older and newer
/// mutagen releases both parse.
pub fn parse_mutagen_sessions(stdout: &str) -> Result<Vec<SessionStatus>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed)?;
    let Some(items) = value.as_array() else {
        return Err(DeployError::Sync(format!(
            "unexpected mutagen session list: {}",
            trimmed
        )));
    };

    let text = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    let endpoint = |v: Option<&Value>| match v {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.get("path").and_then(Value::as_str).unwrap_or_default().to_string(),
        None => String::new(),
    };

    Ok(items
        .iter()
        .map(|item| SessionStatus {
            identifier: text(item, "identifier"),
            name: text(item, "name"),
            alpha: endpoint(item.get("alpha")),
            beta: endpoint(item.get("beta")),
            mode: text(item, "mode"),
            paused: item.get("paused").and_then(Value::as_bool).unwrap_or(false),
            state: text(item, "status"),
            conflicts: item
                .get("conflicts")
                .and_then(Value::as_array)
                .map(|c| {
                    c.iter()
                        .map(|conflict| match conflict.get("root").and_then(Value::as_str) {
                            Some(root) => root.to_string(),
                            None => conflict.to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            last_error: item
                .get("lastError")
                .and_then(Value::as_str)
                .filter(|e| !e.is_empty())
                .map(str::to_string),
            labels: item
                .get("labels")
                .and_then(Value::as_object)
                .map(|labels| {
                    labels
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect())
}

#[derive(Debug, Default)]
struct Progress {
    state: String,
    conflicts: Vec<String>,
    last_error: Option<String>,
}

struct SessionShared {
    engine: Mutex<SyncEngine>,
    paused: AtomicBool,
    progress: Mutex<Progress>,
}

impl SessionShared {
    /// Runs one cycle and records its outcome.
    fn cycle(&self) -> Result<CycleReport> {
        let result = self
            .engine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cycle();

        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        match &result {
            Ok(report) => {
                progress.state = STATE_WATCHING.to_string();
                progress.conflicts = report.conflicts.clone();
                progress.last_error = None;
            }
            Err(e) => {
                progress.state = "halted".to_string();
                progress.last_error = Some(e.to_string());
            }
        }
        result
    }
}

async fn run_cycle(shared: Arc<SessionShared>) -> Result<CycleReport> {
    tokio::task::spawn_blocking(move || shared.cycle())
        .await
        .map_err(|e| DeployError::Sync(format!("sync cycle panicked: {}", e)))?
}

struct LocalSession {
    spec: SessionSpec,
    shared: Arc<SessionShared>,
    task: JoinHandle<()>,
    _watcher: Debouncer<RecommendedWatcher>,
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sessions between local directories, run in-process.
///
/// Container endpoints map to `<root>/<namespace>/<kind>-<name>/<container>/<path>`.
pub struct LocalBackend {
    container_root: PathBuf,
    debounce: Duration,
    sessions: Mutex<BTreeMap<String, LocalSession>>,
}

impl LocalBackend {
    pub fn new(container_root: impl Into<PathBuf>) -> Self {
        Self {
            container_root: container_root.into(),
            debounce: Duration::from_millis(200),
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Local directory standing in for a container path.
    pub fn container_dir(&self, target: &RemoteTarget) -> PathBuf {
        self.container_root
            .join(&target.namespace)
            .join(format!("{}-{}", target.kind.to_lowercase(), target.name))
            .join(&target.container)
            .join(target.container_path.trim_start_matches('/'))
    }

    fn shared(&self, identifier: &str) -> Result<Arc<SessionShared>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(identifier)
            .map(|s| Arc::clone(&s.shared))
            .ok_or_else(|| DeployError::NotFound(format!("sync session {}", identifier)))
    }

    fn watch(&self, shared: &Arc<SessionShared>, paths: &[&Path]) -> Result<(Debouncer<RecommendedWatcher>, JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut debouncer = new_debouncer(self.debounce, move |result: DebounceEventResult| {
            match result {
                Ok(_) => {
                    let _ = tx.send(());
                }
                Err(e) => log::warn!("Sync watch error: {:?}", e),
            }
        })
        .map_err(|e| DeployError::Sync(e.to_string()))?;

        for path in paths.iter().filter(|p| p.exists()) {
            debouncer
                .watcher()
                .watch(path, RecursiveMode::Recursive)
                .map_err(|e| DeployError::Sync(e.to_string()))?;
        }

        let shared = Arc::clone(shared);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Coalesce bursts into one cycle
                while rx.try_recv().is_ok() {}
                if shared.paused.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = run_cycle(Arc::clone(&shared)).await {
                    log::warn!("Sync cycle failed: {}", e);
                }
            }
        });

        Ok((debouncer, task))
    }
}

#[async_trait]
impl SyncBackend for LocalBackend {
    async fn ensure_daemon(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.container_root).await?;
        Ok(())
    }

    async fn create(&self, spec: &SessionSpec) -> Result<String> {
        let alpha = PathBuf::from(&spec.alpha);
        let beta = PathBuf::from(&spec.beta);
        // The container side always exists once the workload runs
        let container_side = if spec.mode.is_reverse() { &alpha } else { &beta };
        tokio::fs::create_dir_all(container_side).await?;

        let engine = SyncEngine::new(&alpha, &beta, spec.mode, &spec.ignore)?
            .with_modes(spec.default_file_mode, spec.default_directory_mode);
        let shared = Arc::new(SessionShared {
            engine: Mutex::new(engine),
            paused: AtomicBool::new(false),
            progress: Mutex::new(Progress {
                state: "connecting".to_string(),
                ..Default::default()
            }),
        });

        run_cycle(Arc::clone(&shared)).await?;
        let (watcher, task) = self.watch(&shared, &[alpha.as_path(), beta.as_path()])?;

        let identifier = format!("sync_{}", uuid::Uuid::new_v4().simple());
        log::debug!("Created local sync session {} ({})", spec.name, identifier);
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(
            identifier.clone(),
            LocalSession {
                spec: spec.clone(),
                shared,
                task,
                _watcher: watcher,
            },
        );
        Ok(identifier)
    }

    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<SessionStatus>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sessions
            .iter()
            .filter(|(_, s)| labels.iter().all(|(k, v)| s.spec.labels.get(k) == Some(v)))
            .map(|(identifier, session)| {
                let progress = session.shared.progress.lock().unwrap_or_else(|e| e.into_inner());
                SessionStatus {
                    identifier: identifier.clone(),
                    name: session.spec.name.clone(),
                    alpha: session.spec.alpha.clone(),
                    beta: session.spec.beta.clone(),
                    mode: session.spec.mode.to_string(),
                    paused: session.shared.paused.load(Ordering::SeqCst),
                    state: progress.state.clone(),
                    conflicts: progress.conflicts.clone(),
                    last_error: progress.last_error.clone(),
                    labels: session.spec.labels.clone(),
                }
            })
            .collect())
    }

    async fn pause(&self, identifier: &str) -> Result<()> {
        self.shared(identifier)?.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, identifier: &str) -> Result<()> {
        let shared = self.shared(identifier)?;
        shared.paused.store(false, Ordering::SeqCst);
        // Pick up whatever changed while paused
        run_cycle(shared).await?;
        Ok(())
    }

    async fn flush(&self, identifier: &str) -> Result<()> {
        let shared = self.shared(identifier)?;
        if shared.paused.load(Ordering::SeqCst) {
            return Err(DeployError::Sync(format!(
                "cannot flush paused session {}",
                identifier
            )));
        }
        run_cycle(shared).await?;
        Ok(())
    }

    async fn terminate(&self, identifier: &str) -> Result<()> {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(identifier)
        };
        match removed {
            Some(session) => {
                log::debug!("Terminated local sync session {}", session.spec.name);
                Ok(())
            }
            None => Err(DeployError::NotFound(format!("sync session {}", identifier))),
        }
    }

    fn endpoint(&self, target: &RemoteTarget) -> String {
        self.container_dir(target).display().to_string()
    }
}
