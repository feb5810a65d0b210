//! Resolved kubernetes Deploy actions.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::provider::ProviderConfig;
use crate::error::{DeployError, Result};
use crate::manifest::chart::ChartSpec;
use crate::manifest::hash::hash_bytes;
use crate::manifest::kustomize::KustomizeSpec;
use crate::manifest::resource::Manifest;
use crate::sync::spec::{SyncSpec, TargetSpec};

/// Runtime variant of a deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    #[default]
    Default,
    Sync,
    Local,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::Default => "default",
            DeployMode::Sync => "sync",
            DeployMode::Local => "local",
        }
    }
}

impl std::fmt::Display for DeployMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeployMode {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(DeployMode::Default),
            "sync" => Ok(DeployMode::Sync),
            "local" => Ok(DeployMode::Local),
            other => Err(DeployError::config(
                "deploy",
                format!("unknown deploy mode '{}'", other),
            )),
        }
    }
}

/// A port forwarded from the cluster to a local process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalPortSpec {
    pub local: u16,
    pub remote: u16,
}

/// The `localMode` block of a kubernetes Deploy action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalModeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetSpec>,
    #[serde(default)]
    pub ports: Vec<LocalPortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

fn default_wait() -> bool {
    true
}

/// The `spec` of a kubernetes Deploy action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesDeploySpec {
    /// Overrides the provider namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Manifests declared inline.
    #[serde(default)]
    pub manifests: Vec<Manifest>,

    /// Manifest file paths or glob patterns, relative to the action directory.
    #[serde(default)]
    pub files: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomize: Option<KustomizeSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_mode: Option<LocalModeSpec>,

    /// Target used by sync paths and overrides that name none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_target: Option<TargetSpec>,

    /// Deploy timeout in seconds. Falls back to the provider setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Roll back everything this deploy applied if it fails.
    #[serde(default)]
    pub atomic: bool,

    /// Wait for workloads to become healthy before returning.
    #[serde(default = "default_wait")]
    pub wait: bool,
}

impl Default for KubernetesDeploySpec {
    fn default() -> Self {
        Self {
            namespace: None,
            manifests: Vec::new(),
            files: Vec::new(),
            kustomize: None,
            chart: None,
            sync: None,
            local_mode: None,
            default_target: None,
            timeout: None,
            atomic: false,
            wait: true,
        }
    }
}

/// `(actionName, namespace, resolvedVersion, mode)`, fixed for one deploy attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentIdentity {
    pub action_name: String,
    pub namespace: String,
    pub resolved_version: String,
    pub mode: DeployMode,
}

/// A Deploy action with its configuration fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployAction {
    pub name: String,
    /// Content version over the spec and the files it references.
    pub version: String,
    pub source_dir: PathBuf,
    /// Staged build directory. Manifests are read from here unless told otherwise.
    pub build_dir: Option<PathBuf>,
    /// File the action was declared in, if any.
    pub config_path: Option<PathBuf>,
    pub mode: DeployMode,
    pub spec: KubernetesDeploySpec,
}

impl DeployAction {
    /// Creates an action and computes its version.
    pub fn new(
        name: impl Into<String>,
        source_dir: impl Into<PathBuf>,
        spec: KubernetesDeploySpec,
    ) -> Result<Self> {
        let source_dir = source_dir.into();
        let version = compute_version(&spec, &source_dir)?;
        Ok(Self {
            name: name.into(),
            version,
            source_dir,
            build_dir: None,
            config_path: None,
            mode: DeployMode::Default,
            spec,
        })
    }

    pub fn with_mode(mut self, mode: DeployMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_build_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.build_dir = Some(path.into());
        self
    }

    /// Overrides the computed version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Namespace this action deploys into.
    pub fn namespace(&self, provider: &ProviderConfig) -> String {
        self.spec
            .namespace
            .clone()
            .unwrap_or_else(|| provider.namespace.clone())
    }

    pub fn timeout(&self, provider: &ProviderConfig) -> Duration {
        self.spec
            .timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| provider.deploy_timeout())
    }

    /// Directory that manifest files and charts are resolved against.
    pub fn manifest_dir(&self, read_from_src_dir: bool) -> &Path {
        match (&self.build_dir, read_from_src_dir) {
            (Some(build_dir), false) => build_dir,
            _ => &self.source_dir,
        }
    }

    pub fn identity(&self, provider: &ProviderConfig) -> DeploymentIdentity {
        DeploymentIdentity {
            action_name: self.name.clone(),
            namespace: self.namespace(provider),
            resolved_version: self.version.clone(),
            mode: self.effective_mode(),
        }
    }

    /// The requested mode, or `Default` if the action has nothing to configure it with.
    pub fn effective_mode(&self) -> DeployMode {
        if self.supports_mode(self.mode) {
            self.mode
        } else {
            DeployMode::Default
        }
    }

    /// Whether the action declares anything for `mode` to act on.
    pub fn supports_mode(&self, mode: DeployMode) -> bool {
        match mode {
            DeployMode::Default => true,
            DeployMode::Sync => self.spec.sync.is_some(),
            DeployMode::Local => self.spec.local_mode.is_some(),
        }
    }
}

/// Kustomization fields that may point at other local directories.
const KUSTOMIZE_REFERENCES: &[&str] = &["resources", "bases", "components"];

/// Hashes the action spec together with every file it renders from.
///
/// Inputs are the `files` globs, the chart directory and its value files, and
/// the kustomization directory with any local bases it references. Paths are
/// hashed relative to `source_dir`. Files that do not exist are skipped here;
/// manifest resolution reports them.
pub fn compute_version(spec: &KubernetesDeploySpec, source_dir: &Path) -> Result<String> {
    let mut inputs: BTreeSet<PathBuf> = BTreeSet::new();

    for pattern in &spec.files {
        collect_glob(&source_dir.join(pattern), &mut inputs);
    }
    if let Some(chart) = &spec.chart {
        collect_dir(&source_dir.join(&chart.path), &mut inputs);
        for file in &chart.value_files {
            collect_glob(&source_dir.join(file), &mut inputs);
        }
    }
    if let Some(kustomize) = &spec.kustomize {
        let mut visited = BTreeSet::new();
        collect_kustomization(&source_dir.join(&kustomize.path), &mut visited, &mut inputs);
    }

    let mut input = serde_json::to_vec(spec)?;
    for path in &inputs {
        let Ok(content) = std::fs::read(path) else {
            continue;
        };
        let relative = path.strip_prefix(source_dir).unwrap_or(path);
        input.extend_from_slice(relative.to_string_lossy().replace('\\', "/").as_bytes());
        input.push(0);
        input.extend_from_slice(&content);
    }

    let digest = hash_bytes(&input);
    Ok(format!("v-{}", &digest[..10]))
}

fn collect_glob(pattern: &Path, inputs: &mut BTreeSet<PathBuf>) {
    let Some(pattern) = pattern.to_str() else {
        return;
    };
    let Ok(paths) = glob::glob(pattern) else {
        return;
    };
    for path in paths.filter_map(|p| p.ok()) {
        if path.is_dir() {
            collect_dir(&path, inputs);
        } else {
            inputs.insert(path);
        }
    }
}

/// Every file below `dir`, skipping hidden entries.
fn collect_dir(dir: &Path, inputs: &mut BTreeSet<PathBuf>) {
    let files = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path());
    inputs.extend(files);
}

/// Files of a kustomization directory plus the local directories it references.
fn collect_kustomization(dir: &Path, visited: &mut BTreeSet<PathBuf>, inputs: &mut BTreeSet<PathBuf>) {
    let key = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir.is_dir() || !visited.insert(key) {
        return;
    }
    collect_dir(dir, inputs);

    let kustomization = ["kustomization.yaml", "kustomization.yml", "Kustomization"]
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file());
    let Some(content) = kustomization.and_then(|path| std::fs::read_to_string(path).ok()) else {
        return;
    };
    let Ok(document) = serde_yaml::from_str::<serde_yaml::Value>(&content) else {
        return;
    };

    for field in KUSTOMIZE_REFERENCES {
        let Some(entries) = document.get(*field).and_then(|v| v.as_sequence()) else {
            continue;
        };
        for entry in entries.iter().filter_map(|e| e.as_str()) {
            let referenced = dir.join(entry);
            if referenced.is_dir() {
                collect_kustomization(&referenced, visited, inputs);
            }
        }
    }
}
