//! User-facing sync configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default permission bits for files created by sync.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default permission bits for directories created by sync.
pub const DEFAULT_DIRECTORY_MODE: u32 = 0o755;

/// Paths that are never synced, whatever the configuration says.
pub const BUILTIN_EXCLUDES: &[&str] = &[".garden", ".git"];

/// Direction and conflict semantics of a sync path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncMode {
    /// Local to container; files created in the container are left alone.
    #[default]
    #[serde(rename = "one-way", alias = "one-way-safe")]
    OneWay,
    /// Local to container; the container side mirrors the local side exactly.
    #[serde(rename = "one-way-replica")]
    OneWayReplica,
    /// Container to local.
    #[serde(rename = "one-way-reverse")]
    OneWayReverse,
    /// Container to local, mirroring exactly.
    #[serde(rename = "one-way-replica-reverse")]
    OneWayReplicaReverse,
    /// Both directions; modifications are never lost to deletions.
    #[serde(rename = "two-way", alias = "two-way-safe")]
    TwoWay,
    /// Both directions; the local side wins every conflict.
    #[serde(rename = "two-way-resolved")]
    TwoWayResolved,
}

impl SyncMode {
    /// The equivalent mutagen `--sync-mode` value.
    pub fn mutagen_mode(&self) -> &'static str {
        match self {
            SyncMode::OneWay | SyncMode::OneWayReverse => "one-way-safe",
            SyncMode::OneWayReplica | SyncMode::OneWayReplicaReverse => "one-way-replica",
            SyncMode::TwoWay => "two-way-safe",
            SyncMode::TwoWayResolved => "two-way-resolved",
        }
    }

    /// Reverse modes use the container as the alpha (source) endpoint.
    pub fn is_reverse(&self) -> bool {
        matches!(self, SyncMode::OneWayReverse | SyncMode::OneWayReplicaReverse)
    }

    pub fn is_two_way(&self) -> bool {
        matches!(self, SyncMode::TwoWay | SyncMode::TwoWayResolved)
    }

    pub fn is_replica(&self) -> bool {
        matches!(self, SyncMode::OneWayReplica | SyncMode::OneWayReplicaReverse)
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::OneWay => write!(f, "one-way"),
            SyncMode::OneWayReplica => write!(f, "one-way-replica"),
            SyncMode::OneWayReverse => write!(f, "one-way-reverse"),
            SyncMode::OneWayReplicaReverse => write!(f, "one-way-replica-reverse"),
            SyncMode::TwoWay => write!(f, "two-way"),
            SyncMode::TwoWayResolved => write!(f, "two-way-resolved"),
        }
    }
}

/// A user or group, by numeric id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ownership {
    Id(u32),
    Name(String),
}

impl std::fmt::Display for Ownership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ownership::Id(id) => write!(f, "id:{}", id),
            Ownership::Name(name) => write!(f, "{}", name),
        }
    }
}

/// The workload a sync path or override applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<BTreeMap<String, String>>,
    /// Container within the pod. Defaults to the first container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

impl TargetSpec {
    pub fn workload(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn selector(labels: BTreeMap<String, String>) -> Self {
        Self {
            pod_selector: Some(labels),
            ..Default::default()
        }
    }

    /// Whether the target names a workload or a non-empty pod selector.
    pub fn is_specified(&self) -> bool {
        (self.kind.is_some() && self.name.is_some())
            || self.pod_selector.as_ref().is_some_and(|s| !s.is_empty())
    }
}

impl std::fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.kind, &self.name, &self.pod_selector) {
            (Some(kind), Some(name), _) => write!(f, "{}/{}", kind, name),
            (_, _, Some(selector)) => {
                let pairs: Vec<String> = selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "pods matching {}", pairs.join(","))
            }
            _ => write!(f, "<unspecified>"),
        }
    }
}

fn default_source() -> String {
    ".".to_string()
}

/// One local path synced into a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPathSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetSpec>,

    /// Local path, relative to the action source directory.
    #[serde(default = "default_source", alias = "sourcePath")]
    pub source: String,

    /// Absolute path in the container.
    pub container_path: String,

    #[serde(default)]
    pub mode: SyncMode,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_file_mode: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_directory_mode: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_owner: Option<Ownership>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_group: Option<Ownership>,
}

impl SyncPathSpec {
    pub fn new(source: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            target: None,
            source: source.into(),
            container_path: container_path.into(),
            mode: SyncMode::default(),
            exclude: Vec::new(),
            default_file_mode: None,
            default_directory_mode: None,
            default_owner: None,
            default_group: None,
        }
    }
}

/// Replaces the command, args or image of a container while syncing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// The `sync` block of a kubernetes Deploy action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    #[serde(default)]
    pub paths: Vec<SyncPathSpec>,
    #[serde(default)]
    pub overrides: Vec<SyncOverride>,
}

/// Provider-level defaults merged into every sync path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDefaults {
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Ownership>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Ownership>,
}

/// A sync path with defaults applied and its source made absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSyncPath {
    pub source_path: PathBuf,
    pub container_path: String,
    pub mode: SyncMode,
    pub exclude: Vec<String>,
    pub default_file_mode: u32,
    pub default_directory_mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_owner: Option<Ownership>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_group: Option<Ownership>,
}

impl ResolvedSyncPath {
    /// Merges a path spec with provider defaults.
    pub fn resolve(spec: &SyncPathSpec, defaults: &SyncDefaults, source_dir: &Path) -> Self {
        let source = Path::new(&spec.source);
        let source_path = if source.is_absolute() {
            source.to_path_buf()
        } else {
            source_dir.join(source)
        };

        Self {
            source_path,
            container_path: spec.container_path.clone(),
            mode: spec.mode,
            exclude: merge_excludes(&spec.exclude, &defaults.exclude),
            default_file_mode: spec
                .default_file_mode
                .or(defaults.file_mode)
                .unwrap_or(DEFAULT_FILE_MODE),
            default_directory_mode: spec
                .default_directory_mode
                .or(defaults.directory_mode)
                .unwrap_or(DEFAULT_DIRECTORY_MODE),
            default_owner: spec.default_owner.clone().or_else(|| defaults.owner.clone()),
            default_group: spec.default_group.clone().or_else(|| defaults.group.clone()),
        }
    }
}

/// Union of built-in, provider-level and path-level excludes, first occurrence wins.
pub fn merge_excludes(path_excludes: &[String], default_excludes: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let all = BUILTIN_EXCLUDES
        .iter()
        .map(|s| s.to_string())
        .chain(default_excludes.iter().cloned())
        .chain(path_excludes.iter().cloned());
    for pattern in all {
        if !merged.contains(&pattern) {
            merged.push(pattern);
        }
    }
    merged
}
