//! Shared fixtures for kubedeploy integration tests.
//!
//! `TestHarness` wires a `Deployer` to an in-memory cluster and a local sync
//! backend rooted in a temp directory.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use kubedeploy::config::{DeployAction, DeployMode, KubernetesDeploySpec, ProviderConfig};
use kubedeploy::sync::{LocalBackend, RemoteTarget, SyncPathSpec, SyncSpec, TargetSpec};
use kubedeploy::{DeployContext, Deployer, InMemoryCluster, Manifest};

/// An isolated project directory, cluster and sync backend.
pub struct TestHarness {
    temp_dir: TempDir,
    /// Action source directory.
    pub project_dir: PathBuf,
    pub cluster: Arc<InMemoryCluster>,
    pub backend: Arc<LocalBackend>,
    pub deployer: Deployer,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_cluster(provider(), InMemoryCluster::new())
    }

    pub fn with_provider(provider: ProviderConfig) -> Self {
        Self::with_cluster(provider, InMemoryCluster::new())
    }

    pub fn with_cluster(provider: ProviderConfig, cluster: InMemoryCluster) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let project_dir = temp_dir.path().join("project");
        let container_root = temp_dir.path().join("containers");
        fs::create_dir_all(&project_dir).expect("Failed to create project directory");

        let cluster = Arc::new(cluster);
        let backend = Arc::new(LocalBackend::new(&container_root));
        let ctx = DeployContext::new(provider, cluster.clone());
        let deployer = Deployer::new(ctx, backend.clone());

        Self {
            temp_dir,
            project_dir,
            cluster,
            backend,
            deployer,
        }
    }

    pub fn ctx(&self) -> &DeployContext {
        self.deployer.context()
    }

    pub fn action(&self, name: &str, spec: KubernetesDeploySpec) -> DeployAction {
        DeployAction::new(name, &self.project_dir, spec).expect("Failed to create action")
    }

    /// A sync-mode action syncing the project directory into `api`'s `/app`.
    pub fn sync_action(&self, paths: Vec<SyncPathSpec>) -> DeployAction {
        let spec = KubernetesDeploySpec {
            manifests: vec![deployment("api", &["node", "index.js"])],
            sync: Some(SyncSpec {
                paths,
                overrides: vec![],
            }),
            default_target: Some(TargetSpec::workload("Deployment", "api")),
            ..Default::default()
        };
        self.action("api", spec).with_mode(DeployMode::Sync)
    }

    /// Writes a file below the project directory.
    pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.project_dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// Local directory standing in for `path` in the `main` container of Deployment `api`.
    pub fn container_dir(&self, path: &str) -> PathBuf {
        self.backend.container_dir(&RemoteTarget {
            namespace: self.ctx().provider.namespace.clone(),
            kind: "Deployment".into(),
            name: "api".into(),
            container: "main".into(),
            container_path: path.into(),
        })
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// Provider config with fast polling.
pub fn provider() -> ProviderConfig {
    ProviderConfig {
        status_poll_interval_ms: 20,
        sync_flush_timeout_secs: 10,
        ..Default::default()
    }
}

pub fn deployment(name: &str, args: &[&str]) -> Manifest {
    Manifest::new("apps/v1", "Deployment", name).with_field(
        "spec",
        json!({
            "replicas": 1,
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {"containers": [{"name": "main", "image": "busybox", "args": args}]},
            },
        }),
    )
}

pub fn config_map(name: &str, data: Value) -> Manifest {
    Manifest::new("v1", "ConfigMap", name).with_field("data", data)
}

pub fn namespace(name: &str) -> Manifest {
    Manifest::new("v1", "Namespace", name)
}

/// Relative paths of every file below `root`, sorted, with `/` separators.
pub fn list_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}
