//! Kubernetes provider configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};
use crate::process::Tool;
use crate::sync::spec::SyncDefaults;

/// Image that carries the sync agent binary copied into workloads.
pub const DEFAULT_SYNC_UTIL_IMAGE: &str = "gardendev/k8s-sync:0.1.5";

/// A reference to an image pull secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Provider-level sync settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProviderConfig {
    #[serde(default)]
    pub defaults: SyncDefaults,
}

/// Configuration of the kubernetes provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Namespace deploys go to unless an action overrides it.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Project name recorded in metadata records.
    #[serde(default = "default_project_name")]
    pub project_name: String,

    /// kubectl context. The current context is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default = "default_kubectl")]
    pub kubectl_path: PathBuf,

    #[serde(default = "default_helm")]
    pub helm_path: PathBuf,

    #[serde(default = "default_kustomize")]
    pub kustomize_path: PathBuf,

    #[serde(default = "default_mutagen")]
    pub mutagen_path: PathBuf,

    /// Secrets appended to the `imagePullSecrets` of rewritten workloads.
    #[serde(default)]
    pub image_pull_secrets: Vec<SecretRef>,

    #[serde(default)]
    pub sync: SyncProviderConfig,

    #[serde(default = "default_sync_util_image")]
    pub sync_util_image: String,

    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,

    #[serde(default = "default_flush_timeout")]
    pub sync_flush_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub status_poll_interval_ms: u64,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_project_name() -> String {
    "garden".to_string()
}

fn default_kubectl() -> PathBuf {
    PathBuf::from("kubectl")
}

fn default_helm() -> PathBuf {
    PathBuf::from("helm")
}

fn default_kustomize() -> PathBuf {
    PathBuf::from("kustomize")
}

fn default_mutagen() -> PathBuf {
    PathBuf::from("mutagen")
}

fn default_sync_util_image() -> String {
    DEFAULT_SYNC_UTIL_IMAGE.to_string()
}

fn default_deploy_timeout() -> u64 {
    300
}

fn default_flush_timeout() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    2000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            project_name: default_project_name(),
            context: None,
            kubectl_path: default_kubectl(),
            helm_path: default_helm(),
            kustomize_path: default_kustomize(),
            mutagen_path: default_mutagen(),
            image_pull_secrets: Vec::new(),
            sync: SyncProviderConfig::default(),
            sync_util_image: default_sync_util_image(),
            deploy_timeout_secs: default_deploy_timeout(),
            sync_flush_timeout_secs: default_flush_timeout(),
            status_poll_interval_ms: default_poll_interval(),
        }
    }
}

impl ProviderConfig {
    /// Loads provider configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| DeployError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&content).map_err(|e| DeployError::ParseYaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Parses provider configuration from YAML.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }

    pub fn sync_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_flush_timeout_secs)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    /// kubectl, with `--context` applied when configured.
    pub fn kubectl(&self) -> Tool {
        let tool = Tool::new(&self.kubectl_path);
        match &self.context {
            Some(context) => tool.with_base_arg(format!("--context={}", context)),
            None => tool,
        }
    }

    /// helm, with `--kube-context` applied when configured.
    pub fn helm(&self) -> Tool {
        let tool = Tool::new(&self.helm_path);
        match &self.context {
            Some(context) => tool.with_base_arg(format!("--kube-context={}", context)),
            None => tool,
        }
    }

    pub fn kustomize(&self) -> Tool {
        Tool::new(&self.kustomize_path)
    }

    /// mutagen, with its data directory kept under the user's home.
    pub fn mutagen(&self) -> Tool {
        let tool = Tool::new(&self.mutagen_path);
        match dirs::home_dir() {
            Some(home) => tool.with_env(
                "MUTAGEN_DATA_DIRECTORY",
                home.join(".garden").join("mutagen").display().to_string(),
            ),
            None => tool,
        }
    }
}
