//! Loader for directories of `garden.io/v1` YAML documents.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::action::{DeployAction, KubernetesDeploySpec};
use super::provider::ProviderConfig;
use crate::error::{DeployError, Result};

/// API version accepted by the loader.
pub const API_VERSION: &str = "garden.io/v1";

/// Document kinds the loader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Provider,
    Deploy,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Provider => write!(f, "Provider"),
            ResourceKind::Deploy => write!(f, "Deploy"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMeta {
    #[serde(default)]
    pub name: String,
}

/// Header parsed first to decide how to parse the rest of a document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentHeader {
    api_version: String,
    kind: ResourceKind,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderDocument {
    api_version: String,
    kind: ResourceKind,
    #[serde(default)]
    metadata: DocumentMeta,
    #[serde(default)]
    spec: ProviderConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployDocument {
    api_version: String,
    kind: ResourceKind,
    metadata: DocumentMeta,
    #[serde(default)]
    spec: KubernetesDeploySpec,
}

/// Everything loaded from a configuration directory.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub provider: ProviderConfig,
    /// File the provider was declared in, relative to the config directory.
    pub provider_path: PathBuf,
    /// Deploy actions, sorted by name.
    pub deploys: Vec<DeployAction>,
}

impl LoadedConfig {
    pub fn deploy(&self, name: &str) -> Option<&DeployAction> {
        self.deploys.iter().find(|d| d.name == name)
    }
}

/// Loads provider and Deploy documents from a directory tree.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Loads all configuration from the config directory.
    pub fn load(&self) -> Result<LoadedConfig> {
        if !self.config_dir.exists() {
            return Err(DeployError::NotFound(format!(
                "configuration directory {}",
                self.config_dir.display()
            )));
        }

        let mut provider: Option<(ProviderConfig, PathBuf)> = None;
        let mut deploys: Vec<DeployAction> = Vec::new();

        for entry in WalkDir::new(&self.config_dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let relative = path.strip_prefix(&self.config_dir).unwrap_or(path);
            let hidden = relative.components().any(|c| {
                c.as_os_str()
                    .to_str()
                    .map(|s| s.starts_with('.'))
                    .unwrap_or(false)
            });
            if hidden {
                continue;
            }

            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext != "yaml" && ext != "yml" {
                continue;
            }

            let documents = self.load_file(path).inspect_err(|e| {
                log::warn!("Failed to load {}: {}", path.display(), e);
            })?;

            for document in documents {
                match document {
                    LoadedDocument::Provider(config) => {
                        if provider.is_some() {
                            return Err(DeployError::config(
                                "provider",
                                format!(
                                    "more than one Provider document found (second in {})",
                                    relative.display()
                                ),
                            ));
                        }
                        provider = Some((config, relative.to_path_buf()));
                    }
                    LoadedDocument::Deploy(action) => {
                        if deploys.iter().any(|d| d.name == action.name) {
                            return Err(DeployError::config(
                                &action.name,
                                format!(
                                    "Deploy '{}' is declared more than once (again in {})",
                                    action.name,
                                    relative.display()
                                ),
                            ));
                        }
                        deploys.push(action);
                    }
                }
            }
        }

        let (provider, provider_path) = provider.ok_or_else(|| {
            DeployError::config(
                "provider",
                format!("no Provider document found in {}", self.config_dir.display()),
            )
        })?;

        deploys.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(LoadedConfig {
            provider,
            provider_path,
            deploys,
        })
    }

    /// Loads every document in a single file.
    pub fn load_file(&self, path: &Path) -> Result<Vec<LoadedDocument>> {
        let content = fs::read_to_string(path).map_err(|e| DeployError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&content) {
            let value = serde_yaml::Value::deserialize(document).map_err(|e| parse_error(path, e))?;
            if value.is_null() {
                continue;
            }
            documents.push(self.parse_document(value, path)?);
        }
        Ok(documents)
    }

    /// Parses one YAML document declared in `path`.
    pub fn parse_document(&self, value: serde_yaml::Value, path: &Path) -> Result<LoadedDocument> {
        let header: DocumentHeader =
            serde_yaml::from_value(value.clone()).map_err(|e| parse_error(path, e))?;

        if header.api_version != API_VERSION {
            return Err(DeployError::ParseYaml {
                path: path.to_path_buf(),
                message: format!(
                    "invalid apiVersion '{}', expected '{}'",
                    header.api_version, API_VERSION
                ),
            });
        }

        match header.kind {
            ResourceKind::Provider => {
                let document: ProviderDocument =
                    serde_yaml::from_value(value).map_err(|e| parse_error(path, e))?;
                Ok(LoadedDocument::Provider(document.spec))
            }
            ResourceKind::Deploy => {
                let document: DeployDocument =
                    serde_yaml::from_value(value).map_err(|e| parse_error(path, e))?;
                if document.metadata.name.is_empty() {
                    return Err(DeployError::ParseYaml {
                        path: path.to_path_buf(),
                        message: "Deploy documents require metadata.name".to_string(),
                    });
                }
                let source_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
                let action = DeployAction::new(document.metadata.name, source_dir, document.spec)?
                    .with_config_path(path);
                Ok(LoadedDocument::Deploy(action))
            }
        }
    }
}

/// A parsed document.
#[derive(Debug, Clone)]
pub enum LoadedDocument {
    Provider(ProviderConfig),
    Deploy(DeployAction),
}

fn parse_error(path: &Path, err: serde_yaml::Error) -> DeployError {
    DeployError::ParseYaml {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
