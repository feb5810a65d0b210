//! Collects the declared manifests of a Deploy action from all its origins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::chart::{self, ChartRender, ChartSpec};
use super::kustomize::{self, KustomizeSpec};
use super::resource::{flatten_lists, parse_manifests, Manifest};
use crate::config::{DeployAction, ProviderConfig};
use crate::error::{DeployError, Result};
use crate::lock::KeyedMutex;

/// Where a manifest was declared. Rendered into duplicate-manifest errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Inline {
        config_path: Option<PathBuf>,
        index: usize,
    },
    File {
        path: PathBuf,
        index: usize,
    },
    Kustomize {
        path: String,
        index: usize,
    },
    Chart {
        path: String,
        index: usize,
    },
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Inline { config_path, index } => write!(
                f,
                "declared inline in the Garden configuration (filename: {}, index: {})",
                config_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                index
            ),
            Provenance::File { path, index } => {
                write!(f, "declared in the file {} (index: {})", path.display(), index)
            }
            Provenance::Kustomize { path, index } => {
                write!(f, "generated by Kustomize at path {} (index: {})", path, index)
            }
            Provenance::Chart { path, index } => {
                write!(f, "rendered from the Helm chart at path {} (index: {})", path, index)
            }
        }
    }
}

/// A manifest together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredManifest {
    pub manifest: Manifest,
    pub provenance: Provenance,
}

/// One source of manifests for an action.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestOrigin {
    Inline {
        config_path: Option<PathBuf>,
        manifests: Vec<Manifest>,
    },
    Files {
        base_dir: PathBuf,
        patterns: Vec<String>,
    },
    Kustomize {
        base_dir: PathBuf,
        spec: KustomizeSpec,
    },
    Chart {
        base_dir: PathBuf,
        spec: ChartSpec,
    },
}

/// Tools and settings manifest origins need.
pub struct SourceContext<'a> {
    pub provider: &'a ProviderConfig,
    pub locks: &'a KeyedMutex,
    pub action: &'a str,
    pub namespace: &'a str,
    pub timeout: Option<Duration>,
}

impl ManifestOrigin {
    /// Resolves the origin into its manifests, `*List` kinds flattened.
    pub async fn resolve(&self, ctx: &SourceContext<'_>) -> Result<Vec<DeclaredManifest>> {
        match self {
            ManifestOrigin::Inline {
                config_path,
                manifests,
            } => declare(manifests.clone(), |index| Provenance::Inline {
                config_path: config_path.clone(),
                index,
            }),
            ManifestOrigin::Files { base_dir, patterns } => {
                let mut declared = Vec::new();
                for path in resolve_files(ctx.action, base_dir, patterns)? {
                    let content =
                        tokio::fs::read_to_string(&path)
                            .await
                            .map_err(|e| DeployError::ReadFile {
                                path: path.clone(),
                                source: e,
                            })?;
                    let relative = path.strip_prefix(base_dir).unwrap_or(&path).to_path_buf();
                    declared.extend(declare(parse_manifests(&content, &path)?, |index| {
                        Provenance::File {
                            path: relative.clone(),
                            index,
                        }
                    })?);
                }
                Ok(declared)
            }
            ManifestOrigin::Kustomize { base_dir, spec } => {
                let tool = ctx.provider.kustomize();
                let manifests = kustomize::build(&tool, ctx.action, base_dir, spec, ctx.timeout).await?;
                declare(manifests, |index| Provenance::Kustomize {
                    path: spec.path.clone(),
                    index,
                })
            }
            ManifestOrigin::Chart { base_dir, spec } => {
                let helm = ctx.provider.helm();
                let render = ChartRender {
                    helm: &helm,
                    locks: ctx.locks,
                    action: ctx.action,
                    namespace: ctx.namespace,
                    base_dir,
                    timeout: ctx.timeout,
                };
                let manifests = chart::render(&render, spec).await?;
                declare(manifests, |index| Provenance::Chart {
                    path: spec.path.clone(),
                    index,
                })
            }
        }
    }
}

/// Flattens `*List` documents, keeping each item's document index.
fn declare(
    manifests: Vec<Manifest>,
    provenance: impl Fn(usize) -> Provenance,
) -> Result<Vec<DeclaredManifest>> {
    let mut declared = Vec::new();
    for (index, manifest) in manifests.into_iter().enumerate() {
        for manifest in flatten_lists(vec![manifest])? {
            declared.push(DeclaredManifest {
                manifest,
                provenance: provenance(index),
            });
        }
    }
    Ok(declared)
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Resolves `spec.files` entries to existing files, in declaration order.
///
/// A missing explicit path is an error, as is a glob that matches nothing.
pub fn resolve_files(action: &str, base_dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = Vec::new();
    let mut missing: Vec<&str> = Vec::new();

    for pattern in patterns {
        let full = base_dir.join(pattern);
        if !is_glob(pattern) {
            if full.is_file() {
                if !files.contains(&full) {
                    files.push(full);
                }
            } else {
                missing.push(pattern);
            }
            continue;
        }

        let full_str = full.to_str().ok_or_else(|| {
            DeployError::config(action, format!("invalid file pattern '{}'", pattern))
        })?;
        let matches = glob::glob(full_str).map_err(|e| {
            DeployError::config(action, format!("invalid file pattern '{}': {}", pattern, e))
        })?;
        let matched: Vec<PathBuf> = matches
            .filter_map(|p| p.ok())
            .filter(|p| p.is_file())
            .collect();
        if matched.is_empty() {
            return Err(DeployError::config(
                action,
                format!("spec.files pattern '{}' did not match any files", pattern),
            ));
        }
        for path in matched {
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }

    if !missing.is_empty() {
        return Err(DeployError::config(
            action,
            format!(
                "Invalid manifest file path(s) declared in {}. Action spec.files includes files that do not exist: {}",
                action,
                missing.join(", ")
            ),
        ));
    }

    Ok(files)
}

/// The origins an action declares, in resolution order.
pub fn origins(action: &DeployAction, read_from_src_dir: bool) -> Vec<ManifestOrigin> {
    let base_dir = action.manifest_dir(read_from_src_dir).to_path_buf();
    let mut origins = Vec::new();

    if !action.spec.manifests.is_empty() {
        origins.push(ManifestOrigin::Inline {
            config_path: action.config_path.clone(),
            manifests: action.spec.manifests.clone(),
        });
    }
    if !action.spec.files.is_empty() {
        origins.push(ManifestOrigin::Files {
            base_dir: base_dir.clone(),
            patterns: action.spec.files.clone(),
        });
    }
    if let Some(spec) = &action.spec.kustomize {
        origins.push(ManifestOrigin::Kustomize {
            base_dir: base_dir.clone(),
            spec: spec.clone(),
        });
    }
    if let Some(spec) = &action.spec.chart {
        origins.push(ManifestOrigin::Chart {
            base_dir,
            spec: spec.clone(),
        });
    }
    origins
}

/// Fails if any `(kind, namespace, name)` is declared more than once.
///
/// Each clash lists its contributors, last declared first.
pub fn check_duplicates(
    action: &str,
    default_namespace: &str,
    declared: &[DeclaredManifest],
) -> Result<()> {
    let mut groups: BTreeMap<(String, Option<String>, String), Vec<usize>> = BTreeMap::new();
    let mut order: Vec<(String, Option<String>, String)> = Vec::new();

    for (i, d) in declared.iter().enumerate() {
        let key = (
            d.manifest.kind.clone(),
            d.manifest.namespace_or(default_namespace).map(str::to_string),
            d.manifest.name().to_string(),
        );
        let entry = groups.entry(key.clone()).or_default();
        if entry.is_empty() {
            order.push(key);
        }
        entry.push(i);
    }

    let messages: Vec<String> = order
        .iter()
        .filter_map(|key| {
            let members = groups.get(key)?;
            if members.len() < 2 {
                return None;
            }
            let (kind, _, name) = key;
            let lines: Vec<String> = members
                .iter()
                .rev()
                .map(|&i| format!("  - {} {} {}", kind, name, declared[i].provenance))
                .collect();
            Some(format!(
                "Duplicate manifest definition: {} named {} is declared more than once:\n{}",
                kind,
                name,
                lines.join("\n")
            ))
        })
        .collect();

    if messages.is_empty() {
        return Ok(());
    }

    Err(DeployError::DuplicateManifests(format!(
        "Configuration error in {}: {}",
        action,
        messages.join("\n\n")
    )))
}

/// Resolves every origin of an action and validates the combined set.
pub async fn get_declared_manifests(
    action: &DeployAction,
    provider: &ProviderConfig,
    locks: &KeyedMutex,
    read_from_src_dir: bool,
) -> Result<Vec<DeclaredManifest>> {
    let namespace = action.namespace(provider);
    let ctx = SourceContext {
        provider,
        locks,
        action: &action.name,
        namespace: &namespace,
        timeout: Some(action.timeout(provider)),
    };

    let mut declared = Vec::new();
    for origin in origins(action, read_from_src_dir) {
        declared.extend(origin.resolve(&ctx).await?);
    }

    check_duplicates(&action.name, &namespace, &declared)?;
    log::debug!("Resolved {} manifests for {}", declared.len(), action.name);
    Ok(declared)
}

/// Like [`get_declared_manifests`], without provenance.
pub async fn get_manifests(
    action: &DeployAction,
    provider: &ProviderConfig,
    locks: &KeyedMutex,
    read_from_src_dir: bool,
) -> Result<Vec<Manifest>> {
    Ok(get_declared_manifests(action, provider, locks, read_from_src_dir)
        .await?
        .into_iter()
        .map(|d| d.manifest)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KubernetesDeploySpec;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG_MAPS: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: a
---
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: b
  - apiVersion: v1
    kind: Secret
    metadata:
      name: c
"#;

    fn action_with(dir: &Path, spec: KubernetesDeploySpec) -> DeployAction {
        DeployAction::new("api", dir, spec)
            .unwrap()
            .with_config_path(dir.join("garden.yml"))
    }

    async fn resolve(action: &DeployAction) -> Result<Vec<DeclaredManifest>> {
        get_declared_manifests(action, &ProviderConfig::default(), &KeyedMutex::new(), true).await
    }

    #[tokio::test]
    async fn test_files_and_lists_are_flattened() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cm.yaml"), CONFIG_MAPS).unwrap();

        let action = action_with(
            dir.path(),
            KubernetesDeploySpec {
                files: vec!["cm.yaml".into()],
                ..Default::default()
            },
        );
        let declared = resolve(&action).await.unwrap();
        let keys: Vec<String> = declared.iter().map(|d| d.manifest.key()).collect();
        assert_eq!(keys, vec!["ConfigMap/a", "ConfigMap/b", "Secret/c"]);
        assert_eq!(
            declared[2].provenance,
            Provenance::File {
                path: PathBuf::from("cm.yaml"),
                index: 1
            }
        );
    }

    #[tokio::test]
    async fn test_missing_explicit_file() {
        let dir = TempDir::new().unwrap();
        let action = action_with(
            dir.path(),
            KubernetesDeploySpec {
                files: vec!["nope.yaml".into()],
                ..Default::default()
            },
        );
        let err = resolve(&action).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Invalid manifest file path(s) declared in api"));
        assert!(msg.contains("nope.yaml"));
    }

    #[tokio::test]
    async fn test_glob_matching_nothing() {
        let dir = TempDir::new().unwrap();
        let action = action_with(
            dir.path(),
            KubernetesDeploySpec {
                files: vec!["manifests/*.yaml".into()],
                ..Default::default()
            },
        );
        let err = resolve(&action).await.unwrap_err();
        assert!(err.to_string().contains("did not match any files"));
    }

    #[tokio::test]
    async fn test_glob_matches_in_order() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("manifests")).unwrap();
        fs::write(
            dir.path().join("manifests/b.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("manifests/a.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n",
        )
        .unwrap();

        let action = action_with(
            dir.path(),
            KubernetesDeploySpec {
                files: vec!["manifests/*.yaml".into(), "manifests/a.yaml".into()],
                ..Default::default()
            },
        );
        let keys: Vec<String> = resolve(&action)
            .await
            .unwrap()
            .iter()
            .map(|d| d.manifest.key())
            .collect();
        assert_eq!(keys, vec!["ConfigMap/a", "ConfigMap/b"]);
    }

    #[tokio::test]
    async fn test_duplicates_report_provenance_last_first() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("cm.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n",
        )
        .unwrap();

        let inline = Manifest::new("v1", "ConfigMap", "a").with_field("data", json!({"k": "v"}));
        let action = action_with(
            dir.path(),
            KubernetesDeploySpec {
                manifests: vec![inline],
                files: vec!["cm.yaml".into()],
                ..Default::default()
            },
        );
        let err = resolve(&action).await.unwrap_err();
        assert!(matches!(err, DeployError::DuplicateManifests(_)));

        let msg = err.to_string();
        let file_pos = msg.find("declared in the file cm.yaml (index: 0)").unwrap();
        let inline_pos = msg
            .find("declared inline in the Garden configuration (filename: ")
            .unwrap();
        assert!(file_pos < inline_pos);
        assert!(msg.contains("garden.yml, index: 0)"));
    }

    #[test]
    fn test_same_name_in_different_namespaces_is_fine() {
        let mut a = Manifest::new("v1", "ConfigMap", "a");
        a.metadata.namespace = Some("ns-1".into());
        let b = Manifest::new("v1", "ConfigMap", "a");
        let declared: Vec<DeclaredManifest> = [a, b]
            .into_iter()
            .enumerate()
            .map(|(index, manifest)| DeclaredManifest {
                manifest,
                provenance: Provenance::Inline {
                    config_path: None,
                    index,
                },
            })
            .collect();
        check_duplicates("api", "default", &declared).unwrap();
        assert!(check_duplicates("api", "ns-1", &declared).is_err());
    }

    #[tokio::test]
    async fn test_kustomize_args_rejected_before_running() {
        let dir = TempDir::new().unwrap();
        let action = action_with(
            dir.path(),
            KubernetesDeploySpec {
                kustomize: Some(KustomizeSpec {
                    path: ".".into(),
                    extra_args: vec!["--output".into(), "out".into()],
                }),
                ..Default::default()
            },
        );
        let err = resolve(&action).await.unwrap_err();
        assert!(matches!(err, DeployError::Configuration { .. }));
    }
}
