//! Manifests generated by `kustomize build`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::resource::{parse_manifests, Manifest};
use crate::error::{DeployError, Result};
use crate::process::Tool;

/// Arguments that would change where or whether kustomize writes its output.
const FORBIDDEN_ARGS: &[&str] = &["-o", "--output", "-h", "--help"];

fn default_path() -> String {
    ".".to_string()
}

/// The `kustomize` block of a kubernetes Deploy action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizeSpec {
    /// Directory containing the kustomization, relative to the action directory.
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for KustomizeSpec {
    fn default() -> Self {
        Self {
            path: default_path(),
            extra_args: Vec::new(),
        }
    }
}

fn is_forbidden(arg: &str) -> bool {
    FORBIDDEN_ARGS.contains(&arg)
        || arg.starts_with("--output=")
        || (arg.starts_with("-o") && !arg.starts_with("--"))
}

/// Rejects extra args that conflict with reading the build from stdout.
pub fn validate_extra_args(action: &str, args: &[String]) -> Result<()> {
    if let Some(bad) = args.iter().find(|a| is_forbidden(a)) {
        return Err(DeployError::config(
            action,
            format!(
                "kustomize.extraArgs must not include any of {} (found '{}')",
                FORBIDDEN_ARGS.join(", "),
                bad
            ),
        ));
    }
    Ok(())
}

/// Runs `kustomize build` and parses its output.
pub async fn build(
    kustomize: &Tool,
    action: &str,
    base_dir: &Path,
    spec: &KustomizeSpec,
    timeout: Option<Duration>,
) -> Result<Vec<Manifest>> {
    validate_extra_args(action, &spec.extra_args)?;

    let path = base_dir.join(&spec.path);
    let mut args = vec!["build".to_string(), path.display().to_string()];
    args.extend(spec.extra_args.iter().cloned());

    log::debug!("Building kustomization at {}", path.display());
    let output = kustomize.exec(&args, None, timeout).await?;
    parse_manifests(&output, &path)
}
