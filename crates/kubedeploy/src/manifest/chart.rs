//! Manifests rendered from a Helm chart with `helm template`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::resource::{parse_manifests, Manifest};
use crate::error::{DeployError, Result};
use crate::lock::KeyedMutex;
use crate::process::Tool;

/// The `chart` block of a kubernetes Deploy action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    /// Chart directory, relative to the action directory.
    pub path: String,
    /// Defaults to the action name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    /// Inline values, written to a temporary values file.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub values: Value,
    /// Additional values files, relative to the action directory.
    #[serde(default)]
    pub value_files: Vec<String>,
}

impl ChartSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            release_name: None,
            values: Value::Null,
            value_files: Vec::new(),
        }
    }
}

/// Everything needed to render a chart.
pub struct ChartRender<'a> {
    pub helm: &'a Tool,
    pub locks: &'a KeyedMutex,
    pub action: &'a str,
    pub namespace: &'a str,
    pub base_dir: &'a Path,
    pub timeout: Option<Duration>,
}

/// Whether the chart declares dependencies that have not been fetched yet.
pub async fn needs_dependency_update(chart_path: &Path) -> Result<bool> {
    let chart_file = chart_path.join("Chart.yaml");
    let content = tokio::fs::read_to_string(&chart_file).await.map_err(|e| DeployError::ReadFile {
        path: chart_file.clone(),
        source: e,
    })?;
    let chart: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| DeployError::ParseYaml {
            path: chart_file,
            message: e.to_string(),
        })?;

    let has_dependencies = chart
        .get("dependencies")
        .and_then(|d| d.as_sequence())
        .is_some_and(|d| !d.is_empty());
    if !has_dependencies {
        return Ok(false);
    }

    let charts_dir = chart_path.join("charts");
    let fetched = match tokio::fs::read_dir(&charts_dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    };
    Ok(!fetched)
}

/// Fetches chart dependencies, at most once per chart path at a time.
async fn update_dependencies(ctx: &ChartRender<'_>, chart_path: &Path) -> Result<()> {
    if !needs_dependency_update(chart_path).await? {
        return Ok(());
    }

    let key = format!("helm-dependencies:{}", chart_path.display());
    let _guard = ctx.locks.lock(&key).await;

    // Another deploy may have fetched them while we waited
    if !needs_dependency_update(chart_path).await? {
        return Ok(());
    }

    log::info!("Updating chart dependencies for {}", chart_path.display());
    let args = vec![
        "dependency".to_string(),
        "update".to_string(),
        chart_path.display().to_string(),
    ];
    ctx.helm.exec(&args, None, ctx.timeout).await?;
    Ok(())
}

/// Renders the chart to manifests.
pub async fn render(ctx: &ChartRender<'_>, spec: &ChartSpec) -> Result<Vec<Manifest>> {
    let chart_path: PathBuf = ctx.base_dir.join(&spec.path);
    if !chart_path.join("Chart.yaml").is_file() {
        return Err(DeployError::config(
            ctx.action,
            format!("no Chart.yaml found at chart path {}", chart_path.display()),
        ));
    }

    update_dependencies(ctx, &chart_path).await?;

    let release = spec.release_name.as_deref().unwrap_or(ctx.action);
    let mut args = vec![
        "template".to_string(),
        release.to_string(),
        chart_path.display().to_string(),
        "--namespace".to_string(),
        ctx.namespace.to_string(),
    ];
    for file in &spec.value_files {
        args.push("--values".to_string());
        args.push(ctx.base_dir.join(file).display().to_string());
    }

    // Kept alive until helm has read it
    let mut values_file = None;
    if !spec.values.is_null() {
        let mut file = tempfile::Builder::new()
            .prefix("garden-values-")
            .suffix(".yaml")
            .tempfile()?;
        let yaml = serde_yaml::to_string(&spec.values)?;
        file.write_all(yaml.as_bytes())?;
        file.flush()?;
        args.push("--values".to_string());
        args.push(file.path().display().to_string());
        values_file = Some(file);
    }

    let output = ctx.helm.exec(&args, None, ctx.timeout).await?;
    drop(values_file);

    parse_manifests(&output, &chart_path)
}
