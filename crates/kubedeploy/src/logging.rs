//! Tracing subscriber setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{DeployError, Result};

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "human" | "text" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(DeployError::config(
                "logging",
                format!("unknown log format '{}', expected human or json", other),
            )),
        }
    }
}

/// Installs the global tracing subscriber and bridges `log` records into it.
///
/// `RUST_LOG` wins over `default_directive`. Returns `Ok(false)` if a global
/// subscriber was already installed.
pub fn init_tracing(format: LogFormat, default_directive: &str) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| DeployError::config("logging", e.to_string()))?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Human => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))
        }
        LogFormat::Json => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
        }
    };
    if installed.is_err() {
        return Ok(false);
    }

    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::debug!("log records are not bridged: {}", e);
    }
    Ok(true)
}
