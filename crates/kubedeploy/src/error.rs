//! Error types for deployment reconciliation and sync.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while resolving, checking, applying or syncing a deploy.
#[derive(Error, Debug)]
pub enum DeployError {
    /// Invalid user configuration. Never retried.
    #[error("Configuration error in {action}: {message}")]
    Configuration { action: String, message: String },

    /// The same `(kind, namespace, name)` was declared more than once.
    #[error("{0}")]
    DuplicateManifests(String),

    /// A resource failed to become healthy.
    #[error("Error deploying {action}: {message}{diagnostics}")]
    Deployment {
        action: String,
        resource: String,
        message: String,
        /// Pre-rendered events and failed-container logs, possibly empty.
        diagnostics: String,
    },

    /// An underlying tool (kubectl, helm, kustomize, mutagen) exited non-zero.
    #[error("Command '{command}' failed with exit code {exit_code}: {stderr}")]
    ChildProcess {
        command: String,
        exit_code: i32,
        stderr: String,
        stdout: String,
    },

    /// Cluster API error. `transient` marks network and throttling failures.
    #[error("Kubernetes API error: {message}")]
    Api { message: String, transient: bool },

    /// The API server does not serve the requested kind.
    #[error("Unrecognized resource type {api_version}/{kind}")]
    UnknownKind { api_version: String, kind: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Failed to read '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Failed to parse JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for DeployError {
    fn from(err: serde_yaml::Error) -> Self {
        DeployError::ParseYaml {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl DeployError {
    /// Shorthand for a configuration error attributed to an action.
    pub fn config(action: impl Into<String>, message: impl Into<String>) -> Self {
        DeployError::Configuration {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error is likely transient and the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeployError::Api {
                transient: true,
                ..
            } | DeployError::Timeout { .. }
        )
    }

    /// Returns true for "object does not exist" outcomes.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DeployError::NotFound(_))
    }
}

/// Classifies kubectl stderr into a more specific error variant.
pub fn classify_kubectl_error(command: &str, exit_code: i32, stderr: &str, stdout: &str) -> DeployError {
    let trimmed = stderr.trim();
    let lower = trimmed.to_lowercase();

    if lower.contains("the server doesn't have a resource type")
        || lower.contains("no matches for kind")
        || lower.contains("could not find the requested resource")
    {
        return DeployError::UnknownKind {
            api_version: String::new(),
            kind: extract_quoted(trimmed).unwrap_or_default(),
        };
    }

    if lower.contains("(notfound)") || lower.contains("not found") {
        return DeployError::NotFound(trimmed.to_string());
    }

    if lower.contains("connection refused")
        || lower.contains("i/o timeout")
        || lower.contains("tls handshake timeout")
        || lower.contains("unable to connect to the server")
        || lower.contains("too many requests")
        || lower.contains("(toomanyrequests)")
        || lower.contains("(serviceunavailable)")
        || lower.contains("etcdserver: request timed out")
    {
        return DeployError::Api {
            message: trimmed.to_string(),
            transient: true,
        };
    }

    DeployError::ChildProcess {
        command: command.to_string(),
        exit_code,
        stderr: trimmed.to_string(),
        stdout: stdout.trim().to_string(),
    }
}

fn extract_quoted(s: &str) -> Option<String> {
    let start = s.find('"')?;
    let rest = &s[start + 1..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Result type for deploy operations.
pub type Result<T> = std::result::Result<T, DeployError>;
