//! Provider configuration and Deploy action declarations.

pub mod action;
pub mod loader;
pub mod provider;

pub use action::{
    compute_version, DeployAction, DeployMode, DeploymentIdentity, KubernetesDeploySpec,
    LocalModeSpec, LocalPortSpec,
};
pub use loader::{ConfigLoader, LoadedConfig, LoadedDocument, API_VERSION};
pub use provider::{ProviderConfig, SecretRef, SyncProviderConfig, DEFAULT_SYNC_UTIL_IMAGE};
