pub mod apply;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod context;
pub mod deploy;
pub mod error;
pub mod events;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod metadata;
pub mod process;
pub mod status;
pub mod sync;

pub use apply::{apply, delete, prepare_manifests, ApplyOptions, ApplyResult, DeleteResult};
pub use cluster::{ClusterApi, ClusterEvent, InMemoryCluster, KubectlClient};
pub use commands::{sync_pause, sync_resume, sync_status, ActionSyncState, ActionSyncStatus};
pub use config::{ConfigLoader, DeployAction, DeployMode, KubernetesDeploySpec, ProviderConfig};
pub use context::DeployContext;
pub use deploy::{DeployOutcome, Deployer};
pub use error::{DeployError, Result};
pub use events::{DeployEvent, EventBroadcaster};
pub use logging::{init_tracing, LogFormat};
pub use manifest::{Manifest, ResourceRef};
pub use metadata::MetadataRecord;
pub use status::{get_status, DeployState, DeployStatus};
pub use sync::{LocalBackend, MutagenBackend, SessionManager, SyncBackend, SyncMode};
