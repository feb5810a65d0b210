//! Sync mode: workload rewriting, sync sessions and the native sync engine.

pub mod backend;
pub mod configure;
pub mod engine;
pub mod session;
pub mod spec;

pub use backend::{LocalBackend, MutagenBackend, RemoteTarget, SessionSpec, SessionStatus, SyncBackend};
pub use configure::{configure_local_mode, configure_sync_mode, resolve_target, ConfiguredManifests};
pub use engine::{CycleReport, ExcludeMatcher, SyncEngine};
pub use session::{session_name, SessionManager};
pub use spec::{Ownership, ResolvedSyncPath, SyncDefaults, SyncMode, SyncOverride, SyncPathSpec, SyncSpec, TargetSpec};
