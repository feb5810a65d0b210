//! Manifest model, hashing and the origins manifests are declared in.

pub mod annotations;
pub mod chart;
pub mod hash;
pub mod kustomize;
pub mod resource;
pub mod source;

pub use hash::{annotate_hash, is_valid_hash, manifest_hash};
pub use resource::{flatten_lists, parse_manifests, Manifest, ObjectMeta, ResourceRef};
pub use source::{
    check_duplicates, get_declared_manifests, get_manifests, DeclaredManifest, ManifestOrigin,
    Provenance,
};
