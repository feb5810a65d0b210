//! Content hashing for applied manifests.
//!
//! The hash is the lowercase hex SHA-256 of the compact JSON form of the
//! manifest. `serde_json` maps are ordered, so the serialization is canonical
//! regardless of the order fields were declared in. Annotations written by
//! garden itself or by the cleanup agent, and fields populated by the API
//! server, are stripped first so that the hash only reflects user content.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::annotations::{AEC_CONFIG, AEC_STATUS, LAST_DEPLOYED, MANIFEST_HASH};
use super::resource::Manifest;
use crate::error::Result;

static RE_SHA256_HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{64}$").unwrap());

/// Annotations excluded from the hash input.
const UNHASHED_ANNOTATIONS: &[&str] = &[MANIFEST_HASH, AEC_CONFIG, AEC_STATUS, LAST_DEPLOYED];

/// Hashes arbitrary bytes to lowercase hex SHA-256.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Computes the content hash of a manifest.
pub fn manifest_hash(manifest: &Manifest) -> Result<String> {
    let mut normalized = manifest.without_server_fields();
    for key in UNHASHED_ANNOTATIONS {
        normalized.metadata.annotations.remove(*key);
    }

    let value: Value = normalized.to_value()?;
    let serialized = serde_json::to_string(&value)?;
    Ok(hash_bytes(serialized.as_bytes()))
}

/// Whether `value` has the shape of a hash produced by [`manifest_hash`].
pub fn is_valid_hash(value: &str) -> bool {
    RE_SHA256_HEX.is_match(value)
}

/// Sets the hash annotation on a manifest.
pub fn annotate_hash(manifest: &mut Manifest) -> Result<String> {
    let hash = manifest_hash(manifest)?;
    manifest.set_annotation(MANIFEST_HASH, hash.clone());
    Ok(hash)
}
