//! Annotation and label keys shared with other garden tooling.
//!
//! These are wire contracts: the cleanup agent and older releases read them.

/// Runtime mode of a deployed workload: `default`, `sync` or `local`.
pub const MODE: &str = "garden.io/mode";

/// Content hash of the manifest as last applied.
pub const MANIFEST_HASH: &str = "garden.io/manifest-hash";

/// Automatic environment cleanup configuration (owned by the cleanup agent).
pub const AEC_CONFIG: &str = "garden.io/aec-config";

/// Automatic environment cleanup status (owned by the cleanup agent).
pub const AEC_STATUS: &str = "garden.io/aec-status";

/// Timestamp of the last deploy into a namespace.
pub const LAST_DEPLOYED: &str = "garden.io/last-deployed";

/// Label on objects created for an action.
pub const ACTION_NAME_LABEL: &str = "garden.io/action-name";

/// Label on metadata records.
pub const METADATA_LABEL: &str = "garden.io/metadata";

/// Returns true for annotations that must survive a re-apply untouched.
pub fn is_preserved(key: &str) -> bool {
    key.starts_with("garden.io/aec-") || key == LAST_DEPLOYED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preserved_annotations() {
        assert!(is_preserved(AEC_CONFIG));
        assert!(is_preserved(AEC_STATUS));
        assert!(is_preserved(LAST_DEPLOYED));
        assert!(!is_preserved(MODE));
        assert!(!is_preserved(MANIFEST_HASH));
    }
}
