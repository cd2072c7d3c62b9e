//! Error taxonomy for tree construction, navigation, and snapshots.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StepError>;

/// Everything that can go wrong while building, navigating, or restoring a
/// step tree.
///
/// Duplicate rows in bulk `append` are *not* an error: they are skipped per
/// item with a logged warning. `DuplicateId` is reserved for single inserts
/// and renames, where the caller named the id explicitly.
#[derive(Debug, Error)]
pub enum StepError {
    /// A child with this id already exists under the named parent.
    #[error("duplicate child id {id:?} under {parent:?}")]
    DuplicateId { parent: String, id: String },

    /// Ids are path segments and may not contain the separator.
    #[error("invalid id {id:?}: ids may not contain '/'")]
    InvalidId { id: String },

    /// A path segment matched no child while walking the tree.
    #[error("invalid path {path:?}: no child {segment:?}")]
    InvalidPath { path: String, segment: String },

    /// A bulk operation would push the child count past the configured cap.
    /// Raised before any child is created.
    #[error("{requested} rows would exceed the configured maximum of {max_rows}")]
    CapacityExceeded { requested: usize, max_rows: usize },

    /// A snapshot failed validation. Every missing or mismatched field is
    /// listed, not just the first one found.
    #[error("malformed snapshot: {}", .violations.join("; "))]
    Snapshot { violations: Vec<String> },

    /// Snapshot text was not valid JSON, or could not be written as JSON.
    #[error("snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An operation needed a parameter that was not supplied.
    #[error("missing parameter `{name}`: {hint}")]
    MissingParameter { name: &'static str, hint: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_error_lists_every_violation() {
        let err = StepError::Snapshot {
            violations: vec![
                "missing required field `id`".into(),
                "`cursor` must be a number".into(),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("missing required field `id`"));
        assert!(text.contains("`cursor` must be a number"));
    }

    #[test]
    fn capacity_error_names_both_sides() {
        let err = StepError::CapacityExceeded {
            requested: 2500,
            max_rows: 1000,
        };
        assert_eq!(
            err.to_string(),
            "2500 rows would exceed the configured maximum of 1000"
        );
    }
}
