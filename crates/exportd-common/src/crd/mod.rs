//! Custom resource definitions for the exportd control plane.
//!
//! Three kinds make up the API surface:
//! - [`NfsExport`] — namespaced user request for a point-in-time export
//! - [`NfsExportContent`] — cluster-scoped representation of an export on the
//!   storage backend
//! - [`NfsExportClass`] — per-driver parameter template with an optional
//!   default flag
//!
//! `NfsExport.status.boundContentName` and `NfsExportContent.spec.exportRef`
//! form a bidirectional binding. Consumers must verify both directions before
//! trusting either object.

mod class;
mod content;
mod export;

pub use class::{NfsExportClass, NfsExportClassSpec};
pub use content::{
    ContentSource, ExportRef, NfsExportContent, NfsExportContentSpec, NfsExportContentStatus,
};
pub use export::{ExportError, NfsExport, NfsExportSource, NfsExportSpec, NfsExportStatus};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// End-of-life policy for a [`NfsExportContent`] and its backing export.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// The content object and the physical export are removed together.
    Delete,
    /// The content object may be removed; the physical export is kept.
    Retain,
}

impl DeletionPolicy {
    /// Label value used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "Delete",
            Self::Retain => "Retain",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_policy_serializes_as_pascal_case() {
        assert_eq!(
            serde_json::to_value(DeletionPolicy::Delete).unwrap(),
            serde_json::json!("Delete")
        );
        assert_eq!(
            serde_json::to_value(DeletionPolicy::Retain).unwrap(),
            serde_json::json!("Retain")
        );
    }
}
