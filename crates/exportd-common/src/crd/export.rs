//! NfsExport CRD — the namespaced user request.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// NfsExport is a user's request for either creating a point-in-time export of
/// a persistent volume, or adopting a pre-existing export.
///
/// Exactly one of `spec.source.sourceClaim` (dynamic provisioning) and
/// `spec.source.adoptContentName` (pre-provisioned) must be set; both are
/// immutable after creation.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "nfsexport.exportd.io",
    version = "v1",
    kind = "NfsExport",
    namespaced,
    status = "NfsExportStatus",
    shortname = "nfse",
    printcolumn = r#"{"name":"ReadyToUse","type":"boolean","jsonPath":".status.readyToUse"}"#,
    printcolumn = r#"{"name":"SourceClaim","type":"string","jsonPath":".spec.source.sourceClaim"}"#,
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.className"}"#,
    printcolumn = r#"{"name":"Content","type":"string","jsonPath":".status.boundContentName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NfsExportSpec {
    /// Where the export comes from. Immutable.
    pub source: NfsExportSource,

    /// Name of the NfsExportClass to use.
    ///
    /// May be left unset to select the default class for the source volume's
    /// driver. The empty string is not allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

/// Source of an export request. Exactly one member must be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NfsExportSource {
    /// Name of the PersistentVolumeClaim (same namespace) to cut a new export
    /// from. Immutable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_claim: Option<String>,

    /// Name of a pre-existing NfsExportContent to adopt. Immutable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adopt_content_name: Option<String>,
}

/// Last observed error during export creation.
///
/// Cleared once the export becomes ready.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportError {
    /// When the error was observed (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    /// Human-readable message. Must not contain sensitive information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Status of an NfsExport, mirrored from the bound content.
///
/// The mirror is eventually consistent; binding must be verified in both
/// directions before the status is trusted.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NfsExportStatus {
    /// Name of the NfsExportContent this export intends to bind to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_content_name: Option<String>,

    /// When the point-in-time export was taken on the storage system
    /// (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,

    /// Whether the export can be used to restore a volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// Minimum size in bytes of a volume restored from this export.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<i64>,

    /// Last observed error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExportError>,
}

impl NfsExport {
    /// `namespace/name` key used in queues and logs.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// True for a request that cuts a new export from a PVC.
    pub fn is_dynamic(&self) -> bool {
        self.spec.source.source_claim.is_some()
    }

    /// True once `status.boundContentName` names a content.
    pub fn is_bound(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.bound_content_name.as_deref())
            .map(|name| !name.is_empty())
            .unwrap_or(false)
    }

    /// True once the export is usable for a restore.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// True once the export has been cut on the storage system.
    pub fn is_created(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.creation_time.is_some())
            .unwrap_or(false)
    }
}

impl NfsExportSource {
    /// Validate source exclusivity: exactly one member must be set.
    pub fn validate_exclusive(&self) -> Result<(), String> {
        match (&self.source_claim, &self.adopt_content_name) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err("exactly one of sourceClaim and adoptContentName must be specified".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_export_yaml() {
        let yaml = r#"
apiVersion: nfsexport.exportd.io/v1
kind: NfsExport
metadata:
  name: pre-backup
  namespace: payments
spec:
  source:
    sourceClaim: db-data
  className: gold
"#;
        let value: serde_json::Value = serde_yaml::from_str(yaml).expect("parse yaml");
        let export: NfsExport = serde_json::from_value(value).expect("parse export");
        assert!(export.is_dynamic());
        assert!(export.spec.source.validate_exclusive().is_ok());
        assert_eq!(export.spec.class_name.as_deref(), Some("gold"));
        assert_eq!(export.key(), "payments/pre-backup");
    }

    #[test]
    fn adopted_export_yaml() {
        let yaml = r#"
apiVersion: nfsexport.exportd.io/v1
kind: NfsExport
metadata:
  name: restored
  namespace: payments
spec:
  source:
    adoptContentName: content-imported
"#;
        let value: serde_json::Value = serde_yaml::from_str(yaml).expect("parse yaml");
        let export: NfsExport = serde_json::from_value(value).expect("parse export");
        assert!(!export.is_dynamic());
        assert!(export.spec.source.validate_exclusive().is_ok());
        assert!(export.spec.class_name.is_none());
    }

    #[test]
    fn source_exclusivity_rejects_both_and_neither() {
        let both = NfsExportSource {
            source_claim: Some("pvc".into()),
            adopt_content_name: Some("content".into()),
        };
        assert!(both.validate_exclusive().is_err());

        let neither = NfsExportSource::default();
        assert!(neither.validate_exclusive().is_err());
    }

    #[test]
    fn status_predicates_track_binding_and_readiness() {
        let mut export = NfsExport::new(
            "e1",
            NfsExportSpec {
                source: NfsExportSource {
                    source_claim: Some("pvc".into()),
                    adopt_content_name: None,
                },
                class_name: None,
            },
        );
        assert!(!export.is_bound());
        assert!(!export.is_ready());
        assert!(!export.is_created());

        export.status = Some(NfsExportStatus {
            bound_content_name: Some("content-uid".into()),
            ready_to_use: Some(true),
            creation_time: Some("2026-01-01T00:00:00Z".into()),
            ..Default::default()
        });
        assert!(export.is_bound());
        assert!(export.is_ready());
        assert!(export.is_created());
    }

    #[test]
    fn empty_bound_name_is_not_bound() {
        let mut export = NfsExport::new(
            "e1",
            NfsExportSpec {
                source: NfsExportSource::default(),
                class_name: None,
            },
        );
        export.status = Some(NfsExportStatus {
            bound_content_name: Some(String::new()),
            ..Default::default()
        });
        assert!(!export.is_bound());
    }
}
