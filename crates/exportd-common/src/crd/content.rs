//! NfsExportContent CRD — the cluster-scoped backend object.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DeletionPolicy, ExportError, NfsExport};

/// Reference from a content back to the NfsExport it is bound to.
///
/// For a pre-provisioned content the admin sets `name` and `namespace`; `uid`
/// stays empty until the common controller binds the pair. For a dynamically
/// provisioned content `uid` is always set at creation time.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportRef {
    /// Name of the NfsExport.
    #[serde(default)]
    pub name: String,

    /// Namespace of the NfsExport.
    #[serde(default)]
    pub namespace: String,

    /// UID of the NfsExport; empty means not yet bound.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

impl ExportRef {
    /// `namespace/name` key of the referenced export.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Binding check from the content side: name, namespace and UID must all
    /// point at the given export.
    pub fn matches(&self, export: &NfsExport) -> bool {
        self.name == export.metadata.name.as_deref().unwrap_or_default()
            && self.namespace == export.metadata.namespace.as_deref().unwrap_or_default()
            && Some(self.uid.as_str()) == export.metadata.uid.as_deref()
    }
}

/// Source of a content. Exactly one member must be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentSource {
    /// Driver volume id to dynamically take an export from. Immutable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_handle: Option<String>,

    /// Driver export id of a pre-existing export. Immutable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_handle: Option<String>,
}

impl ContentSource {
    /// Validate source exclusivity: exactly one member must be set.
    pub fn validate_exclusive(&self) -> Result<(), String> {
        match (&self.volume_handle, &self.export_handle) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err("exactly one of volumeHandle and exportHandle must be specified".into()),
        }
    }
}

/// NfsExportContent represents an export on the underlying storage system.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "nfsexport.exportd.io",
    version = "v1",
    kind = "NfsExportContent",
    status = "NfsExportContentStatus",
    shortname = "nfsec",
    printcolumn = r#"{"name":"ReadyToUse","type":"boolean","jsonPath":".status.readyToUse"}"#,
    printcolumn = r#"{"name":"RestoreSize","type":"integer","jsonPath":".status.restoreSize"}"#,
    printcolumn = r#"{"name":"DeletionPolicy","type":"string","jsonPath":".spec.deletionPolicy"}"#,
    printcolumn = r#"{"name":"Driver","type":"string","jsonPath":".spec.driver"}"#,
    printcolumn = r#"{"name":"Export","type":"string","jsonPath":".spec.exportRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NfsExportContentSpec {
    /// The NfsExport this content is bound to.
    ///
    /// Immutable after creation; `uid` is filled in when a pre-provisioned
    /// content is bound.
    pub export_ref: ExportRef,

    /// What happens to the backing export when the bound NfsExport goes away.
    pub deletion_policy: DeletionPolicy,

    /// Name of the storage driver that services this content.
    pub driver: String,

    /// Class the content was (or will be) created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// Source of the content. Immutable.
    pub source: ContentSource,

    /// Mode (`Filesystem` or `Block`) of the source volume, when known.
    /// Immutable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_volume_mode: Option<String>,
}

/// Status of an NfsExportContent, written by the sidecar.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NfsExportContentStatus {
    /// Driver export id; unset while creation has not succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_handle: Option<String>,

    /// Unix nanoseconds when the export was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<i64>,

    /// Complete size of the export in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<i64>,

    /// Whether the export is usable for a restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// Last observed error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExportError>,
}

impl NfsExportContent {
    /// True for a content that dynamically provisions its export.
    pub fn is_dynamic(&self) -> bool {
        self.spec.source.volume_handle.is_some()
    }

    /// True once the backend export handle is recorded on status.
    pub fn has_handle(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.export_handle.is_some())
            .unwrap_or(false)
    }

    /// True once the content reports ready.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// Whether the content-bound finalizer still needs to be added.
    pub fn needs_bound_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.deletion_timestamp.is_none()
            && !self
                .metadata
                .finalizers
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|f| f == finalizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{NfsExportSource, NfsExportSpec};

    fn export_with_uid(name: &str, namespace: &str, uid: &str) -> NfsExport {
        let mut export = NfsExport::new(
            name,
            NfsExportSpec {
                source: NfsExportSource {
                    source_claim: Some("pvc".into()),
                    adopt_content_name: None,
                },
                class_name: None,
            },
        );
        export.metadata.namespace = Some(namespace.into());
        export.metadata.uid = Some(uid.into());
        export
    }

    #[test]
    fn export_ref_matches_requires_all_three_fields() {
        let export = export_with_uid("e1", "payments", "uid-1");
        let bound = ExportRef {
            name: "e1".into(),
            namespace: "payments".into(),
            uid: "uid-1".into(),
        };
        assert!(bound.matches(&export));

        let wrong_uid = ExportRef {
            uid: "uid-2".into(),
            ..bound.clone()
        };
        assert!(!wrong_uid.matches(&export));

        let unbound = ExportRef {
            uid: String::new(),
            ..bound
        };
        assert!(!unbound.matches(&export));
    }

    #[test]
    fn content_yaml_round_trip() {
        let yaml = r#"
apiVersion: nfsexport.exportd.io/v1
kind: NfsExportContent
metadata:
  name: content-uid-1
spec:
  exportRef:
    name: e1
    namespace: payments
    uid: uid-1
  deletionPolicy: Delete
  driver: nfs.example.com
  className: gold
  source:
    volumeHandle: vol-1
"#;
        let value: serde_json::Value = serde_yaml::from_str(yaml).expect("parse yaml");
        let content: NfsExportContent = serde_json::from_value(value).expect("parse content");
        assert!(content.is_dynamic());
        assert!(!content.has_handle());
        assert_eq!(content.spec.deletion_policy, DeletionPolicy::Delete);
        assert_eq!(content.spec.export_ref.key(), "payments/e1");
    }

    #[test]
    fn unbound_ref_serializes_without_uid() {
        let content_ref = ExportRef {
            name: "e1".into(),
            namespace: "payments".into(),
            uid: String::new(),
        };
        let value = serde_json::to_value(&content_ref).unwrap();
        assert!(value.get("uid").is_none());
    }

    #[test]
    fn bound_finalizer_predicate() {
        let mut content = NfsExportContent::new(
            "c1",
            NfsExportContentSpec {
                export_ref: ExportRef::default(),
                deletion_policy: DeletionPolicy::Delete,
                driver: "nfs.example.com".into(),
                class_name: None,
                source: ContentSource {
                    volume_handle: Some("vol-1".into()),
                    export_handle: None,
                },
                source_volume_mode: None,
            },
        );
        assert!(content.needs_bound_finalizer("f"));

        content.metadata.finalizers = Some(vec!["f".into()]);
        assert!(!content.needs_bound_finalizer("f"));

        content.metadata.finalizers = None;
        content.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        assert!(!content.needs_bound_finalizer("f"));
    }
}
