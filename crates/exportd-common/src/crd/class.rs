//! NfsExportClass CRD.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::DeletionPolicy;
use crate::keys;

/// NfsExportClass carries driver-specific parameters used when creating an
/// export. A class marked with the `is-default-class` annotation is selected
/// for NfsExports that do not name a class; at most one class per driver may
/// carry the annotation.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "nfsexport.exportd.io",
    version = "v1",
    kind = "NfsExportClass",
    shortname = "nfsclass",
    printcolumn = r#"{"name":"Driver","type":"string","jsonPath":".spec.driver"}"#,
    printcolumn = r#"{"name":"DeletionPolicy","type":"string","jsonPath":".spec.deletionPolicy"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NfsExportClassSpec {
    /// Name of the storage driver this class belongs to.
    pub driver: String,

    /// Opaque driver parameters for export creation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    /// Deletion policy installed on contents created from this class.
    pub deletion_policy: DeletionPolicy,
}

impl NfsExportClass {
    /// Whether this class is marked as the default for its driver.
    pub fn is_default(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(keys::ANN_IS_DEFAULT_CLASS))
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_yaml_with_default_annotation() {
        let yaml = r#"
apiVersion: nfsexport.exportd.io/v1
kind: NfsExportClass
metadata:
  name: gold
  annotations:
    nfsexport.exportd.io/is-default-class: "true"
spec:
  driver: nfs.example.com
  deletionPolicy: Delete
  parameters:
    tier: fast
"#;
        let value: serde_json::Value = serde_yaml::from_str(yaml).expect("parse yaml");
        let class: NfsExportClass = serde_json::from_value(value).expect("parse class");
        assert!(class.is_default());
        assert_eq!(class.spec.driver, "nfs.example.com");
        assert_eq!(class.spec.parameters.get("tier").map(String::as_str), Some("fast"));
    }

    #[test]
    fn class_without_annotation_is_not_default() {
        let class = NfsExportClass::new(
            "silver",
            NfsExportClassSpec {
                driver: "nfs.example.com".into(),
                parameters: BTreeMap::new(),
                deletion_policy: DeletionPolicy::Retain,
            },
        );
        assert!(!class.is_default());
    }

    #[test]
    fn annotation_value_must_be_true() {
        let mut class = NfsExportClass::new(
            "silver",
            NfsExportClassSpec {
                driver: "nfs.example.com".into(),
                parameters: BTreeMap::new(),
                deletion_policy: DeletionPolicy::Retain,
            },
        );
        let mut annotations = BTreeMap::new();
        annotations.insert(keys::ANN_IS_DEFAULT_CLASS.to_string(), "false".to_string());
        class.metadata.annotations = Some(annotations);
        assert!(!class.is_default());
    }
}
