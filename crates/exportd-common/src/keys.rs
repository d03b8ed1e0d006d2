//! Well-known annotation, finalizer, label and parameter keys.
//!
//! All keys are qualified with the API group. The `being-created` and
//! `being-deleted` annotations carry in-flight driver RPC state across
//! controller restarts and are the only channel between the two reconcilers
//! besides object fields.

use std::collections::BTreeMap;

use crate::crd::NfsExport;
use crate::error::Error;

/// API group of the exportd resources.
pub const API_GROUP: &str = "nfsexport.exportd.io";

/// Parameters under this prefix are reserved for the control plane and are
/// stripped before parameters are forwarded to the driver. Only the four
/// secret-reference keys below are allowed under the prefix; any other
/// reserved key is a hard validation error. The extra-create-metadata keys are
/// the one exception: they are injected (not accepted) under the prefix.
pub const PARAM_PREFIX: &str = "nfsexport.exportd.io/";

/// Class parameter naming the secret used for DeleteExport.
pub const PARAM_SECRET_NAME: &str = "nfsexport.exportd.io/secret-name";
/// Class parameter naming the namespace of the DeleteExport secret.
pub const PARAM_SECRET_NAMESPACE: &str = "nfsexport.exportd.io/secret-namespace";
/// Class parameter naming the secret used for ListExports.
pub const PARAM_LIST_SECRET_NAME: &str = "nfsexport.exportd.io/list-secret-name";
/// Class parameter naming the namespace of the ListExports secret.
pub const PARAM_LIST_SECRET_NAMESPACE: &str = "nfsexport.exportd.io/list-secret-namespace";

/// Extra create metadata: NfsExport name.
pub const PARAM_EXPORT_NAME: &str = "nfsexport.exportd.io/export-name";
/// Extra create metadata: NfsExport namespace.
pub const PARAM_EXPORT_NAMESPACE: &str = "nfsexport.exportd.io/export-namespace";
/// Extra create metadata: NfsExportContent name.
pub const PARAM_CONTENT_NAME: &str = "nfsexport.exportd.io/content-name";

/// Annotation on a content: a CreateExport RPC may be outstanding. Set before
/// the RPC, cleared only on a final outcome.
pub const ANN_BEING_CREATED: &str = "nfsexport.exportd.io/being-created";
/// Annotation on a content: the common controller has verified the bound
/// export is being deleted; permission for the sidecar to issue DeleteExport.
pub const ANN_BEING_DELETED: &str = "nfsexport.exportd.io/being-deleted";
/// Annotation on a content: name of the secret to use at deletion time.
pub const ANN_DELETION_SECRET_NAME: &str = "nfsexport.exportd.io/deletion-secret-name";
/// Annotation on a content: namespace of the secret to use at deletion time.
pub const ANN_DELETION_SECRET_NAMESPACE: &str = "nfsexport.exportd.io/deletion-secret-namespace";
/// Annotation marking a class as the default for its driver.
pub const ANN_IS_DEFAULT_CLASS: &str = "nfsexport.exportd.io/is-default-class";

/// Finalizer on contents bound to an export.
pub const FINALIZER_CONTENT_BOUND: &str = "nfsexport.exportd.io/content-bound";
/// Finalizer on exports bound to a content with deletionPolicy=Delete.
pub const FINALIZER_EXPORT_BOUND: &str = "nfsexport.exportd.io/bound";
/// Finalizer on every live export; removed last so PVC cleanup can run.
pub const FINALIZER_EXPORT_AS_SOURCE: &str = "nfsexport.exportd.io/as-source";
/// Finalizer on PVCs that are being exported from.
pub const FINALIZER_PVC_AS_SOURCE: &str = "nfsexport.exportd.io/pvc-as-source";

/// Label applied to exports that fail the admission rules.
pub const LABEL_INVALID_EXPORT: &str = "nfsexport.exportd.io/invalid-export-resource";
/// Label applied to contents that fail the admission rules.
pub const LABEL_INVALID_CONTENT: &str = "nfsexport.exportd.io/invalid-export-content-resource";
/// Label carrying the owning node name in distributed export mode.
pub const LABEL_MANAGED_BY: &str = "nfsexport.exportd.io/managed-by";

/// Prefix of the deterministic content name for dynamic provisioning.
pub const CONTENT_NAME_PREFIX: &str = "content-";

/// Deterministic content name for a dynamically provisioned export.
///
/// Derived from the export UID so that content creation is idempotent across
/// controller crashes and retries.
pub fn content_name_for_export(export: &NfsExport) -> String {
    format!(
        "{}{}",
        CONTENT_NAME_PREFIX,
        export.metadata.uid.as_deref().unwrap_or_default()
    )
}

/// Whether the annotation map carries the given key.
pub fn has_annotation(annotations: Option<&BTreeMap<String, String>>, key: &str) -> bool {
    annotations.map(|a| a.contains_key(key)).unwrap_or(false)
}

/// Strip reserved-prefix keys from class parameters before they are forwarded
/// to the driver.
///
/// The four secret-reference keys are allowed under the prefix (and removed);
/// any other reserved key fails hard.
pub fn remove_prefixed_parameters(
    params: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, Error> {
    let mut forwarded = BTreeMap::new();
    for (key, value) in params {
        if key.starts_with(PARAM_PREFIX) {
            match key.as_str() {
                PARAM_SECRET_NAME
                | PARAM_SECRET_NAMESPACE
                | PARAM_LIST_SECRET_NAME
                | PARAM_LIST_SECRET_NAMESPACE => {}
                _ => {
                    return Err(Error::validation(format!(
                        "found unknown parameter key \"{key}\" with reserved namespace {PARAM_PREFIX}"
                    )))
                }
            }
        } else {
            forwarded.insert(key.clone(), value.clone());
        }
    }
    Ok(forwarded)
}
