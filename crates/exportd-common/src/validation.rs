//! Stateless admission rules for the three resource kinds.
//!
//! Used twice: by the admission webhook to reject bad writes, and by the
//! common controller in read-only mode to maintain the `invalid-*` labels when
//! the webhook is not deployed. Do NOT rely on these functions to fully
//! validate objects; they only enforce the rules the CRD schema cannot.

use crate::crd::{NfsExport, NfsExportClass, NfsExportContent};

/// Strict structural rules for an NfsExport.
pub fn validate_export(export: &NfsExport) -> Result<(), String> {
    if let Some(class) = &export.spec.class_name {
        if class.is_empty() {
            return Err("spec.className must not be the empty string".into());
        }
    }
    Ok(())
}

/// Strict structural rules for an NfsExportContent.
pub fn validate_content(content: &NfsExportContent) -> Result<(), String> {
    let export_ref = &content.spec.export_ref;
    if export_ref.name.is_empty() || export_ref.namespace.is_empty() {
        return Err(format!(
            "both spec.exportRef.name = {:?} and spec.exportRef.namespace = {:?} must be set",
            export_ref.name, export_ref.namespace
        ));
    }
    Ok(())
}

/// Immutable-field rules for an NfsExport update.
pub fn check_export_immutable_fields(
    export: &NfsExport,
    old_export: &NfsExport,
) -> Result<(), String> {
    let source = &export.spec.source;
    let old_source = &old_export.spec.source;

    if source.source_claim != old_source.source_claim {
        return Err(format!(
            "spec.source.sourceClaim is immutable but was changed from {:?} to {:?}",
            old_source.source_claim, source.source_claim
        ));
    }
    if source.adopt_content_name != old_source.adopt_content_name {
        return Err(format!(
            "spec.source.adoptContentName is immutable but was changed from {:?} to {:?}",
            old_source.adopt_content_name, source.adopt_content_name
        ));
    }
    Ok(())
}

/// Immutable-field rules for an NfsExportContent update.
pub fn check_content_immutable_fields(
    content: &NfsExportContent,
    old_content: &NfsExportContent,
    prevent_volume_mode_conversion: bool,
) -> Result<(), String> {
    let source = &content.spec.source;
    let old_source = &old_content.spec.source;

    if source.volume_handle != old_source.volume_handle {
        return Err(format!(
            "spec.source.volumeHandle is immutable but was changed from {:?} to {:?}",
            old_source.volume_handle, source.volume_handle
        ));
    }
    if source.export_handle != old_source.export_handle {
        return Err(format!(
            "spec.source.exportHandle is immutable but was changed from {:?} to {:?}",
            old_source.export_handle, source.export_handle
        ));
    }
    if prevent_volume_mode_conversion
        && content.spec.source_volume_mode != old_content.spec.source_volume_mode
    {
        return Err(format!(
            "spec.sourceVolumeMode is immutable but was changed from {:?} to {:?}",
            old_content.spec.source_volume_mode, content.spec.source_volume_mode
        ));
    }
    Ok(())
}

/// Full admission decision for an NfsExport.
pub fn decide_export(
    export: &NfsExport,
    old_export: Option<&NfsExport>,
    is_update: bool,
) -> Result<(), String> {
    if is_update {
        let old_export = old_export.ok_or("old NfsExport is missing on update")?;
        check_export_immutable_fields(export, old_export)?;
    }
    validate_export(export)
}

/// Full admission decision for an NfsExportContent.
pub fn decide_content(
    content: &NfsExportContent,
    old_content: Option<&NfsExportContent>,
    is_update: bool,
    prevent_volume_mode_conversion: bool,
) -> Result<(), String> {
    if is_update {
        let old_content = old_content.ok_or("old NfsExportContent is missing on update")?;
        check_content_immutable_fields(content, old_content, prevent_volume_mode_conversion)?;
    }
    validate_content(content)
}

/// Admission decision for an NfsExportClass against the currently existing
/// classes.
///
/// Rejects a write that would leave two default classes for one driver. An
/// update that keeps an already-default class default for the same driver is
/// allowed (no-op).
pub fn decide_class(
    class: &NfsExportClass,
    old_class: Option<&NfsExportClass>,
    existing: &[NfsExportClass],
) -> Result<(), String> {
    if !class.is_default() {
        return Ok(());
    }

    // The old object was already validated when it became default.
    if let Some(old_class) = old_class {
        if old_class.is_default() && old_class.spec.driver == class.spec.driver {
            return Ok(());
        }
    }

    let own_name = class.metadata.name.as_deref().unwrap_or_default();
    for candidate in existing {
        if !candidate.is_default() || candidate.spec.driver != class.spec.driver {
            continue;
        }
        if candidate.metadata.name.as_deref() == Some(own_name) {
            continue;
        }
        return Err(format!(
            "default export class {} already exists for driver {}",
            candidate.metadata.name.as_deref().unwrap_or_default(),
            class.spec.driver
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ContentSource, DeletionPolicy, ExportRef, NfsExportClassSpec, NfsExportContentSpec,
        NfsExportSource, NfsExportSpec,
    };
    use crate::keys;
    use std::collections::BTreeMap;

    fn export(class_name: Option<&str>) -> NfsExport {
        NfsExport::new(
            "e1",
            NfsExportSpec {
                source: NfsExportSource {
                    source_claim: Some("pvc".into()),
                    adopt_content_name: None,
                },
                class_name: class_name.map(String::from),
            },
        )
    }

    fn content(volume_handle: Option<&str>, export_handle: Option<&str>) -> NfsExportContent {
        NfsExportContent::new(
            "c1",
            NfsExportContentSpec {
                export_ref: ExportRef {
                    name: "e1".into(),
                    namespace: "ns".into(),
                    uid: String::new(),
                },
                deletion_policy: DeletionPolicy::Delete,
                driver: "nfs.example.com".into(),
                class_name: None,
                source: ContentSource {
                    volume_handle: volume_handle.map(String::from),
                    export_handle: export_handle.map(String::from),
                },
                source_volume_mode: None,
            },
        )
    }

    fn class(name: &str, driver: &str, default: bool) -> NfsExportClass {
        let mut c = NfsExportClass::new(
            name,
            NfsExportClassSpec {
                driver: driver.into(),
                parameters: BTreeMap::new(),
                deletion_policy: DeletionPolicy::Delete,
            },
        );
        if default {
            let mut annotations = BTreeMap::new();
            annotations.insert(keys::ANN_IS_DEFAULT_CLASS.to_string(), "true".to_string());
            c.metadata.annotations = Some(annotations);
        }
        c
    }

    #[test]
    fn empty_class_name_is_rejected_absent_is_fine() {
        assert!(validate_export(&export(None)).is_ok());
        assert!(validate_export(&export(Some("gold"))).is_ok());
        let err = validate_export(&export(Some(""))).unwrap_err();
        assert!(err.contains("must not be the empty string"));
    }

    #[test]
    fn content_requires_export_ref_identity() {
        assert!(validate_content(&content(Some("v1"), None)).is_ok());

        let mut bad = content(Some("v1"), None);
        bad.spec.export_ref.namespace = String::new();
        assert!(validate_content(&bad).is_err());
    }

    #[test]
    fn export_source_is_immutable() {
        let old_export = export(None);
        let mut changed = export(None);
        changed.spec.source.source_claim = Some("other-pvc".into());
        let err = check_export_immutable_fields(&changed, &old_export).unwrap_err();
        assert!(err.contains("sourceClaim is immutable"));

        assert!(decide_export(&changed, Some(&old_export), true).is_err());
        // CREATE does not check immutability.
        assert!(decide_export(&changed, None, false).is_ok());
    }

    #[test]
    fn content_source_is_immutable() {
        let old_content = content(Some("v1"), None);
        let mut changed = content(Some("v2"), None);
        assert!(check_content_immutable_fields(&changed, &old_content, false).is_err());

        changed = content(Some("v1"), None);
        changed.spec.source_volume_mode = Some("Block".into());
        // Only enforced behind the flag.
        assert!(check_content_immutable_fields(&changed, &old_content, false).is_ok());
        assert!(check_content_immutable_fields(&changed, &old_content, true).is_err());
    }

    #[test]
    fn second_default_class_for_driver_is_rejected() {
        let existing = vec![class("gold", "driver-a", true), class("slow", "driver-b", true)];

        let fresh = class("gold2", "driver-a", true);
        let err = decide_class(&fresh, None, &existing).unwrap_err();
        assert!(err.contains("already exists for driver"));

        // A default for a different driver is fine.
        let other = class("fast", "driver-c", true);
        assert!(decide_class(&other, None, &existing).is_ok());

        // Non-default writes are never checked.
        let plain = class("plain", "driver-a", false);
        assert!(decide_class(&plain, None, &existing).is_ok());
    }

    #[test]
    fn same_driver_default_noop_update_is_allowed() {
        let existing = vec![class("gold", "driver-a", true)];
        let updated = class("gold", "driver-a", true);
        let old_class = class("gold", "driver-a", true);
        assert!(decide_class(&updated, Some(&old_class), &existing).is_ok());

        // Changing driver while keeping default re-triggers the check.
        let moved = class("gold", "driver-b", true);
        let existing_b = vec![class("other", "driver-b", true)];
        assert!(decide_class(&moved, Some(&old_class), &existing_b).is_err());
    }
}
