//! Per-content driver call helper.
//!
//! Derives the driver-side export name, selects the right handle, attaches
//! the per-call timeout and delegates to the driver adapter. The export name
//! is derived from the bound export's UID and is the idempotency key the
//! driver sees, so it must be stable across restarts and retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use exportd_common::crd::NfsExportContent;
use exportd_common::Error;
use kube::ResourceExt;

use crate::exporter::{CreatedExport, ExportDriver, ExportStatus};

/// Driver call helper bound to one sidecar configuration.
pub struct ContentHandler {
    driver: Arc<dyn ExportDriver>,
    timeout: Duration,
    export_name_prefix: String,
    export_name_uuid_length: i32,
}

impl ContentHandler {
    /// Create a handler.
    ///
    /// `export_name_uuid_length` of `-1` keeps the full UID including dashes;
    /// a non-negative value strips dashes and truncates to that length.
    pub fn new(
        driver: Arc<dyn ExportDriver>,
        timeout: Duration,
        export_name_prefix: String,
        export_name_uuid_length: i32,
    ) -> Self {
        Self {
            driver,
            timeout,
            export_name_prefix,
            export_name_uuid_length,
        }
    }

    /// Issue CreateExport for a dynamically provisioned content.
    pub async fn create_export(
        &self,
        content: &NfsExportContent,
        parameters: &BTreeMap<String, String>,
        secrets: &BTreeMap<String, String>,
    ) -> Result<CreatedExport, Error> {
        let name = content.name_any();

        if content.spec.export_ref.uid.is_empty() {
            return Err(Error::validation(format!(
                "cannot create export. Content {name} not bound to an export"
            )));
        }
        let Some(volume_handle) = content.spec.source.volume_handle.as_deref() else {
            return Err(Error::validation(format!(
                "cannot create export. Volume handle not found in export content {name}"
            )));
        };

        let export_name = make_export_name(
            &self.export_name_prefix,
            &content.spec.export_ref.uid,
            self.export_name_uuid_length,
        )?;

        self.driver
            .create_export(&export_name, volume_handle, parameters, secrets, self.timeout)
            .await
            .map_err(|e| Error::Driver {
                object: name,
                message: e.to_string(),
                final_error: e.is_final(),
            })
    }

    /// Issue DeleteExport using the recorded (or pre-provisioned) handle.
    pub async fn delete_export(
        &self,
        content: &NfsExportContent,
        secrets: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let name = content.name_any();
        let handle = export_handle_of(content).ok_or_else(|| {
            Error::validation(format!(
                "failed to delete export content {name}: exportHandle is missing"
            ))
        })?;

        self.driver
            .delete_export(&handle, secrets, self.timeout)
            .await
            .map_err(|e| Error::Driver {
                object: name.clone(),
                message: format!("failed to delete export content {name}: {e}"),
                final_error: e.is_final(),
            })
    }

    /// Probe export readiness using the recorded (or pre-provisioned) handle.
    pub async fn export_status(
        &self,
        content: &NfsExportContent,
        list_secrets: &BTreeMap<String, String>,
    ) -> Result<ExportStatus, Error> {
        let name = content.name_any();
        let handle = export_handle_of(content).ok_or_else(|| {
            Error::validation(format!(
                "failed to list export for content {name}: exportHandle is missing"
            ))
        })?;

        self.driver
            .export_status(&handle, list_secrets, self.timeout)
            .await
            .map_err(|e| Error::Driver {
                object: name.clone(),
                message: format!("failed to list export for content {name}: {e}"),
                final_error: e.is_final(),
            })
    }
}

/// Select the backend handle: status wins over the pre-provisioned source.
fn export_handle_of(content: &NfsExportContent) -> Option<String> {
    content
        .status
        .as_ref()
        .and_then(|s| s.export_handle.clone())
        .or_else(|| content.spec.source.export_handle.clone())
}

/// Derive the stable driver-side export name from the export UID.
pub fn make_export_name(prefix: &str, uid: &str, uuid_length: i32) -> Result<String, Error> {
    if uid.is_empty() {
        return Err(Error::validation(
            "corrupted export object, it is missing UID",
        ));
    }
    if uuid_length < 0 {
        return Ok(format!("{prefix}-{uid}"));
    }
    let stripped: String = uid.chars().filter(|c| *c != '-').collect();
    let truncated: String = stripped.chars().take(uuid_length as usize).collect();
    Ok(format!("{prefix}-{truncated}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_driver::FakeDriver;
    use exportd_common::crd::{
        ContentSource, DeletionPolicy, ExportRef, NfsExportContentSpec, NfsExportContentStatus,
    };

    fn content(
        uid: &str,
        volume_handle: Option<&str>,
        export_handle: Option<&str>,
    ) -> NfsExportContent {
        NfsExportContent::new(
            "content-1",
            NfsExportContentSpec {
                export_ref: ExportRef {
                    name: "e1".into(),
                    namespace: "ns".into(),
                    uid: uid.into(),
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

    fn handler(driver: Arc<FakeDriver>) -> ContentHandler {
        ContentHandler::new(driver, Duration::from_secs(30), "e".into(), -1)
    }

    #[test]
    fn export_name_keeps_uid_by_default() {
        assert_eq!(
            make_export_name("e", "aaa-bbb-ccc", -1).unwrap(),
            "e-aaa-bbb-ccc"
        );
    }

    #[test]
    fn export_name_strips_dashes_and_truncates() {
        assert_eq!(make_export_name("e", "aaa-bbb-ccc", 6).unwrap(), "e-aaabbb");
        assert_eq!(make_export_name("e", "ab-cd", 100).unwrap(), "e-abcd");
    }

    #[test]
    fn export_name_requires_uid() {
        assert!(make_export_name("e", "", -1).is_err());
    }

    #[tokio::test]
    async fn create_rejects_unbound_content() {
        let driver = Arc::new(FakeDriver::default());
        let err = handler(driver.clone())
            .create_export(
                &content("", Some("vol-1"), None),
                &BTreeMap::new(),
                &BTreeMap::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not bound to an export"));
        assert!(driver.create_calls().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_missing_volume_handle() {
        let driver = Arc::new(FakeDriver::default());
        let err = handler(driver.clone())
            .create_export(&content("uid-1", None, None), &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Volume handle not found"));
    }

    #[tokio::test]
    async fn create_uses_derived_name_and_volume() {
        let driver = Arc::new(FakeDriver::default());
        handler(driver.clone())
            .create_export(
                &content("uid-1", Some("vol-1"), None),
                &BTreeMap::new(),
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        let calls = driver.create_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "e-uid-1");
        assert_eq!(calls[0].volume_handle, "vol-1");
    }

    #[tokio::test]
    async fn delete_prefers_status_handle() {
        let driver = Arc::new(FakeDriver::default());
        let mut c = content("uid-1", None, Some("spec-handle"));
        c.status = Some(NfsExportContentStatus {
            export_handle: Some("status-handle".into()),
            ..Default::default()
        });
        handler(driver.clone())
            .delete_export(&c, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(driver.delete_calls(), vec!["status-handle".to_string()]);
    }

    #[tokio::test]
    async fn delete_falls_back_to_spec_handle() {
        let driver = Arc::new(FakeDriver::default());
        handler(driver.clone())
            .delete_export(&content("uid-1", None, Some("spec-handle")), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(driver.delete_calls(), vec!["spec-handle".to_string()]);
    }

    #[tokio::test]
    async fn delete_and_status_require_a_handle() {
        let driver = Arc::new(FakeDriver::default());
        let c = content("uid-1", Some("vol-1"), None);
        let err = handler(driver.clone())
            .delete_export(&c, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exportHandle is missing"));

        let err = handler(driver)
            .export_status(&c, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exportHandle is missing"));
    }
}
