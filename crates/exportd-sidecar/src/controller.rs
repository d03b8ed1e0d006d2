//! Sidecar reconciler: drives the storage driver to match NfsExportContent
//! desired state.
//!
//! Creation is guarded by the `being-created` annotation: it is patched onto
//! the content *before* the CreateExport RPC and removed only on a final
//! outcome (success, or an error that proves the RPC is no longer in
//! flight). A timed-out create leaves the annotation in place so the next
//! pass does not issue a second create that would orphan the first export,
//! and so deletion is deferred until the outcome is known.
//!
//! Deletion never removes the content finalizer in the same pass that calls
//! DeleteExport: the delete path nulls the status handle and re-enqueues, and
//! the next reconcile removes the finalizer once no handle remains. A crash
//! between the two steps therefore cannot leak a backend export.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use exportd_common::api::{self, content_object_ref, ClusterApi};
use exportd_common::crd::{DeletionPolicy, NfsExportClass, NfsExportContent};
use exportd_common::events::{reasons, EventPublisher};
use exportd_common::queue::WorkQueue;
use exportd_common::store::VersionedStore;
use exportd_common::{keys, Error};

use crate::handler::ContentHandler;

/// Sidecar configuration shared by the reconciler and its runner.
pub struct SidecarConfig {
    /// Driver this sidecar serves; contents of other drivers are skipped.
    pub driver_name: String,
    /// Whether to inject the descriptive metadata keys into CreateExport
    /// parameters.
    pub extra_create_metadata: bool,
}

/// The sidecar reconciler.
pub struct SidecarController {
    api: Arc<dyn ClusterApi>,
    events: Arc<dyn EventPublisher>,
    handler: ContentHandler,
    store: Mutex<VersionedStore<NfsExportContent>>,
    queue: Arc<WorkQueue>,
    config: SidecarConfig,
}

impl SidecarController {
    /// Create the reconciler.
    pub fn new(
        api: Arc<dyn ClusterApi>,
        events: Arc<dyn EventPublisher>,
        handler: ContentHandler,
        queue: Arc<WorkQueue>,
        config: SidecarConfig,
    ) -> Self {
        Self {
            api,
            events,
            handler,
            store: Mutex::new(VersionedStore::new()),
            queue,
            config,
        }
    }

    /// The work queue feeding this reconciler.
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Record a watch-event object in the cache. Returns false for stale
    /// versions, which must not be reconciled.
    pub fn store_update(&self, content: &NfsExportContent) -> bool {
        let mut store = self.lock_store();
        match store.update(content) {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(content = %content.name_any(), error = %e, "cannot update content cache");
                true
            }
        }
    }

    /// Drop a content from the cache (delete event processed).
    pub fn store_remove(&self, key: &str) {
        self.lock_store().remove(key);
    }

    /// Cached content names, for periodic resync.
    pub fn cached_keys(&self) -> Vec<String> {
        self.lock_store().keys()
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, VersionedStore<NfsExportContent>> {
        self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Reconcile one key from the queue.
    pub async fn sync_key(&self, key: &str) -> Result<(), Error> {
        let Some(content) = self.lock_store().get(key) else {
            debug!(key, "content already removed from cache");
            return Ok(());
        };
        if !self.is_driver_match(&content).await {
            return Ok(());
        }
        self.sync(&content).await
    }

    /// Whether this sidecar is responsible for the content.
    pub async fn is_driver_match(&self, content: &NfsExportContent) -> bool {
        if content.spec.source.volume_handle.is_none()
            && content.spec.source.export_handle.is_none()
        {
            return false;
        }
        if content.spec.driver != self.config.driver_name {
            return false;
        }
        if let Some(class_name) = &content.spec.class_name {
            if let Ok(Some(class)) = self.api.get_class(class_name).await {
                if class.spec.driver != self.config.driver_name {
                    return false;
                }
            }
        }
        true
    }

    /// Per-key reconciliation.
    pub async fn sync(&self, content: &NfsExportContent) -> Result<(), Error> {
        debug!(content = %content.name_any(), "synchronizing NfsExportContent");

        if self.should_delete(content) {
            debug!(
                content = %content.name_any(),
                policy = content.spec.deletion_policy.as_str(),
                "content is due for deletion"
            );
            if content.spec.deletion_policy == DeletionPolicy::Delete && content.has_handle() {
                // The backend export still exists. Remove it first; the
                // finalizer stays until the handle is gone from status.
                return self.delete_export(content).await;
            }
            return self.remove_content_finalizer(content).await;
        }

        if content.spec.source.volume_handle.is_some() && content.status.is_none() {
            return self.create_export(content).await;
        }

        if content.is_ready() {
            // Already ready: don't keep calling the driver; just make sure a
            // leftover being-created annotation is cleaned up.
            self.remove_being_created(content.clone()).await?;
            return Ok(());
        }

        self.check_and_update_status(content).await
    }

    /// Deletion predicate.
    ///
    /// A content should be deleted only when the orchestrator marked it
    /// (deletionTimestamp) AND either it is a pre-provisioned content nobody
    /// bound yet, or the common controller set the `being-deleted`
    /// annotation. A content with `being-created` is never deleted: the
    /// CreateExport RPC may still be live.
    pub fn should_delete(&self, content: &NfsExportContent) -> bool {
        if content.metadata.deletion_timestamp.is_none() {
            return false;
        }
        let annotations = content.metadata.annotations.as_ref();
        if content.spec.source.export_handle.is_some() && content.spec.export_ref.uid.is_empty() {
            return true;
        }
        if keys::has_annotation(annotations, keys::ANN_BEING_CREATED) {
            return false;
        }
        keys::has_annotation(annotations, keys::ANN_BEING_DELETED)
    }

    async fn create_export(&self, content: &NfsExportContent) -> Result<(), Error> {
        debug!(content = %content.name_any(), "createExport started");
        if let Err(e) = self.create_export_operation(content.clone()).await {
            if is_terminal_outcome(&e) {
                self.update_error_status_with_event(
                    &content.name_any(),
                    reasons::EXPORT_CREATION_FAILED,
                    &format!("Failed to create export: {e}"),
                )
                .await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn check_and_update_status(&self, content: &NfsExportContent) -> Result<(), Error> {
        debug!(content = %content.name_any(), "checkAndUpdateContentStatus started");
        if let Err(e) = self.check_and_update_status_operation(content).await {
            if is_terminal_outcome(&e) {
                self.update_error_status_with_event(
                    &content.name_any(),
                    reasons::CONTENT_CHECK_FAILED,
                    &format!("Failed to check and update export content: {e}"),
                )
                .await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn check_and_update_status_operation(
        &self,
        content: &NfsExportContent,
    ) -> Result<(), Error> {
        let name = content.name_any();

        if let Some(export_handle) = content.spec.source.export_handle.clone() {
            // Pre-provisioned: probe the driver through the list secrets
            // resolved from the class parameters.
            let mut list_credentials = BTreeMap::new();
            if let Some(class_name) = &content.spec.class_name {
                let class = self.get_class(class_name).await.map_err(|e| {
                    Error::secrets(format!(
                        "failed to get export class {class_name} for export content {name}: {e}"
                    ))
                })?;
                let secret_ref = exportd_common::secret::secret_reference(
                    &exportd_common::secret::LIST_SECRET_PARAMS,
                    &class.spec.parameters,
                    &name,
                    None,
                )
                .map_err(|e| {
                    Error::secrets(format!(
                        "failed to get secret reference for export content {name}: {e}"
                    ))
                })?;
                if let Some(creds) = api::credentials(self.api.as_ref(), secret_ref.as_ref())
                    .await
                    .map_err(|e| {
                        Error::secrets(format!(
                            "failed to get credentials for export content {name}: {e}"
                        ))
                    })?
                {
                    list_credentials = creds;
                }
            }

            let status = self.handler.export_status(content, &list_credentials).await?;
            let created_ns = status
                .creation_time
                .unwrap_or_else(Utc::now)
                .timestamp_nanos_opt()
                .unwrap_or_default();
            self.update_content_status(
                &name,
                &export_handle,
                status.ready_to_use,
                created_ns,
                status.size_bytes,
            )
            .await?;
            return Ok(());
        }

        // Dynamic content with an unfinished create: retry through the
        // creation path, which is annotation-guarded and name-idempotent.
        self.create_export_operation(content.clone()).await.map(|_| ())
    }

    async fn create_export_operation(
        &self,
        content: NfsExportContent,
    ) -> Result<NfsExportContent, Error> {
        let name = content.name_any();
        info!(content = %name, "creating export through the driver");

        let (class, credentials) = self.create_inputs(&content).await?;

        // Mark the create as possibly-in-flight before any RPC leaves. If
        // this patch fails nothing was sent and the error is plainly
        // retryable.
        let content = self.set_being_created(content).await?;

        let no_parameters = BTreeMap::new();
        let class_parameters = class
            .as_ref()
            .map(|c| &c.spec.parameters)
            .unwrap_or(&no_parameters);
        let mut parameters = keys::remove_prefixed_parameters(class_parameters)?;
        if self.config.extra_create_metadata {
            parameters.insert(
                keys::PARAM_EXPORT_NAME.to_string(),
                content.spec.export_ref.name.clone(),
            );
            parameters.insert(
                keys::PARAM_EXPORT_NAMESPACE.to_string(),
                content.spec.export_ref.namespace.clone(),
            );
            parameters.insert(keys::PARAM_CONTENT_NAME.to_string(), name.clone());
        }

        match self
            .handler
            .create_export(&content, &parameters, &credentials)
            .await
        {
            Err(e) => {
                info!(content = %name, error = %e, "CreateExport returned error");
                let is_final = matches!(e, Error::Driver { final_error: true, .. });
                let volume = content
                    .spec
                    .source
                    .volume_handle
                    .clone()
                    .unwrap_or_else(|| "unknown".into());
                if is_final {
                    // The driver proved nothing is in flight anymore; allow
                    // deletion and future retries to proceed normally.
                    self.remove_being_created(content).await?;
                }
                Err(Error::Driver {
                    object: name,
                    message: format!("failed to take export of the volume {volume}: {e}"),
                    final_error: is_final,
                })
            }
            Ok(created) => {
                debug!(
                    content = %name,
                    export_id = %created.export_id,
                    ready = created.ready_to_use,
                    size = created.size_bytes,
                    "created export"
                );
                let created_ns = created
                    .creation_time
                    .unwrap_or_else(Utc::now)
                    .timestamp_nanos_opt()
                    .unwrap_or_default();
                let updated = self
                    .update_content_status(
                        &name,
                        &created.export_id,
                        created.ready_to_use,
                        created_ns,
                        created.size_bytes,
                    )
                    .await?;
                self.remove_being_created(updated).await
            }
        }
    }

    /// Resolve class and credentials for a create.
    async fn create_inputs(
        &self,
        content: &NfsExportContent,
    ) -> Result<(Option<NfsExportClass>, BTreeMap<String, String>), Error> {
        let name = content.name_any();

        let class = match &content.spec.class_name {
            Some(class_name) => Some(self.get_class(class_name).await?),
            None => {
                if content.is_dynamic() {
                    return Err(Error::validation(format!(
                        "failed to take export {name} without an export class"
                    )));
                }
                // Pre-provisioned contents do not need a class.
                None
            }
        };

        let credentials = self
            .credentials_from_annotation(content)
            .await?
            .unwrap_or_default();
        Ok((class, credentials))
    }

    /// Resolve credentials from the deletion-secret annotations placed by the
    /// common controller at content creation time.
    pub async fn credentials_from_annotation(
        &self,
        content: &NfsExportContent,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let name = content.name_any();
        let annotations = content.metadata.annotations.as_ref();
        let secret_name = annotations.and_then(|a| a.get(keys::ANN_DELETION_SECRET_NAME));
        let secret_namespace =
            annotations.and_then(|a| a.get(keys::ANN_DELETION_SECRET_NAMESPACE));

        let (Some(secret_name), Some(secret_namespace)) = (secret_name, secret_namespace) else {
            return Ok(None);
        };
        if secret_name.is_empty() || secret_namespace.is_empty() {
            return Err(Error::secrets(format!(
                "cannot retrieve secrets for export content {name}, err: secret name or namespace not specified"
            )));
        }

        let secret_ref = exportd_common::secret::SecretRef {
            name: secret_name.clone(),
            namespace: secret_namespace.clone(),
        };
        match api::credentials(self.api.as_ref(), Some(&secret_ref)).await {
            Ok(creds) => Ok(creds),
            Err(e) => {
                warn!(content = %name, error = %e, "failed to get credentials");
                Err(Error::secrets(format!(
                    "cannot get credentials for export content {name}"
                )))
            }
        }
    }

    async fn delete_export(&self, content: &NfsExportContent) -> Result<(), Error> {
        let name = content.name_any();
        debug!(content = %name, "deleteExport started");

        let credentials = match self.credentials_from_annotation(content).await {
            Ok(creds) => creds.unwrap_or_default(),
            Err(e) => {
                self.emit_warning(
                    content,
                    reasons::EXPORT_DELETE_ERROR,
                    "Failed to get export credentials",
                )
                .await;
                return Err(Error::secrets(format!(
                    "failed to get input parameters to delete export for content {name}: {e}"
                )));
            }
        };

        if let Err(e) = self.handler.delete_export(content, &credentials).await {
            self.emit_warning(content, reasons::EXPORT_DELETE_ERROR, "Failed to delete export")
                .await;
            return Err(e);
        }

        // The backend export is gone; clear the handle (and the other
        // driver-reported fields) so the next reconcile can release the
        // finalizer.
        match self.clear_content_status(&name).await {
            Ok(_) => {
                self.queue.add(&name);
                Ok(())
            }
            Err(e) => {
                self.emit_warning(
                    content,
                    reasons::EXPORT_DELETE_ERROR,
                    "Failed to clear content status",
                )
                .await;
                Err(e)
            }
        }
    }

    /// Null all driver-reported status fields after a successful backend
    /// delete.
    async fn clear_content_status(&self, name: &str) -> Result<NfsExportContent, Error> {
        let updated = self
            .api
            .patch_content_status(
                name,
                json!({
                    "exportHandle": null,
                    "readyToUse": null,
                    "creationTime": null,
                    "restoreSize": null,
                }),
            )
            .await
            .map_err(|e| Error::api_update(name, e.to_string()))?;
        self.store_update(&updated);
        Ok(updated)
    }

    /// Merge driver-reported fields into the content status. Only unset
    /// fields are filled; `readyToUse` tracks the driver and clears the
    /// error once the export is usable.
    async fn update_content_status(
        &self,
        name: &str,
        export_handle: &str,
        ready_to_use: bool,
        created_ns: i64,
        size_bytes: i64,
    ) -> Result<NfsExportContent, Error> {
        let fresh = self
            .api
            .get_content(name)
            .await?
            .ok_or_else(|| Error::internal("sidecar", format!("content {name} is gone")))?;

        let mut status = fresh.status.clone().unwrap_or_default();
        let mut updated = false;
        let mut clear_error = false;

        if status.export_handle.is_none() {
            status.export_handle = Some(export_handle.to_string());
            updated = true;
        }
        if status.ready_to_use != Some(ready_to_use) {
            status.ready_to_use = Some(ready_to_use);
            updated = true;
            if ready_to_use && status.error.is_some() {
                status.error = None;
                clear_error = true;
            }
        }
        if status.creation_time.is_none() {
            status.creation_time = Some(created_ns);
            updated = true;
        }
        if status.restore_size.is_none() {
            status.restore_size = Some(size_bytes);
            updated = true;
        }

        if !updated {
            return Ok(fresh);
        }

        let mut value = serde_json::to_value(&status)
            .map_err(|e| Error::internal("sidecar", format!("serialize status: {e}")))?;
        if clear_error {
            value["error"] = serde_json::Value::Null;
        }
        let stored = self
            .api
            .patch_content_status(name, value)
            .await
            .map_err(|e| Error::api_update(name, e.to_string()))?;
        self.store_update(&stored);
        Ok(stored)
    }

    /// Set the in-flight annotation; proceed only if the patch succeeded.
    async fn set_being_created(
        &self,
        content: NfsExportContent,
    ) -> Result<NfsExportContent, Error> {
        if keys::has_annotation(content.metadata.annotations.as_ref(), keys::ANN_BEING_CREATED) {
            return Ok(content);
        }
        let name = content.name_any();
        let patch =
            exportd_common::patch::set_annotation(&content.metadata, keys::ANN_BEING_CREATED, "yes")?;
        let patched = self
            .api
            .patch_content(&name, &patch)
            .await
            .map_err(|e| Error::api_update(&name, e.to_string()))?;
        self.store_update(&patched);
        debug!(content = %name, "set being-created annotation");
        Ok(patched)
    }

    /// Clear the in-flight annotation on a final outcome.
    async fn remove_being_created(
        &self,
        content: NfsExportContent,
    ) -> Result<NfsExportContent, Error> {
        let name = content.name_any();
        let Some(patch) =
            exportd_common::patch::remove_annotation(&content.metadata, keys::ANN_BEING_CREATED)?
        else {
            return Ok(content);
        };
        let patched = self
            .api
            .patch_content(&name, &patch)
            .await
            .map_err(|e| Error::api_update(&name, e.to_string()))?;
        self.store_update(&patched);
        debug!(content = %name, "removed being-created annotation");
        Ok(patched)
    }

    /// Remove the bound-content finalizer, releasing the object to the
    /// orchestrator's garbage collection.
    async fn remove_content_finalizer(&self, content: &NfsExportContent) -> Result<(), Error> {
        let name = content.name_any();
        let Some(patch) = exportd_common::patch::remove_finalizer(
            &content.metadata,
            keys::FINALIZER_CONTENT_BOUND,
        )?
        else {
            return Ok(());
        };
        let patched = self
            .api
            .patch_content(&name, &patch)
            .await
            .map_err(|e| Error::api_update(&name, e.to_string()))?;
        self.store_update(&patched);
        info!(content = %name, "removed content-bound finalizer");
        Ok(())
    }

    /// Record a status error and emit a warning event. The event is emitted
    /// even when the status write fails so the user still sees the failure;
    /// identical messages are not re-written.
    async fn update_error_status_with_event(&self, name: &str, reason: &str, message: &str) {
        let Ok(Some(content)) = self.api.get_content(name).await else {
            return;
        };

        let existing = content
            .status
            .as_ref()
            .and_then(|s| s.error.as_ref())
            .and_then(|e| e.message.as_deref());
        if existing == Some(message) {
            debug!(content = %name, "same error already recorded");
            return;
        }

        let result = self
            .api
            .patch_content_status(
                name,
                json!({
                    "readyToUse": false,
                    "error": {
                        "time": Utc::now().to_rfc3339(),
                        "message": message,
                    },
                }),
            )
            .await;

        self.emit_warning(&content, reason, message).await;

        match result {
            Ok(stored) => {
                self.store_update(&stored);
            }
            Err(e) => {
                warn!(content = %name, error = %e, "updating content error status failed");
            }
        }
    }

    async fn emit_warning(&self, content: &NfsExportContent, reason: &str, message: &str) {
        self.events
            .publish(
                &content_object_ref(content),
                EventType::Warning,
                reason,
                Some(message.to_string()),
            )
            .await;
    }

    async fn get_class(&self, name: &str) -> Result<NfsExportClass, Error> {
        self.api
            .get_class(name)
            .await?
            .ok_or_else(|| Error::validation(format!("export class {name} not found")))
    }
}

/// Whether an error is a final outcome that belongs in `status.error`.
///
/// Transient trouble is kept out of the user-facing status: a driver error
/// whose RPC may still be in flight, and orchestrator write failures, are
/// retried through the queue's backoff without a status write.
fn is_terminal_outcome(error: &Error) -> bool {
    !matches!(
        error,
        Error::Driver {
            final_error: false,
            ..
        } | Error::ApiUpdate { .. }
            | Error::Kube { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{CreatedExport, DriverError, ExportStatus};
    use crate::fake_driver::FakeDriver;
    use exportd_common::crd::{
        ContentSource, ExportError, ExportRef, NfsExportClassSpec, NfsExportContentSpec,
        NfsExportContentStatus,
    };
    use exportd_common::events::NoopEventPublisher;
    use exportd_common::queue::RateLimiter;
    use exportd_common::testing::FakeCluster;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::time::Duration;

    const DRIVER: &str = "nfs.example.com";

    struct Fixture {
        cluster: Arc<FakeCluster>,
        driver: Arc<FakeDriver>,
        controller: SidecarController,
    }

    fn fixture(extra_metadata: bool) -> Fixture {
        let cluster = Arc::new(FakeCluster::new());
        let driver = Arc::new(FakeDriver::default());
        let handler = ContentHandler::new(
            driver.clone(),
            Duration::from_secs(30),
            "e".into(),
            -1,
        );
        let controller = SidecarController::new(
            cluster.clone(),
            Arc::new(NoopEventPublisher),
            handler,
            WorkQueue::new(RateLimiter::default()),
            SidecarConfig {
                driver_name: DRIVER.into(),
                extra_create_metadata: extra_metadata,
            },
        );
        Fixture {
            cluster,
            driver,
            controller,
        }
    }

    fn dynamic_content(name: &str, class: Option<&str>) -> NfsExportContent {
        let mut content = NfsExportContent::new(
            name,
            NfsExportContentSpec {
                export_ref: ExportRef {
                    name: "e1".into(),
                    namespace: "ns".into(),
                    uid: "uid-1".into(),
                },
                deletion_policy: DeletionPolicy::Delete,
                driver: DRIVER.into(),
                class_name: class.map(String::from),
                source: ContentSource {
                    volume_handle: Some("v1".into()),
                    export_handle: None,
                },
                source_volume_mode: None,
            },
        );
        content.metadata.finalizers = Some(vec![keys::FINALIZER_CONTENT_BOUND.into()]);
        content
    }

    fn preprovisioned_content(name: &str, class: Option<&str>) -> NfsExportContent {
        NfsExportContent::new(
            name,
            NfsExportContentSpec {
                export_ref: ExportRef {
                    name: "e1".into(),
                    namespace: "ns".into(),
                    uid: String::new(),
                },
                deletion_policy: DeletionPolicy::Retain,
                driver: DRIVER.into(),
                class_name: class.map(String::from),
                source: ContentSource {
                    volume_handle: None,
                    export_handle: Some("e1-handle".into()),
                },
                source_volume_mode: None,
            },
        )
    }

    fn class(name: &str, parameters: &[(&str, &str)]) -> exportd_common::crd::NfsExportClass {
        exportd_common::crd::NfsExportClass::new(
            name,
            NfsExportClassSpec {
                driver: DRIVER.into(),
                parameters: parameters
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                deletion_policy: DeletionPolicy::Delete,
            },
        )
    }

    fn annotate(content: &mut NfsExportContent, key: &str, value: &str) {
        content
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
    }

    // Scenario: a not-yet-ready dynamic content becomes ready through one
    // CreateExport call carrying the extra metadata parameters.
    #[tokio::test]
    async fn basic_content_becomes_ready() {
        let fx = fixture(true);
        fx.cluster.add_class(class("gold", &[]));
        let mut content = dynamic_content("c1", Some("gold"));
        content.status = Some(NfsExportContentStatus {
            ready_to_use: Some(false),
            ..Default::default()
        });
        fx.cluster.add_content(content);
        fx.driver.script_create(Ok(CreatedExport {
            driver_name: DRIVER.into(),
            export_id: "exp-1".into(),
            creation_time: Some(Utc::now()),
            size_bytes: 1 << 20,
            ready_to_use: true,
        }));

        let content = fx.cluster.content("c1").unwrap();
        fx.controller.sync(&content).await.unwrap();

        let stored = fx.cluster.content("c1").unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.ready_to_use, Some(true));
        assert_eq!(status.export_handle.as_deref(), Some("exp-1"));
        assert_eq!(status.restore_size, Some(1 << 20));
        assert!(status.creation_time.is_some());
        // Final outcome: the in-flight annotation is gone again.
        assert!(!keys::has_annotation(
            stored.metadata.annotations.as_ref(),
            keys::ANN_BEING_CREATED
        ));

        let calls = fx.driver.create_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "e-uid-1");
        assert_eq!(calls[0].volume_handle, "v1");
        assert_eq!(
            calls[0].parameters.get(keys::PARAM_EXPORT_NAME).map(String::as_str),
            Some("e1")
        );
        assert_eq!(
            calls[0]
                .parameters
                .get(keys::PARAM_EXPORT_NAMESPACE)
                .map(String::as_str),
            Some("ns")
        );
        assert_eq!(
            calls[0].parameters.get(keys::PARAM_CONTENT_NAME).map(String::as_str),
            Some("c1")
        );
        assert!(calls[0].secrets.is_empty());
    }

    // Scenario: deletion-secret annotations present but empty.
    #[tokio::test]
    async fn missing_secret_reference_fails_create() {
        let fx = fixture(false);
        fx.cluster.add_class(class("invalidSecretClass", &[]));
        let mut content = dynamic_content("c2", Some("invalidSecretClass"));
        annotate(&mut content, keys::ANN_DELETION_SECRET_NAME, "");
        annotate(&mut content, keys::ANN_DELETION_SECRET_NAMESPACE, "");
        content.status = Some(NfsExportContentStatus {
            ready_to_use: Some(false),
            ..Default::default()
        });
        fx.cluster.add_content(content);

        let content = fx.cluster.content("c2").unwrap();
        let err = fx.controller.sync(&content).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("secret name or namespace not specified"));

        let stored = fx.cluster.content("c2").unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.ready_to_use, Some(false));
        assert!(status
            .error
            .unwrap()
            .message
            .unwrap()
            .contains("secret name or namespace not specified"));
        assert!(fx.driver.create_calls().is_empty());
    }

    // Scenario: the secret objects are referenced but unreadable.
    #[tokio::test]
    async fn secret_fetch_failure_fails_create() {
        let fx = fixture(false);
        fx.cluster.add_class(class("invalidSecretClass", &[]));
        fx.cluster.inject_error("get_secret", "simulated get secrets error");
        let mut content = dynamic_content("c3", Some("invalidSecretClass"));
        annotate(&mut content, keys::ANN_DELETION_SECRET_NAME, "secret");
        annotate(&mut content, keys::ANN_DELETION_SECRET_NAMESPACE, "default");
        content.status = Some(NfsExportContentStatus {
            ready_to_use: Some(false),
            ..Default::default()
        });
        fx.cluster.add_content(content);

        let content = fx.cluster.content("c3").unwrap();
        let err = fx.controller.sync(&content).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("cannot get credentials for export content"));

        let stored = fx.cluster.content("c3").unwrap();
        assert!(stored
            .status
            .unwrap()
            .error
            .unwrap()
            .message
            .unwrap()
            .contains("cannot get credentials for export content"));
    }

    // Scenario: pre-provisioned, pre-bound content is adopted through a
    // status probe.
    #[tokio::test]
    async fn preprovisioned_content_adopts_status() {
        let fx = fixture(false);
        fx.cluster.add_class(class(
            "c",
            &[
                (keys::PARAM_LIST_SECRET_NAME, "list-secret"),
                (keys::PARAM_LIST_SECRET_NAMESPACE, "default"),
            ],
        ));
        let mut secret = Secret::default();
        secret.metadata.name = Some("list-secret".into());
        secret.metadata.namespace = Some("default".into());
        fx.cluster.add_secret(secret);

        fx.cluster.add_content(preprovisioned_content("c4", Some("c")));
        fx.driver.script_status(Ok(ExportStatus {
            ready_to_use: true,
            creation_time: None,
            size_bytes: 0,
        }));

        let content = fx.cluster.content("c4").unwrap();
        fx.controller.sync(&content).await.unwrap();

        let stored = fx.cluster.content("c4").unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.ready_to_use, Some(true));
        assert_eq!(status.export_handle.as_deref(), Some("e1-handle"));
        assert_eq!(status.restore_size, Some(0));
        assert_eq!(fx.driver.status_calls(), vec!["e1-handle".to_string()]);
    }

    // Scenario: delete with policy Delete after ready. First sync issues
    // DeleteExport and nulls the handles; the next removes the finalizer.
    #[tokio::test]
    async fn delete_nulls_status_then_releases_finalizer() {
        let fx = fixture(false);
        let mut content = dynamic_content("c5", Some("gold"));
        annotate(&mut content, keys::ANN_BEING_DELETED, "yes");
        content.metadata.deletion_timestamp = Some(Time(Utc::now()));
        content.status = Some(NfsExportContentStatus {
            export_handle: Some("exp-5".into()),
            ready_to_use: Some(true),
            creation_time: Some(42),
            restore_size: Some(1 << 20),
            error: None,
        });
        fx.cluster.add_content(content);

        let content = fx.cluster.content("c5").unwrap();
        fx.controller.sync(&content).await.unwrap();

        assert_eq!(fx.driver.delete_calls(), vec!["exp-5".to_string()]);
        let stored = fx.cluster.content("c5").unwrap();
        let status = stored.status.clone().unwrap();
        assert!(status.export_handle.is_none());
        assert!(status.ready_to_use.is_none());
        assert!(status.creation_time.is_none());
        assert!(status.restore_size.is_none());
        // Finalizer still present until the next reconcile.
        assert!(stored
            .metadata
            .finalizers
            .as_deref()
            .unwrap()
            .contains(&keys::FINALIZER_CONTENT_BOUND.to_string()));

        // Next reconcile: no handle left, finalizer goes, object is reaped.
        fx.controller.sync(&stored).await.unwrap();
        assert!(fx.cluster.content("c5").is_none());
        assert_eq!(fx.cluster.removed_contents(), vec!["c5".to_string()]);
        // No second driver delete.
        assert_eq!(fx.driver.delete_calls().len(), 1);
    }

    #[tokio::test]
    async fn deletion_is_deferred_while_create_in_flight() {
        let fx = fixture(false);
        let mut content = dynamic_content("c6", Some("gold"));
        content.metadata.deletion_timestamp = Some(Time(Utc::now()));
        annotate(&mut content, keys::ANN_BEING_DELETED, "yes");
        annotate(&mut content, keys::ANN_BEING_CREATED, "yes");
        assert!(!fx.controller.should_delete(&content));

        // Once the annotation clears, deletion proceeds.
        content
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .remove(keys::ANN_BEING_CREATED);
        assert!(fx.controller.should_delete(&content));
    }

    #[tokio::test]
    async fn unbound_preprovisioned_content_is_deletable_without_annotation() {
        let fx = fixture(false);
        let mut content = preprovisioned_content("c7", None);
        content.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert!(fx.controller.should_delete(&content));
    }

    // A non-final error keeps being-created set so no second CreateExport
    // can be issued; a final error clears it.
    #[tokio::test]
    async fn transient_create_error_keeps_annotation() {
        let fx = fixture(false);
        fx.cluster.add_class(class("gold", &[]));
        fx.cluster.add_content(dynamic_content("c8", Some("gold")));
        fx.driver.script_create(Err(DriverError::Rpc(
            tonic::Status::deadline_exceeded("driver timed out"),
        )));

        let content = fx.cluster.content("c8").unwrap();
        fx.controller.sync(&content).await.unwrap_err();

        let stored = fx.cluster.content("c8").unwrap();
        assert!(keys::has_annotation(
            stored.metadata.annotations.as_ref(),
            keys::ANN_BEING_CREATED
        ));
        // Transient outcome: nothing user-visible is written.
        assert!(stored.status.is_none());
        // The annotation defers any deletion until the outcome is known.
        let mut deleting = stored.clone();
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
        annotate(&mut deleting, keys::ANN_BEING_DELETED, "yes");
        assert!(!fx.controller.should_delete(&deleting));
    }

    #[tokio::test]
    async fn final_create_error_clears_annotation_and_records_status() {
        let fx = fixture(false);
        fx.cluster.add_class(class("gold", &[]));
        fx.cluster.add_content(dynamic_content("c9", Some("gold")));
        fx.driver.script_create(Err(DriverError::Rpc(
            tonic::Status::invalid_argument("no such volume"),
        )));

        let content = fx.cluster.content("c9").unwrap();
        fx.controller.sync(&content).await.unwrap_err();

        let stored = fx.cluster.content("c9").unwrap();
        assert!(!keys::has_annotation(
            stored.metadata.annotations.as_ref(),
            keys::ANN_BEING_CREATED
        ));
        let status = stored.status.unwrap();
        assert_eq!(status.ready_to_use, Some(false));
        assert!(status.error.unwrap().message.unwrap().contains("no such volume"));
    }

    // Steady state: a ready content produces no driver calls and no writes
    // beyond (at most) annotation cleanup.
    #[tokio::test]
    async fn ready_content_is_left_alone() {
        let fx = fixture(false);
        let mut content = dynamic_content("c10", Some("gold"));
        content.status = Some(NfsExportContentStatus {
            export_handle: Some("exp-10".into()),
            ready_to_use: Some(true),
            creation_time: Some(42),
            restore_size: Some(1),
            error: None,
        });
        fx.cluster.add_content(content);

        let before = fx.cluster.content("c10").unwrap();
        fx.controller.sync(&before).await.unwrap();
        let after = fx.cluster.content("c10").unwrap();

        assert!(fx.driver.create_calls().is_empty());
        assert!(fx.driver.status_calls().is_empty());
        assert_eq!(
            before.metadata.resource_version,
            after.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn identical_error_message_is_not_rewritten() {
        let fx = fixture(false);
        let mut content = dynamic_content("c11", Some("missing-class"));
        content.status = Some(NfsExportContentStatus {
            ready_to_use: Some(false),
            error: Some(ExportError {
                time: Some("2026-01-01T00:00:00Z".into()),
                message: Some(
                    "Failed to check and update export content: validation error: export class missing-class not found"
                        .into(),
                ),
            }),
            ..Default::default()
        });
        fx.cluster.add_content(content);

        let before = fx.cluster.content("c11").unwrap();
        fx.controller.sync(&before).await.unwrap_err();
        let after = fx.cluster.content("c11").unwrap();
        // Same message: no status write happened.
        assert_eq!(
            before.metadata.resource_version,
            after.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn driver_mismatch_is_skipped() {
        let fx = fixture(false);
        let mut content = dynamic_content("c12", None);
        content.spec.driver = "other.example.com".into();
        assert!(!fx.controller.is_driver_match(&content).await);

        let mut no_source = dynamic_content("c13", None);
        no_source.spec.source.volume_handle = None;
        assert!(!fx.controller.is_driver_match(&no_source).await);

        assert!(fx.controller.is_driver_match(&dynamic_content("c14", None)).await);
    }
}
