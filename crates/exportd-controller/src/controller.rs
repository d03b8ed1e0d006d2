//! Common reconciler: owns the NfsExport lifecycle, the bidirectional
//! binding, finalizer choreography and status mirroring.
//!
//! The binding between a namespaced NfsExport and a cluster-scoped
//! NfsExportContent is maintained without transactions. Dynamic provisioning
//! runs three ordered steps — create the content with `exportRef.uid`, set
//! `status.boundContentName`, let the sidecar call the driver — and a crash
//! between any two must be recoverable. The deterministic content name
//! (derived from the export UID) makes the first step idempotent; the
//! sidecar's `being-created` annotation guards the third.
//!
//! Each reconciliation pass treats one side as authoritative: this controller
//! writes NfsExports (plus content metadata it owns: the `being-deleted`
//! annotation and the bound finalizer), never both objects in one patch.

use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use exportd_common::api::{content_object_ref, export_object_ref, ClusterApi};
use exportd_common::crd::{
    ContentSource, DeletionPolicy, ExportRef, NfsExport, NfsExportContent, NfsExportContentSpec,
};
use exportd_common::events::{reasons, EventPublisher};
use exportd_common::queue::WorkQueue;
use exportd_common::secret::{secret_reference, EXPORT_SECRET_PARAMS};
use exportd_common::store::VersionedStore;
use exportd_common::{keys, validation, Error};
use exportd_metrics::{ExportKind, Operation, OperationMetrics, OperationStatus};

/// Behavior toggles of the common reconciler.
pub struct CommonConfig {
    /// Label contents with the owning node for node-local volumes.
    pub enable_distributed_export: bool,
    /// Record the source volume mode on created contents so the webhook can
    /// enforce its immutability.
    pub prevent_volume_mode_conversion: bool,
}

/// The common reconciler.
pub struct CommonController {
    api: Arc<dyn ClusterApi>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<OperationMetrics>,
    export_store: Mutex<VersionedStore<NfsExport>>,
    content_store: Mutex<VersionedStore<NfsExportContent>>,
    export_queue: Arc<WorkQueue>,
    content_queue: Arc<WorkQueue>,
    config: CommonConfig,
}

impl CommonController {
    /// Create the reconciler.
    pub fn new(
        api: Arc<dyn ClusterApi>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<OperationMetrics>,
        export_queue: Arc<WorkQueue>,
        content_queue: Arc<WorkQueue>,
        config: CommonConfig,
    ) -> Self {
        Self {
            api,
            events,
            metrics,
            export_store: Mutex::new(VersionedStore::new()),
            content_store: Mutex::new(VersionedStore::new()),
            export_queue,
            content_queue,
            config,
        }
    }

    /// The export work queue.
    pub fn export_queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.export_queue)
    }

    /// The content work queue.
    pub fn content_queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.content_queue)
    }

    fn lock_exports(&self) -> std::sync::MutexGuard<'_, VersionedStore<NfsExport>> {
        self.export_store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_contents(&self) -> std::sync::MutexGuard<'_, VersionedStore<NfsExportContent>> {
        self.content_store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record a watched export in the cache; false means stale.
    pub fn store_export(&self, export: &NfsExport) -> bool {
        match self.lock_exports().update(export) {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(export = %export.key(), error = %e, "cannot update export cache");
                true
            }
        }
    }

    /// Record a watched content in the cache; false means stale.
    pub fn store_content(&self, content: &NfsExportContent) -> bool {
        match self.lock_contents().update(content) {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(content = %content.name_any(), error = %e, "cannot update content cache");
                true
            }
        }
    }

    /// Cached export keys, for resync.
    pub fn cached_export_keys(&self) -> Vec<String> {
        self.lock_exports().keys()
    }

    /// Cached content keys, for resync.
    pub fn cached_content_keys(&self) -> Vec<String> {
        self.lock_contents().keys()
    }

    /// Handle an export delete event: record the delete metric and nudge the
    /// bound content so it does not wait for the next resync.
    pub fn on_export_deleted(&self, export: &NfsExport) {
        self.lock_exports().remove(&export.key());

        let uid = export.metadata.uid.clone().unwrap_or_default();
        let driver = self.export_driver_name(export);
        self.metrics.record_metrics(
            Operation::DeleteExport,
            &uid,
            OperationStatus::Success,
            &driver,
        );

        if let Some(content_name) = export
            .status
            .as_ref()
            .and_then(|s| s.bound_content_name.clone())
        {
            debug!(export = %export.key(), content = %content_name, "scheduling content sync after export deletion");
            self.content_queue.add(&content_name);
        }
    }

    /// Handle a content delete event: re-drive the referenced export so it
    /// can release its bound finalizer.
    pub fn on_content_deleted(&self, content: &NfsExportContent) {
        self.lock_contents().remove(&content.name_any());
        let export_key = content.spec.export_ref.key();
        if export_key != "/" {
            self.export_queue.add(&export_key);
        }
    }

    /// Reconcile one export key (`namespace/name`).
    pub async fn sync_export_key(&self, key: &str) -> Result<(), Error> {
        let Some(export) = self.lock_exports().get(key) else {
            debug!(key, "export already removed from cache");
            return Ok(());
        };
        self.sync_export(export).await
    }

    /// Reconcile one content key.
    pub async fn sync_content_key(&self, key: &str) -> Result<(), Error> {
        let Some(content) = self.lock_contents().get(key) else {
            debug!(key, "content already removed from cache");
            return Ok(());
        };
        self.sync_content(content).await
    }

    // ------------------------------------------------------------------
    // Content-side sync
    // ------------------------------------------------------------------

    /// Controller-side content sync: label maintenance, finalizer install,
    /// status-diff propagation and the `being-deleted` handshake.
    pub async fn sync_content(&self, content: NfsExportContent) -> Result<(), Error> {
        let export_key = content.spec.export_ref.key();
        debug!(content = %content.name_any(), export = %export_key, "synchronizing NfsExportContent");

        let content = self.check_and_set_invalid_content_label(content).await?;

        if content.spec.source.validate_exclusive().is_err() {
            let message = "Exactly one of volumeHandle and exportHandle should be specified";
            self.emit(
                &content_object_ref(&content),
                EventType::Warning,
                reasons::CONTENT_VALIDATION_ERROR,
                message,
            )
            .await;
            return Err(Error::validation(message));
        }

        // Reserved for an export that has not bound it yet; the export-side
        // sync does the binding.
        if content.spec.export_ref.uid.is_empty() {
            debug!(content = %content.name_any(), "content is pre-bound to export {export_key}");
            return Ok(());
        }

        if content.needs_bound_finalizer(keys::FINALIZER_CONTENT_BOUND) {
            return self.add_content_finalizer(&content).await;
        }

        let export = self.lock_exports().get(&export_key);
        let export = match export {
            Some(export)
                if export.metadata.uid.as_deref()
                    != Some(content.spec.export_ref.uid.as_str()) =>
            {
                // The export this content pointed at was deleted and another
                // with the same name created: treat as missing.
                debug!(content = %content.name_any(), "export {export_key} has a different UID");
                None
            }
            other => other,
        };

        if let Some(export) = export {
            if needs_update_export_status(&export, &content) {
                // Bring the user-facing mirror in sync right away instead of
                // waiting for its resync.
                self.export_queue.add(&export_key);
            }
            if is_export_deletion_candidate(&export) {
                self.set_being_deleted(&content).await?;
            }
        }

        Ok(())
    }

    async fn add_content_finalizer(&self, content: &NfsExportContent) -> Result<(), Error> {
        let name = content.name_any();
        let patch =
            exportd_common::patch::add_finalizer(&content.metadata, keys::FINALIZER_CONTENT_BOUND)?;
        let patched = self
            .api
            .patch_content(&name, &patch)
            .await
            .map_err(|e| Error::api_update(&name, e.to_string()))?;
        self.store_content(&patched);
        debug!(content = %name, "added content-bound finalizer");
        Ok(())
    }

    async fn set_being_deleted(&self, content: &NfsExportContent) -> Result<NfsExportContent, Error> {
        if keys::has_annotation(content.metadata.annotations.as_ref(), keys::ANN_BEING_DELETED) {
            return Ok(content.clone());
        }
        let name = content.name_any();
        let patch =
            exportd_common::patch::set_annotation(&content.metadata, keys::ANN_BEING_DELETED, "yes")?;
        let patched = self
            .api
            .patch_content(&name, &patch)
            .await
            .map_err(|e| Error::api_update(&name, e.to_string()))?;
        self.store_content(&patched);
        debug!(content = %name, "set being-deleted annotation");
        Ok(patched)
    }

    // ------------------------------------------------------------------
    // Export-side sync
    // ------------------------------------------------------------------

    /// Export sync entry point.
    pub async fn sync_export(&self, export: NfsExport) -> Result<(), Error> {
        let key = export.key();
        debug!(export = %key, "synchronizing NfsExport");

        // PVC protection upkeep runs on every pass; a failure is logged and
        // reported but does not block the rest of the reconciliation.
        if let Err(e) = self.check_and_remove_pvc_finalizer(&export, false).await {
            warn!(export = %key, error = %e, "check and remove PVC finalizer failed");
            self.emit(
                &export_object_ref(&export),
                EventType::Warning,
                reasons::PVC_FINALIZER_ERROR,
                "Error check and remove PVC Finalizer for NfsExport",
            )
            .await;
        }

        let export = self.check_and_set_invalid_export_label(export).await?;

        if export.metadata.deletion_timestamp.is_some() {
            return self.process_export_deletion(&export).await;
        }

        if export.spec.source.validate_exclusive().is_err() {
            let message = "Exactly one of sourceClaim and adoptContentName should be specified";
            self.update_export_error_status_with_event(
                &export,
                true,
                reasons::EXPORT_VALIDATION_ERROR,
                message,
            )
            .await?;
            return Err(Error::validation(message));
        }

        let export = if export.spec.class_name.is_none() && export.is_dynamic() {
            match self.set_default_class(export.clone()).await {
                Ok(updated) => updated,
                Err(e) => {
                    self.update_export_error_status_with_event(
                        &export,
                        true,
                        reasons::SET_DEFAULT_CLASS_FAILED,
                        &format!("Failed to set default export class with error {e}"),
                    )
                    .await?;
                    return Err(e);
                }
            }
        } else {
            export
        };

        if let Err(e) = self.check_and_add_export_finalizers(&export).await {
            self.emit(
                &export_object_ref(&export),
                EventType::Warning,
                reasons::EXPORT_FINALIZER_ERROR,
                &format!("Failed to check and update export: {e}"),
            )
            .await;
            return Err(e);
        }

        if !export.is_ready() || !export.is_bound() {
            self.sync_unready_export(&export).await
        } else {
            self.sync_ready_export(&export).await
        }
    }

    /// A ready-and-bound export: verify the binding still holds.
    async fn sync_ready_export(&self, export: &NfsExport) -> Result<(), Error> {
        let Some(content_name) = export
            .status
            .as_ref()
            .and_then(|s| s.bound_content_name.clone())
        else {
            return Err(Error::internal(
                "controller",
                format!("export {} is not bound to a content", export.key()),
            ));
        };

        let Some(content) = self.lock_contents().get(&content_name) else {
            return self
                .update_export_error_status_with_event(
                    export,
                    true,
                    reasons::CONTENT_MISSING,
                    "NfsExportContent is missing",
                )
                .await;
        };

        if !content.spec.export_ref.matches(export) {
            return self
                .update_export_error_status_with_event(
                    export,
                    true,
                    reasons::CONTENT_MISBOUND,
                    "NfsExportContent is not bound to the NfsExport correctly",
                )
                .await;
        }
        Ok(())
    }

    /// An export that is not yet ready or not yet bound.
    async fn sync_unready_export(&self, export: &NfsExport) -> Result<(), Error> {
        let key = export.key();
        let uid = export.metadata.uid.clone().unwrap_or_default();
        debug!(export = %key, "syncUnreadyExport");

        let driver = self.export_driver_name(export);
        let kind = if export.is_dynamic() {
            ExportKind::Dynamic
        } else {
            ExportKind::PreProvisioned
        };

        if !export.is_created() {
            self.metrics
                .operation_start(Operation::CreateExport, &uid, &driver, kind);
        }
        self.metrics
            .operation_start(Operation::CreateExportAndReady, &uid, &driver, kind);

        // Pre-provisioned: adopt the named content.
        if let Some(adopt_name) = export.spec.source.adopt_content_name.clone() {
            let Some(content) = self.find_preprovisioned_content(export).await? else {
                self.update_export_error_status_with_event(
                    export,
                    true,
                    reasons::CONTENT_MISSING,
                    "NfsExportContent is missing",
                )
                .await?;
                return Err(Error::validation(format!(
                    "export {key} requests an non-existing content {adopt_name}"
                )));
            };

            let content = match self.check_and_bind_content(export, content).await {
                Ok(content) => content,
                Err(e) => {
                    self.update_export_error_status_with_event(
                        export,
                        true,
                        reasons::EXPORT_BIND_FAILED,
                        &format!("Export failed to bind NfsExportContent, {e}"),
                    )
                    .await?;
                    return Err(Error::validation(format!(
                        "export {key} is bound, but NfsExportContent {adopt_name} is not bound to the NfsExport correctly, {e}"
                    )));
                }
            };

            if let Err(e) = self.update_export_status(export, &content).await {
                self.update_export_error_status_with_event(
                    export,
                    false,
                    reasons::EXPORT_STATUS_UPDATE_FAILED,
                    &format!("Export status update failed, {e}"),
                )
                .await?;
                return Err(e);
            }
            return Ok(());
        }

        // Dynamic provisioning.
        if let Some(content) = self.find_dynamic_content(export).await? {
            if content.spec.source.export_handle.is_some() {
                self.update_export_error_status_with_event(
                    export,
                    true,
                    reasons::EXPORT_HANDLE_SET,
                    &format!("Export handle should not be set in content {key} for dynamic provisioning"),
                )
                .await?;
                return Err(Error::validation(format!(
                    "exportHandle should not be set in the content for dynamic provisioning for export {key}"
                )));
            }
            if let Err(e) = self.update_export_status(export, &content).await {
                self.update_export_error_status_with_event(
                    export,
                    false,
                    reasons::EXPORT_STATUS_UPDATE_FAILED,
                    &format!("Export status update failed, {e}"),
                )
                .await?;
                return Err(e);
            }
            return Ok(());
        }

        if export.spec.source.source_claim.is_none() {
            self.update_export_error_status_with_event(
                export,
                true,
                reasons::EXPORT_PVC_SOURCE_MISSING,
                &format!("PVC source for export {key} is missing"),
            )
            .await?;
            return Err(Error::validation(format!(
                "expected PVC source for export {key} but got none"
            )));
        }

        let content = match self.create_content_for(export).await {
            Ok(content) => content,
            Err(e) => {
                self.update_export_error_status_with_event(
                    export,
                    true,
                    reasons::CONTENT_CREATION_FAILED,
                    &format!("Failed to create export content with error {e}"),
                )
                .await?;
                return Err(e);
            }
        };

        if let Err(e) = self.update_export_status(export, &content).await {
            self.update_export_error_status_with_event(
                export,
                false,
                reasons::EXPORT_STATUS_UPDATE_FAILED,
                &format!("Export status update failed, {e}"),
            )
            .await?;
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deletion path
    // ------------------------------------------------------------------

    async fn process_export_deletion(&self, export: &NfsExport) -> Result<(), Error> {
        let key = export.key();
        debug!(export = %key, "processing export with deletion timestamp");

        let uid = export.metadata.uid.clone().unwrap_or_default();
        let driver = self.export_driver_name(export);
        let kind = if export.is_dynamic() {
            ExportKind::Dynamic
        } else {
            ExportKind::PreProvisioned
        };
        self.metrics
            .operation_start(Operation::DeleteExport, &uid, &driver, kind);

        // Find the content even if the status write never happened: a crash
        // between content creation and the status update leaves a content
        // under the deterministic name.
        let mut content_name = export
            .status
            .as_ref()
            .and_then(|s| s.bound_content_name.clone())
            .unwrap_or_default();
        if content_name.is_empty() && export.is_dynamic() {
            content_name = content_name_for(export);
        }

        let content = if content_name.is_empty() {
            None
        } else {
            self.lock_contents().get(&content_name)
        };

        // Only a content that points back at this export is acted on;
        // touching anything else risks deleting a stranger's data.
        let (content, delete_content) = match content {
            Some(content) if content.spec.export_ref.matches(export) => {
                let delete = content.spec.deletion_policy == DeletionPolicy::Delete;
                (Some(content), delete)
            }
            _ => (None, false),
        };

        if !is_export_deletion_candidate(export) {
            return Ok(());
        }

        // Wait while the export feeds a pending PVC restore.
        if content.is_some() && self.is_volume_being_created_from_export(export).await {
            info!(export = %key, "export is being used to restore a PVC, deferring deletion");
            self.emit(
                &export_object_ref(export),
                EventType::Warning,
                reasons::EXPORT_DELETE_PENDING,
                "Export is being used to restore a PVC",
            )
            .await;
            return Ok(());
        }

        // Regardless of the deletion policy, hand the sidecar its permission
        // to call DeleteExport.
        let content = match content {
            Some(content) => Some(self.set_being_deleted(&content).await?),
            None => None,
        };

        if let Some(content) = &content {
            if delete_content {
                debug!(content = %content.name_any(), "deleting content object");
                if let Err(e) = self.api.delete_content(&content.name_any()).await {
                    self.emit(
                        &export_object_ref(export),
                        EventType::Warning,
                        reasons::CONTENT_OBJECT_DELETE_ERROR,
                        "Failed to delete export content API object",
                    )
                    .await;
                    return Err(Error::api_update(content.name_any(), e.to_string()));
                }
            }
        }

        // The as-source finalizer always goes now. The bound finalizer stays
        // while a to-be-deleted content still exists: its removal is driven
        // by the content's own deletion event.
        let remove_bound = !(content.is_some() && delete_content);
        self.remove_export_finalizers(export, true, remove_bound).await
    }

    async fn remove_export_finalizers(
        &self,
        export: &NfsExport,
        remove_as_source: bool,
        remove_bound: bool,
    ) -> Result<(), Error> {
        if !remove_as_source && !remove_bound {
            return Ok(());
        }

        // The PVC finalizer must be released before the export disappears:
        // once the export is gone no event will ever trigger this again.
        if let Err(e) = self.check_and_remove_pvc_finalizer(export, true).await {
            self.emit(
                &export_object_ref(export),
                EventType::Warning,
                reasons::PVC_FINALIZER_ERROR,
                "Error check and remove PVC Finalizer for NfsExport",
            )
            .await;
            return Err(Error::api_update(export.name_any(), e.to_string()));
        }

        let mut updated = export.clone();
        let finalizers = updated.metadata.finalizers.get_or_insert_with(Vec::new);
        if remove_as_source {
            finalizers.retain(|f| f != keys::FINALIZER_EXPORT_AS_SOURCE);
        }
        if remove_bound {
            finalizers.retain(|f| f != keys::FINALIZER_EXPORT_BOUND);
        }
        let stored = self
            .api
            .update_export(&updated)
            .await
            .map_err(|e| Error::api_update(export.name_any(), e.to_string()))?;
        self.store_export(&stored);
        info!(export = %export.key(), "removed export finalizers");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Finalizers and PVC protection
    // ------------------------------------------------------------------

    async fn check_and_add_export_finalizers(&self, export: &NfsExport) -> Result<(), Error> {
        let content = if export.spec.source.adopt_content_name.is_some() {
            self.find_preprovisioned_content(export).await?
        } else {
            self.find_dynamic_content(export).await?
        };

        let add_source = export.metadata.deletion_timestamp.is_none()
            && !has_finalizer(export, keys::FINALIZER_EXPORT_AS_SOURCE);

        // The bound finalizer is only needed when deletion would cascade to
        // the backend: bound export, live object, content policy Delete.
        let add_bound = content
            .as_ref()
            .map(|content| {
                export.metadata.deletion_timestamp.is_none()
                    && !has_finalizer(export, keys::FINALIZER_EXPORT_BOUND)
                    && export.is_bound()
                    && content.spec.deletion_policy == DeletionPolicy::Delete
            })
            .unwrap_or(false);

        let mut wanted: Vec<&str> = Vec::new();
        if add_source {
            wanted.push(keys::FINALIZER_EXPORT_AS_SOURCE);
        }
        if add_bound {
            wanted.push(keys::FINALIZER_EXPORT_BOUND);
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let Some(patch) = exportd_common::patch::add_finalizers(&export.metadata, &wanted)? else {
            return Ok(());
        };
        let namespace = export.namespace().unwrap_or_default();
        let stored = self
            .api
            .patch_export(&namespace, &export.name_any(), &patch)
            .await
            .map_err(|e| Error::api_update(export.key(), e.to_string()))?;
        self.store_export(&stored);
        debug!(export = %export.key(), "added export finalizers");
        Ok(())
    }

    async fn ensure_pvc_finalizer(&self, export: &NfsExport) -> Result<(), Error> {
        if !export.is_dynamic() {
            return Ok(());
        }

        let pvc = self.claim_from_export(export).await.map_err(|e| {
            info!(export = %export.key(), error = %e, "cannot get claim from export");
            Error::api_update(export.name_any(), "cannot get claim from export")
        })?;

        if pvc
            .metadata
            .finalizers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|f| f == keys::FINALIZER_PVC_AS_SOURCE)
        {
            return Ok(());
        }

        if pvc.metadata.deletion_timestamp.is_some() {
            return Err(Error::api_update(
                pvc.name_any(),
                "cannot add finalizer on claim because it is being deleted",
            ));
        }

        let mut updated = pvc.clone();
        updated
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(keys::FINALIZER_PVC_AS_SOURCE.to_string());
        self.api
            .update_pvc(&updated)
            .await
            .map_err(|e| Error::api_update(pvc.name_any(), e.to_string()))?;
        info!(pvc = %pvc.name_any(), "added protection finalizer to source claim");
        Ok(())
    }

    async fn check_and_remove_pvc_finalizer(
        &self,
        export: &NfsExport,
        skip_current_export: bool,
    ) -> Result<(), Error> {
        if !export.is_dynamic() {
            return Ok(());
        }
        let Ok(pvc) = self.claim_from_export(export).await else {
            // Claim already gone; nothing to clean.
            return Ok(());
        };

        if !pvc
            .metadata
            .finalizers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|f| f == keys::FINALIZER_PVC_AS_SOURCE)
        {
            return Ok(());
        }

        if self
            .is_pvc_being_used(&pvc, export, skip_current_export)
            .await
        {
            return Ok(());
        }

        let mut updated = pvc.clone();
        if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != keys::FINALIZER_PVC_AS_SOURCE);
        }
        self.api
            .update_pvc(&updated)
            .await
            .map_err(|e| Error::api_update(pvc.name_any(), e.to_string()))?;
        info!(pvc = %pvc.name_any(), "removed protection finalizer from claim");
        Ok(())
    }

    /// Whether any unfinished export still cuts from this PVC.
    async fn is_pvc_being_used(
        &self,
        pvc: &PersistentVolumeClaim,
        export: &NfsExport,
        skip_current_export: bool,
    ) -> bool {
        let namespace = export.namespace().unwrap_or_default();
        let exports = match self.api.list_exports(&namespace).await {
            Ok(exports) => exports,
            Err(e) => {
                warn!(error = %e, "failed to list exports while checking PVC use");
                return false;
            }
        };

        for candidate in exports {
            if skip_current_export && candidate.name_any() == export.name_any() {
                continue;
            }
            let Some(claim) = candidate.spec.source.source_claim.as_deref() else {
                continue;
            };
            if claim == pvc.name_any() && !candidate.is_ready() {
                debug!(
                    pvc = %pvc.name_any(),
                    export = %candidate.key(),
                    "PVC is still used by an unfinished export"
                );
                return true;
            }
        }
        false
    }

    /// Whether a pending PVC restore references this export as data source.
    async fn is_volume_being_created_from_export(&self, export: &NfsExport) -> bool {
        let namespace = export.namespace().unwrap_or_default();
        let pvcs = match self.api.list_pvcs(&namespace).await {
            Ok(pvcs) => pvcs,
            Err(e) => {
                warn!(error = %e, "failed to list PVCs while checking restore use");
                return false;
            }
        };

        for pvc in pvcs {
            let Some(data_source) = pvc.spec.as_ref().and_then(|s| s.data_source.as_ref()) else {
                continue;
            };
            if data_source.kind == "NfsExport"
                && data_source.name == export.name_any()
                && data_source.api_group.as_deref() == Some(keys::API_GROUP)
                && pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending")
            {
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Content lookup and creation
    // ------------------------------------------------------------------

    /// Pre-provisioned content lookup; verifies the shape and the backlink.
    async fn find_preprovisioned_content(
        &self,
        export: &NfsExport,
    ) -> Result<Option<NfsExportContent>, Error> {
        let Some(content_name) = export.spec.source.adopt_content_name.clone() else {
            return Ok(None);
        };
        if content_name.is_empty() {
            return Err(Error::validation(format!(
                "empty adoptContentName for export {}",
                export.key()
            )));
        }

        let Some(content) = self.lock_contents().get(&content_name) else {
            return Ok(None);
        };

        if content.spec.source.export_handle.is_none() {
            self.update_export_error_status_with_event(
                export,
                true,
                reasons::CONTENT_MISMATCH,
                "NfsExportContent is dynamically provisioned while expecting a pre-provisioned one",
            )
            .await?;
            return Err(Error::validation(format!(
                "export {} expects a pre-provisioned NfsExportContent {content_name} but gets a dynamically provisioned one",
                export.key()
            )));
        }

        // An unbound pre-provisioned content has an empty UID; anything else
        // must match exactly.
        let export_ref = &content.spec.export_ref;
        if export_ref.name != export.name_any()
            || Some(export_ref.namespace.as_str()) != export.namespace().as_deref()
            || (!export_ref.uid.is_empty()
                && Some(export_ref.uid.as_str()) != export.metadata.uid.as_deref())
        {
            let message = format!("NfsExportContent [{content_name}] is bound to a different export");
            self.update_export_error_status_with_event(
                export,
                true,
                reasons::CONTENT_MISBOUND,
                &message,
            )
            .await?;
            return Err(Error::validation(message));
        }
        Ok(Some(content))
    }

    /// Dynamic content lookup under the deterministic name; verifies the
    /// shape and the backlink including UID.
    async fn find_dynamic_content(
        &self,
        export: &NfsExport,
    ) -> Result<Option<NfsExportContent>, Error> {
        let content_name = content_name_for(export);
        let Some(content) = self.lock_contents().get(&content_name) else {
            return Ok(None);
        };

        if content.spec.source.volume_handle.is_none() {
            self.update_export_error_status_with_event(
                export,
                true,
                reasons::CONTENT_MISMATCH,
                &format!("NfsExportContent {content_name} is pre-provisioned while expecting a dynamically provisioned one"),
            )
            .await?;
            return Err(Error::validation(format!(
                "export {} expects a dynamically provisioned NfsExportContent {content_name} but gets a pre-provisioned one",
                export.key()
            )));
        }

        // A dynamically provisioned content MUST carry the export UID; an
        // empty UID is not a legit state here.
        if !content.spec.export_ref.matches(export) {
            let message = format!("NfsExportContent [{content_name}] is bound to a different export");
            self.update_export_error_status_with_event(
                export,
                true,
                reasons::CONTENT_MISBOUND,
                &message,
            )
            .await?;
            return Err(Error::validation(message));
        }
        Ok(Some(content))
    }

    /// Create the content object for a dynamic export (idempotent through
    /// the deterministic name).
    async fn create_content_for(&self, export: &NfsExport) -> Result<NfsExportContent, Error> {
        let key = export.key();
        info!(export = %key, "creating content for export");

        // The source PVC is pinned before anything else so it cannot vanish
        // mid-provisioning.
        self.ensure_pvc_finalizer(export).await?;

        let Some(class_name) = export.spec.class_name.clone() else {
            return Err(Error::validation(format!(
                "failed to take export {key} without an export class"
            )));
        };
        let class = self
            .api
            .get_class(&class_name)
            .await?
            .ok_or_else(|| Error::validation(format!("export class {class_name} not found")))?;

        let pv = self.volume_from_export(export).await?;
        let Some(volume_handle) = pv
            .spec
            .as_ref()
            .and_then(|s| s.csi.as_ref())
            .map(|csi| csi.volume_handle.clone())
        else {
            return Err(Error::validation(format!(
                "cannot find CSI PersistentVolumeSource for volume {}",
                pv.name_any()
            )));
        };

        let content_name = content_name_for(export);
        let secret_ref = secret_reference(
            &EXPORT_SECRET_PARAMS,
            &class.spec.parameters,
            &content_name,
            Some(export),
        )?;

        let mut content = NfsExportContent::new(
            &content_name,
            NfsExportContentSpec {
                export_ref: ExportRef {
                    name: export.name_any(),
                    namespace: export.namespace().unwrap_or_default(),
                    uid: export.metadata.uid.clone().unwrap_or_default(),
                },
                deletion_policy: class.spec.deletion_policy,
                driver: class.spec.driver.clone(),
                class_name: Some(class_name),
                source: ContentSource {
                    volume_handle: Some(volume_handle),
                    export_handle: None,
                },
                source_volume_mode: if self.config.prevent_volume_mode_conversion {
                    pv.spec.as_ref().and_then(|s| s.volume_mode.clone())
                } else {
                    None
                },
            },
        );

        if let Some(secret_ref) = &secret_ref {
            let annotations = content.metadata.annotations.get_or_insert_with(Default::default);
            annotations.insert(
                keys::ANN_DELETION_SECRET_NAME.to_string(),
                secret_ref.name.clone(),
            );
            annotations.insert(
                keys::ANN_DELETION_SECRET_NAMESPACE.to_string(),
                secret_ref.namespace.clone(),
            );
        }

        if self.config.enable_distributed_export {
            if let Some(node) = self.managed_by_node(&pv).await? {
                content
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(keys::LABEL_MANAGED_BY.to_string(), node);
            }
        }

        let stored = match self.api.create_content(&content).await {
            Ok(stored) => stored,
            Err(e) if e.is_already_exists() => {
                debug!(content = %content_name, "content already exists, reusing");
                self.api
                    .get_content(&content_name)
                    .await?
                    .unwrap_or(content)
            }
            Err(e) => {
                let message =
                    format!("Error creating export content object for export {key}: {e}.");
                warn!("{message}");
                self.emit(
                    &export_object_ref(export),
                    EventType::Warning,
                    reasons::CONTENT_CREATION_FAILED,
                    &message,
                )
                .await;
                return Err(Error::api_update(key, e.to_string()));
            }
        };

        self.emit(
            &export_object_ref(export),
            EventType::Normal,
            reasons::CREATING_EXPORT,
            &format!("Waiting for an export {key} to be created by the driver."),
        )
        .await;

        self.store_content(&stored);
        Ok(stored)
    }

    /// Resolve the bound PV behind the export's source claim.
    async fn volume_from_export(&self, export: &NfsExport) -> Result<PersistentVolume, Error> {
        let pvc = self.claim_from_export(export).await?;

        if pvc.status.as_ref().and_then(|s| s.phase.as_deref()) != Some("Bound") {
            return Err(Error::validation(format!(
                "the PVC {} is not yet bound to a PV, will not attempt to take an export",
                pvc.name_any()
            )));
        }

        let pv_name = pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .unwrap_or_default();
        let pv = self
            .api
            .get_pv(&pv_name)
            .await?
            .ok_or_else(|| Error::validation(format!("failed to retrieve PV {pv_name}")))?;

        if !is_volume_bound_to_claim(&pv, &pvc) {
            warn!(pv = %pv_name, pvc = %pvc.name_any(), "binding between PV and PVC is broken");
            return Err(Error::validation("claim in dataSource not bound or invalid"));
        }
        Ok(pv)
    }

    async fn claim_from_export(&self, export: &NfsExport) -> Result<PersistentVolumeClaim, Error> {
        let Some(claim_name) = export.spec.source.source_claim.clone() else {
            return Err(Error::validation("the export source PVC name is not specified"));
        };
        if claim_name.is_empty() {
            return Err(Error::validation(format!(
                "the PVC name is not specified in export {}",
                export.key()
            )));
        }
        let namespace = export.namespace().unwrap_or_default();
        self.api
            .get_pvc(&namespace, &claim_name)
            .await?
            .ok_or_else(|| {
                Error::validation(format!("failed to retrieve PVC {claim_name}: not found"))
            })
    }

    /// Node owning a node-local volume, from the PV's required affinity.
    async fn managed_by_node(&self, pv: &PersistentVolume) -> Result<Option<String>, Error> {
        let Some(terms) = pv
            .spec
            .as_ref()
            .and_then(|s| s.node_affinity.as_ref())
            .and_then(|a| a.required.as_ref())
            .map(|r| r.node_selector_terms.clone())
        else {
            return Ok(None);
        };

        let nodes = self.api.list_nodes().await?;
        for node in nodes {
            if node_matches_selector_terms(&node, &terms) {
                return Ok(Some(node.name_any()));
            }
        }
        warn!(pv = %pv.name_any(), "no node matches the volume's node affinity");
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Binding and status mirroring
    // ------------------------------------------------------------------

    /// Bind a pre-provisioned content by installing the export UID (and
    /// class name) on it.
    async fn check_and_bind_content(
        &self,
        export: &NfsExport,
        content: NfsExportContent,
    ) -> Result<NfsExportContent, Error> {
        let export_ref = &content.spec.export_ref;
        if export_ref.name != export.name_any() {
            return Err(Error::validation(format!(
                "could not bind export {} and content {}, the exportRef does not match",
                export.name_any(),
                content.name_any()
            )));
        }
        if !export_ref.uid.is_empty()
            && Some(export_ref.uid.as_str()) != export.metadata.uid.as_deref()
        {
            return Err(Error::validation(format!(
                "could not bind export {} and content {}, the exportRef does not match",
                export.name_any(),
                content.name_any()
            )));
        }
        if !export_ref.uid.is_empty() && content.spec.class_name.is_some() {
            return Ok(content);
        }

        let uid = export.metadata.uid.clone().unwrap_or_default();
        let patch =
            exportd_common::patch::bind_content(&uid, export.spec.class_name.as_deref())?;
        let patched = self
            .api
            .patch_content(&content.name_any(), &patch)
            .await
            .map_err(|e| Error::api_update(content.name_any(), e.to_string()))?;
        self.store_content(&patched);
        Ok(patched)
    }

    /// Mirror content status into the export status.
    ///
    /// Only fields unset on the export are filled; `readyToUse` and `error`
    /// synchronize unconditionally. Success metrics and events fire before
    /// the write so a failed write retried later cannot double-count.
    async fn update_export_status(
        &self,
        export: &NfsExport,
        content: &NfsExportContent,
    ) -> Result<NfsExport, Error> {
        let namespace = export.namespace().unwrap_or_default();
        let name = export.name_any();

        let fresh = self
            .api
            .get_export(&namespace, &name)
            .await?
            .ok_or_else(|| {
                Error::internal("controller", format!("export {namespace}/{name} is gone"))
            })?;

        let content_status = content.status.as_ref();
        let bound_name = content.name_any();
        let created_at = content_status
            .and_then(|s| s.creation_time)
            .map(|ns| Utc.timestamp_nanos(ns).to_rfc3339());
        let size = content_status.and_then(|s| s.restore_size);
        let ready = content_status.and_then(|s| s.ready_to_use).unwrap_or(false);
        let content_error = content_status.and_then(|s| s.error.clone());

        let mut status = fresh.status.clone().unwrap_or_default();
        let mut updated = false;
        let mut clear_error = false;

        if status.bound_content_name.is_none() {
            status.bound_content_name = Some(bound_name);
            updated = true;
        }
        if status.creation_time.is_none() {
            if let Some(created_at) = created_at {
                status.creation_time = Some(created_at);
                updated = true;
            }
        }
        if status.ready_to_use != Some(ready) {
            status.ready_to_use = Some(ready);
            updated = true;
            if ready && status.error.is_some() {
                status.error = None;
                clear_error = true;
            }
        }
        let zero_size = status.restore_size == Some(0);
        if (status.restore_size.is_none() && size.is_some())
            || (zero_size && size.map(|s| s > 0).unwrap_or(false))
        {
            status.restore_size = size;
            updated = true;
        }
        if !clear_error && status.error != content_error {
            if content_error.is_some() {
                status.error = content_error;
                updated = true;
            } else if status.error.is_some() && ready {
                status.error = None;
                clear_error = true;
                updated = true;
            }
        }

        if !updated {
            return Ok(fresh);
        }

        // Metrics and events first (see the doc comment).
        let driver = content.spec.driver.clone();
        let uid = fresh.metadata.uid.clone().unwrap_or_default();
        let will_be_created = status.creation_time.is_some();
        if !fresh.is_created() && will_be_created {
            self.metrics.record_metrics(
                Operation::CreateExport,
                &uid,
                OperationStatus::Success,
                &driver,
            );
            self.emit(
                &export_object_ref(&fresh),
                EventType::Normal,
                reasons::EXPORT_CREATED,
                &format!("Export {namespace}/{name} was successfully created by the driver."),
            )
            .await;
        }
        if !fresh.is_ready() && status.ready_to_use == Some(true) {
            self.metrics.record_metrics(
                Operation::CreateExportAndReady,
                &uid,
                OperationStatus::Success,
                &driver,
            );
            self.emit(
                &export_object_ref(&fresh),
                EventType::Normal,
                reasons::EXPORT_READY,
                &format!("Export {namespace}/{name} is ready to use."),
            )
            .await;
        }

        let mut value = serde_json::to_value(&status)
            .map_err(|e| Error::internal("controller", format!("serialize status: {e}")))?;
        if clear_error {
            value["error"] = serde_json::Value::Null;
        }
        let stored = self
            .api
            .patch_export_status(&namespace, &name, value)
            .await
            .map_err(|e| Error::api_update(format!("{namespace}/{name}"), e.to_string()))?;
        self.store_export(&stored);
        Ok(stored)
    }

    /// Install the unique default class for the export's PV driver.
    async fn set_default_class(&self, export: NfsExport) -> Result<NfsExport, Error> {
        let classes = self.api.list_classes().await?;
        let pv_driver = self.pv_driver_from_export(&export).await?;

        let defaults: Vec<_> = classes
            .into_iter()
            .filter(|class| class.is_default() && class.spec.driver == pv_driver)
            .collect();

        if defaults.is_empty() {
            return Err(Error::validation("cannot find default export class"));
        }
        if defaults.len() > 1 {
            return Err(Error::validation(format!(
                "{} default export classes were found",
                defaults.len()
            )));
        }

        debug!(
            export = %export.key(),
            class = %defaults[0].name_any(),
            "installing default export class"
        );
        let mut updated = export;
        updated.spec.class_name = Some(defaults[0].name_any());
        let stored = self
            .api
            .update_export(&updated)
            .await
            .map_err(|e| Error::api_update(updated.key(), e.to_string()))?;
        self.store_export(&stored);
        Ok(stored)
    }

    /// CSI driver of the PV behind a dynamic export.
    async fn pv_driver_from_export(&self, export: &NfsExport) -> Result<String, Error> {
        let pv = self.volume_from_export(export).await?;
        pv.spec
            .as_ref()
            .and_then(|s| s.csi.as_ref())
            .map(|csi| csi.driver.clone())
            .ok_or_else(|| {
                Error::validation(format!(
                    "exporting non-CSI volumes is not supported, export:{}",
                    export.key()
                ))
            })
    }

    /// Best-effort driver name for metrics labels.
    fn export_driver_name(&self, export: &NfsExport) -> String {
        if let Some(content_name) = export.spec.source.adopt_content_name.as_deref() {
            if let Some(content) = self.lock_contents().get(content_name) {
                if !content.spec.driver.is_empty() {
                    return content.spec.driver;
                }
            }
        }
        String::new()
    }

    // ------------------------------------------------------------------
    // Invalid-label maintenance and status errors
    // ------------------------------------------------------------------

    /// Add or remove the invalid-resource label based on the admission
    /// rules. Informational only; never blocks reconciliation.
    async fn check_and_set_invalid_export_label(
        &self,
        export: NfsExport,
    ) -> Result<NfsExport, Error> {
        let has_label = export
            .metadata
            .labels
            .as_ref()
            .map(|l| l.contains_key(keys::LABEL_INVALID_EXPORT))
            .unwrap_or(false);
        let invalid = validation::validate_export(&export).is_err();

        if has_label == invalid {
            return Ok(export);
        }

        let mut updated = export.clone();
        let labels = updated.metadata.labels.get_or_insert_with(Default::default);
        if invalid {
            labels.insert(keys::LABEL_INVALID_EXPORT.to_string(), String::new());
        } else {
            labels.remove(keys::LABEL_INVALID_EXPORT);
        }
        let stored = self
            .api
            .update_export(&updated)
            .await
            .map_err(|e| Error::api_update(export.key(), e.to_string()))?;
        self.store_export(&stored);
        Ok(stored)
    }

    /// Content-side twin of [`Self::check_and_set_invalid_export_label`].
    async fn check_and_set_invalid_content_label(
        &self,
        content: NfsExportContent,
    ) -> Result<NfsExportContent, Error> {
        let has_label = content
            .metadata
            .labels
            .as_ref()
            .map(|l| l.contains_key(keys::LABEL_INVALID_CONTENT))
            .unwrap_or(false);
        let invalid = validation::validate_content(&content).is_err();

        if has_label == invalid {
            return Ok(content);
        }

        let mut updated = content.clone();
        let labels = updated.metadata.labels.get_or_insert_with(Default::default);
        if invalid {
            labels.insert(keys::LABEL_INVALID_CONTENT.to_string(), String::new());
        } else {
            labels.remove(keys::LABEL_INVALID_CONTENT);
        }
        let stored = self
            .api
            .update_content(&updated)
            .await
            .map_err(|e| Error::api_update(content.name_any(), e.to_string()))?;
        self.store_content(&stored);
        Ok(stored)
    }

    /// Record a status error on the export and emit a warning event. The
    /// event fires even when the write fails; identical messages are not
    /// re-written.
    async fn update_export_error_status_with_event(
        &self,
        export: &NfsExport,
        set_ready_to_false: bool,
        reason: &str,
        message: &str,
    ) -> Result<(), Error> {
        let existing = export
            .status
            .as_ref()
            .and_then(|s| s.error.as_ref())
            .and_then(|e| e.message.as_deref());
        if existing == Some(message) {
            debug!(export = %export.key(), "same error already recorded");
            return Ok(());
        }

        let mut status = json!({
            "error": {
                "time": Utc::now().to_rfc3339(),
                "message": message,
            },
        });
        if set_ready_to_false {
            status["readyToUse"] = json!(false);
        }

        let namespace = export.namespace().unwrap_or_default();
        let result = self
            .api
            .patch_export_status(&namespace, &export.name_any(), status)
            .await;

        self.emit(
            &export_object_ref(export),
            EventType::Warning,
            reason,
            message,
        )
        .await;

        match result {
            Ok(stored) => {
                self.store_export(&stored);
                Ok(())
            }
            Err(e) => {
                warn!(export = %export.key(), error = %e, "updating export error status failed");
                Err(e)
            }
        }
    }

    async fn emit(
        &self,
        object_ref: &k8s_openapi::api::core::v1::ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events
            .publish(object_ref, type_, reason, Some(message.to_string()))
            .await;
    }
}

// ----------------------------------------------------------------------
// Pure helpers
// ----------------------------------------------------------------------

/// Deterministic content name for a dynamic export.
fn content_name_for(export: &NfsExport) -> String {
    keys::content_name_for_export(export)
}

fn has_finalizer(export: &NfsExport, finalizer: &str) -> bool {
    export
        .metadata
        .finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|f| f == finalizer)
}

/// An export is a deletion candidate once it has a deletion timestamp and
/// still carries one of our finalizers.
pub fn is_export_deletion_candidate(export: &NfsExport) -> bool {
    export.metadata.deletion_timestamp.is_some()
        && (has_finalizer(export, keys::FINALIZER_EXPORT_AS_SOURCE)
            || has_finalizer(export, keys::FINALIZER_EXPORT_BOUND))
}

/// Whether the export status mirror lags behind the content status.
pub fn needs_update_export_status(export: &NfsExport, content: &NfsExportContent) -> bool {
    let Some(content_status) = content.status.as_ref() else {
        return false;
    };
    let Some(status) = export.status.as_ref() else {
        return true;
    };

    if status.bound_content_name.is_none() {
        return true;
    }
    if status.creation_time.is_none() && content_status.creation_time.is_some() {
        return true;
    }
    match (status.ready_to_use, content_status.ready_to_use) {
        (None, Some(_)) => return true,
        (Some(a), Some(b)) if a != b => return true,
        _ => {}
    }
    if status.restore_size.is_none() && content_status.restore_size.is_some() {
        return true;
    }
    if status.restore_size == Some(0)
        && content_status.restore_size.map(|s| s > 0).unwrap_or(false)
    {
        return true;
    }
    false
}

/// Whether a PV is (pre-)bound to the given claim.
fn is_volume_bound_to_claim(pv: &PersistentVolume, pvc: &PersistentVolumeClaim) -> bool {
    let Some(claim_ref) = pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref()) else {
        return false;
    };
    if claim_ref.name.as_deref() != pvc.metadata.name.as_deref()
        || claim_ref.namespace.as_deref() != pvc.metadata.namespace.as_deref()
    {
        return false;
    }
    match claim_ref.uid.as_deref() {
        Some(uid) if !uid.is_empty() => pvc.metadata.uid.as_deref() == Some(uid),
        _ => true,
    }
}

/// Reduced node-selector matcher for required volume node affinity: terms
/// are ORed; a term matches when all expressions and fields match.
fn node_matches_selector_terms(
    node: &Node,
    terms: &[k8s_openapi::api::core::v1::NodeSelectorTerm],
) -> bool {
    let empty = Default::default();
    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
    let node_name = node.metadata.name.as_deref().unwrap_or_default();

    terms.iter().any(|term| {
        let expressions_match = term
            .match_expressions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .all(|req| {
                let value = labels.get(&req.key);
                let values = req.values.as_deref().unwrap_or_default();
                match req.operator.as_str() {
                    "In" => value.map(|v| values.iter().any(|c| c == v)).unwrap_or(false),
                    "NotIn" => value.map(|v| !values.iter().any(|c| c == v)).unwrap_or(true),
                    "Exists" => value.is_some(),
                    "DoesNotExist" => value.is_none(),
                    _ => false,
                }
            });

        let fields_match = term
            .match_fields
            .as_deref()
            .unwrap_or_default()
            .iter()
            .all(|req| {
                let values = req.values.as_deref().unwrap_or_default();
                req.key == "metadata.name"
                    && match req.operator.as_str() {
                        "In" => values.iter().any(|c| c == node_name),
                        "NotIn" => !values.iter().any(|c| c == node_name),
                        _ => false,
                    }
            });

        expressions_match && fields_match
    })
}
