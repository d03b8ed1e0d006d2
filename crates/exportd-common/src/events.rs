//! Kubernetes Event recording for the exportd controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that reconcilers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ExportCreated")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "exportd-sidecar nfs.example.com").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column and are part
/// of the user-visible contract; treat them as append-only.
pub mod reasons {
    // Export lifecycle (common controller)
    /// A content has been created, the driver has been asked to cut an export
    pub const CREATING_EXPORT: &str = "CreatingExport";
    /// The driver reported the export as cut
    pub const EXPORT_CREATED: &str = "ExportCreated";
    /// The export became ready to use
    pub const EXPORT_READY: &str = "ExportReady";
    /// Source exclusivity or another spec rule failed on the export
    pub const EXPORT_VALIDATION_ERROR: &str = "ExportValidationError";
    /// Default class resolution failed (zero or multiple candidates)
    pub const SET_DEFAULT_CLASS_FAILED: &str = "SetDefaultClassFailed";
    /// Finalizer bookkeeping on the export failed
    pub const EXPORT_FINALIZER_ERROR: &str = "ExportFinalizerError";
    /// PVC finalizer bookkeeping failed
    pub const PVC_FINALIZER_ERROR: &str = "ErrorPVCFinalizer";
    /// The bound content is missing from the cluster
    pub const CONTENT_MISSING: &str = "ContentMissing";
    /// The content does not point back at the export
    pub const CONTENT_MISBOUND: &str = "ExportContentMisbound";
    /// The content's provisioning shape does not match the request
    pub const CONTENT_MISMATCH: &str = "ExportContentMismatch";
    /// A pre-provisioned content carried an export handle for a dynamic request
    pub const EXPORT_HANDLE_SET: &str = "ExportHandleSet";
    /// Binding a pre-provisioned content failed
    pub const EXPORT_BIND_FAILED: &str = "ExportBindFailed";
    /// The PVC source named by a dynamic export is missing
    pub const EXPORT_PVC_SOURCE_MISSING: &str = "ExportPVCSourceMissing";
    /// Creating the content object failed
    pub const CONTENT_CREATION_FAILED: &str = "ContentCreationFailed";
    /// Writing the export status failed
    pub const EXPORT_STATUS_UPDATE_FAILED: &str = "ExportStatusUpdateFailed";
    /// Deletion is waiting for a pending PVC restore
    pub const EXPORT_DELETE_PENDING: &str = "ExportDeletePending";
    /// Deleting the content API object failed
    pub const CONTENT_OBJECT_DELETE_ERROR: &str = "ContentObjectDeleteError";

    // Content lifecycle (sidecar)
    /// The driver CreateExport call failed
    pub const EXPORT_CREATION_FAILED: &str = "ExportCreationFailed";
    /// Checking or updating content status failed
    pub const CONTENT_CHECK_FAILED: &str = "ContentCheckAndUpdateFailed";
    /// The driver DeleteExport call (or its preparation) failed
    pub const EXPORT_DELETE_ERROR: &str = "ExportDeleteError";
    /// Source exclusivity failed on the content
    pub const CONTENT_VALIDATION_ERROR: &str = "ContentValidationError";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::EXPORT_CREATION_FAILED, "ExportCreationFailed");
        assert_eq!(reasons::CONTENT_MISSING, "ContentMissing");
        assert_eq!(reasons::CONTENT_MISBOUND, "ExportContentMisbound");
        assert_eq!(reasons::CONTENT_CHECK_FAILED, "ContentCheckAndUpdateFailed");
        assert_eq!(reasons::SET_DEFAULT_CLASS_FAILED, "SetDefaultClassFailed");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::EXPORT_READY,
                Some("test".to_string()),
            )
            .await;
    }
}
