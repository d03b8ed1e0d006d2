//! Validating admission webhook for the three exportd resource kinds.
//!
//! One POST route per resource. Only CREATE and UPDATE are inspected; every
//! other operation is allowed through. The decision logic itself lives in
//! `exportd_common::validation` so the common controller can run the same
//! rules in read-only mode for the invalid-resource labels.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use kube::api::{Api, ListParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::Client;
use tracing::{debug, warn};

use exportd_common::crd::{NfsExport, NfsExportClass, NfsExportContent};
use exportd_common::validation;

/// Shared state for the webhook handlers.
#[derive(Clone)]
pub struct WebhookState {
    /// Client for listing classes during default-uniqueness checks.
    pub client: Client,
    /// Enforce sourceVolumeMode immutability on contents.
    pub prevent_volume_mode_conversion: bool,
}

impl WebhookState {
    /// Create a new webhook state.
    pub fn new(client: Client, prevent_volume_mode_conversion: bool) -> Self {
        Self {
            client,
            prevent_volume_mode_conversion,
        }
    }
}

/// Router with all validation endpoints.
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate/nfsexports", post(validate_exports))
        .route("/validate/nfsexportcontents", post(validate_contents))
        .route("/validate/nfsexportclasses", post(validate_classes))
        .with_state(state)
}

async fn validate_exports(
    Json(review): Json<AdmissionReview<NfsExport>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(decide_export_review(review).into_review())
}

async fn validate_contents(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<NfsExportContent>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(decide_content_review(review, state.prevent_volume_mode_conversion).into_review())
}

async fn validate_classes(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<NfsExportClass>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let classes: Api<NfsExportClass> = Api::all(state.client.clone());
    let existing = match classes.list(&ListParams::default()).await {
        Ok(list) => list.items,
        Err(e) => {
            warn!(error = %e, "failed to list export classes");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(decide_class_review(review, &existing).into_review())
}

fn request_of<T: kube::Resource + serde::de::DeserializeOwned>(
    review: AdmissionReview<T>,
) -> Result<AdmissionRequest<T>, AdmissionResponse> {
    review
        .try_into()
        .map_err(|e: kube::core::admission::ConvertAdmissionReviewError| {
            AdmissionResponse::invalid(e.to_string())
        })
}

fn inspected(operation: &Operation) -> bool {
    matches!(operation, Operation::Create | Operation::Update)
}

/// Decision for an NfsExport review.
pub fn decide_export_review(review: AdmissionReview<NfsExport>) -> AdmissionResponse {
    let request = match request_of(review) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let response = AdmissionResponse::from(&request);
    if !inspected(&request.operation) {
        return response;
    }
    debug!(name = %request.name, operation = ?request.operation, "admitting NfsExport");

    let Some(export) = request.object.as_ref() else {
        return response.deny("NfsExport is missing from the request");
    };
    let is_update = matches!(request.operation, Operation::Update);
    match validation::decide_export(export, request.old_object.as_ref(), is_update) {
        Ok(()) => response,
        Err(message) => response.deny(message),
    }
}

/// Decision for an NfsExportContent review.
pub fn decide_content_review(
    review: AdmissionReview<NfsExportContent>,
    prevent_volume_mode_conversion: bool,
) -> AdmissionResponse {
    let request = match request_of(review) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let response = AdmissionResponse::from(&request);
    if !inspected(&request.operation) {
        return response;
    }
    debug!(name = %request.name, operation = ?request.operation, "admitting NfsExportContent");

    let Some(content) = request.object.as_ref() else {
        return response.deny("NfsExportContent is missing from the request");
    };
    let is_update = matches!(request.operation, Operation::Update);
    match validation::decide_content(
        content,
        request.old_object.as_ref(),
        is_update,
        prevent_volume_mode_conversion,
    ) {
        Ok(()) => response,
        Err(message) => response.deny(message),
    }
}

/// Decision for an NfsExportClass review against the existing classes.
pub fn decide_class_review(
    review: AdmissionReview<NfsExportClass>,
    existing: &[NfsExportClass],
) -> AdmissionResponse {
    let request = match request_of(review) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let response = AdmissionResponse::from(&request);
    if !inspected(&request.operation) {
        return response;
    }
    debug!(name = %request.name, operation = ?request.operation, "admitting NfsExportClass");

    let Some(class) = request.object.as_ref() else {
        return response.deny("NfsExportClass is missing from the request");
    };
    match validation::decide_class(class, request.old_object.as_ref(), existing) {
        Ok(()) => response,
        Err(message) => response.deny(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review_json(
        kind: &str,
        resource: &str,
        operation: &str,
        object: serde_json::Value,
        old_object: serde_json::Value,
    ) -> serde_json::Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "7a25dbc5-5e6b-4a8f-b1e5-0e9f0a1d9c11",
                "kind": {"group": "nfsexport.exportd.io", "version": "v1", "kind": kind},
                "resource": {"group": "nfsexport.exportd.io", "version": "v1", "resource": resource},
                "requestKind": {"group": "nfsexport.exportd.io", "version": "v1", "kind": kind},
                "requestResource": {"group": "nfsexport.exportd.io", "version": "v1", "resource": resource},
                "name": "test",
                "operation": operation,
                "userInfo": {},
                "object": object,
                "oldObject": old_object,
            }
        })
    }

    fn export_json(claim: &str, class: Option<&str>) -> serde_json::Value {
        let mut spec = json!({ "source": { "sourceClaim": claim } });
        if let Some(class) = class {
            spec["className"] = json!(class);
        }
        json!({
            "apiVersion": "nfsexport.exportd.io/v1",
            "kind": "NfsExport",
            "metadata": {"name": "test", "namespace": "ns"},
            "spec": spec,
        })
    }

    fn content_json(volume_handle: &str, mode: Option<&str>) -> serde_json::Value {
        let mut spec = json!({
            "exportRef": {"name": "e1", "namespace": "ns"},
            "deletionPolicy": "Delete",
            "driver": "nfs.example.com",
            "source": {"volumeHandle": volume_handle},
        });
        if let Some(mode) = mode {
            spec["sourceVolumeMode"] = json!(mode);
        }
        json!({
            "apiVersion": "nfsexport.exportd.io/v1",
            "kind": "NfsExportContent",
            "metadata": {"name": "test"},
            "spec": spec,
        })
    }

    fn class_json(name: &str, driver: &str, default: bool) -> serde_json::Value {
        let annotations = if default {
            json!({"nfsexport.exportd.io/is-default-class": "true"})
        } else {
            json!({})
        };
        json!({
            "apiVersion": "nfsexport.exportd.io/v1",
            "kind": "NfsExportClass",
            "metadata": {"name": name, "annotations": annotations},
            "spec": {"driver": driver, "deletionPolicy": "Delete"},
        })
    }

    #[test]
    fn create_with_valid_export_is_allowed() {
        let review: AdmissionReview<NfsExport> = serde_json::from_value(review_json(
            "NfsExport",
            "nfsexports",
            "CREATE",
            export_json("pvc-1", Some("gold")),
            serde_json::Value::Null,
        ))
        .unwrap();
        assert!(decide_export_review(review).allowed);
    }

    #[test]
    fn empty_class_name_is_denied() {
        let review: AdmissionReview<NfsExport> = serde_json::from_value(review_json(
            "NfsExport",
            "nfsexports",
            "CREATE",
            export_json("pvc-1", Some("")),
            serde_json::Value::Null,
        ))
        .unwrap();
        let response = decide_export_review(review);
        assert!(!response.allowed);
        assert!(response
            .result
            .message
            .contains("must not be the empty string"));
    }

    #[test]
    fn export_source_mutation_is_denied() {
        let review: AdmissionReview<NfsExport> = serde_json::from_value(review_json(
            "NfsExport",
            "nfsexports",
            "UPDATE",
            export_json("pvc-2", None),
            export_json("pvc-1", None),
        ))
        .unwrap();
        let response = decide_export_review(review);
        assert!(!response.allowed);
        assert!(response.result.message.contains("immutable"));
    }

    #[test]
    fn content_volume_handle_mutation_is_denied() {
        let review: AdmissionReview<NfsExportContent> = serde_json::from_value(review_json(
            "NfsExportContent",
            "nfsexportcontents",
            "UPDATE",
            content_json("vol-2", None),
            content_json("vol-1", None),
        ))
        .unwrap();
        let response = decide_content_review(review, false);
        assert!(!response.allowed);
        assert!(response.result.message.contains("volumeHandle is immutable"));
    }

    #[test]
    fn volume_mode_mutation_is_denied_only_behind_flag() {
        let build = || {
            serde_json::from_value::<AdmissionReview<NfsExportContent>>(review_json(
                "NfsExportContent",
                "nfsexportcontents",
                "UPDATE",
                content_json("vol-1", Some("Block")),
                content_json("vol-1", Some("Filesystem")),
            ))
            .unwrap()
        };
        assert!(decide_content_review(build(), false).allowed);
        let denied = decide_content_review(build(), true);
        assert!(!denied.allowed);
        assert!(denied.result.message.contains("sourceVolumeMode is immutable"));
    }

    #[test]
    fn second_default_class_is_denied() {
        let existing: NfsExportClass =
            serde_json::from_value(class_json("gold", "nfs.example.com", true)).unwrap();
        let review: AdmissionReview<NfsExportClass> = serde_json::from_value(review_json(
            "NfsExportClass",
            "nfsexportclasses",
            "CREATE",
            class_json("gold2", "nfs.example.com", true),
            serde_json::Value::Null,
        ))
        .unwrap();
        let response = decide_class_review(review, &[existing]);
        assert!(!response.allowed);
        assert!(response.result.message.contains("already exists for driver"));
    }

    #[test]
    fn same_driver_default_noop_update_is_allowed() {
        let existing: NfsExportClass =
            serde_json::from_value(class_json("gold", "nfs.example.com", true)).unwrap();
        let review: AdmissionReview<NfsExportClass> = serde_json::from_value(review_json(
            "NfsExportClass",
            "nfsexportclasses",
            "UPDATE",
            class_json("gold", "nfs.example.com", true),
            class_json("gold", "nfs.example.com", true),
        ))
        .unwrap();
        assert!(decide_class_review(review, &[existing]).allowed);
    }

    #[test]
    fn delete_operations_are_not_inspected() {
        let review: AdmissionReview<NfsExport> = serde_json::from_value(review_json(
            "NfsExport",
            "nfsexports",
            "DELETE",
            serde_json::Value::Null,
            export_json("pvc-1", None),
        ))
        .unwrap();
        assert!(decide_export_review(review).allowed);
    }
}
