//! JSON-patch builders for annotation and finalizer mutations.
//!
//! All metadata mutations issued by the reconcilers go through JSON patches
//! against an explicit base object, so a concurrent writer makes the patch
//! fail visibly instead of silently clobbering state. Finalizers need one
//! quirk: appending with `/metadata/finalizers/-` against a missing array is a
//! server-side error, so the first finalizer is installed by replacing the
//! whole (absent) array.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;

use crate::error::Error;

/// A JSON patch document, ready for `kube::api::Patch::Json`.
pub type JsonPatch = json_patch::Patch;

fn to_patch(value: serde_json::Value) -> Result<JsonPatch, Error> {
    serde_json::from_value(value)
        .map_err(|e| Error::internal("patch", format!("malformed patch document: {e}")))
}

/// Patch that adds a finalizer, handling the empty-array case.
pub fn add_finalizer(meta: &ObjectMeta, finalizer: &str) -> Result<JsonPatch, Error> {
    let existing = meta.finalizers.as_deref().unwrap_or_default();
    if existing.is_empty() {
        to_patch(json!([
            { "op": "add", "path": "/metadata/finalizers", "value": [finalizer] }
        ]))
    } else {
        to_patch(json!([
            { "op": "add", "path": "/metadata/finalizers/-", "value": finalizer }
        ]))
    }
}

/// Patch that adds several finalizers at once, handling the empty-array case.
/// Returns `None` when every requested finalizer is already present.
pub fn add_finalizers(meta: &ObjectMeta, finalizers: &[&str]) -> Result<Option<JsonPatch>, Error> {
    let existing = meta.finalizers.as_deref().unwrap_or_default();
    let missing: Vec<&str> = finalizers
        .iter()
        .copied()
        .filter(|f| !existing.iter().any(|e| e == f))
        .collect();
    if missing.is_empty() {
        return Ok(None);
    }
    if existing.is_empty() {
        return to_patch(json!([
            { "op": "add", "path": "/metadata/finalizers", "value": missing }
        ]))
        .map(Some);
    }
    let ops: Vec<serde_json::Value> = missing
        .iter()
        .map(|f| json!({ "op": "add", "path": "/metadata/finalizers/-", "value": f }))
        .collect();
    to_patch(serde_json::Value::Array(ops)).map(Some)
}

/// Patch that removes a finalizer by replacing the array without it.
/// Returns `None` when the finalizer is not present.
pub fn remove_finalizer(meta: &ObjectMeta, finalizer: &str) -> Result<Option<JsonPatch>, Error> {
    let existing = meta.finalizers.as_deref().unwrap_or_default();
    if !existing.iter().any(|f| f == finalizer) {
        return Ok(None);
    }
    let remaining: Vec<&String> = existing.iter().filter(|f| *f != finalizer).collect();
    to_patch(json!([
        { "op": "replace", "path": "/metadata/finalizers", "value": remaining }
    ]))
    .map(Some)
}

/// Patch that sets (or overwrites) one annotation, replacing the whole map so
/// the patch also works when the object had no annotations.
pub fn set_annotation(meta: &ObjectMeta, key: &str, value: &str) -> Result<JsonPatch, Error> {
    let mut annotations: BTreeMap<String, String> =
        meta.annotations.clone().unwrap_or_default();
    annotations.insert(key.to_string(), value.to_string());
    to_patch(json!([
        { "op": "add", "path": "/metadata/annotations", "value": annotations }
    ]))
}

/// Patch that removes one annotation by replacing the map without it.
/// Returns `None` when the annotation is not present.
pub fn remove_annotation(meta: &ObjectMeta, key: &str) -> Result<Option<JsonPatch>, Error> {
    let Some(mut annotations) = meta.annotations.clone() else {
        return Ok(None);
    };
    if annotations.remove(key).is_none() {
        return Ok(None);
    }
    to_patch(json!([
        { "op": "replace", "path": "/metadata/annotations", "value": annotations }
    ]))
    .map(Some)
}

/// Patch that binds a pre-provisioned content to an export: installs the
/// export UID and, when the export names a class, the class name.
pub fn bind_content(uid: &str, class_name: Option<&str>) -> Result<JsonPatch, Error> {
    let mut ops = vec![json!(
        { "op": "add", "path": "/spec/exportRef/uid", "value": uid }
    )];
    if let Some(class) = class_name {
        ops.push(json!(
            { "op": "add", "path": "/spec/className", "value": class }
        ));
    }
    to_patch(serde_json::Value::Array(ops))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with(
        finalizers: Option<Vec<&str>>,
        annotations: Option<Vec<(&str, &str)>>,
    ) -> ObjectMeta {
        ObjectMeta {
            finalizers: finalizers.map(|f| f.into_iter().map(String::from).collect()),
            annotations: annotations.map(|a| {
                a.into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            }),
            ..Default::default()
        }
    }

    fn apply(patch: &JsonPatch, doc: serde_json::Value) -> serde_json::Value {
        let mut doc = doc;
        json_patch::patch(&mut doc, patch).expect("patch applies");
        doc
    }

    #[test]
    fn first_finalizer_replaces_missing_array() {
        let patch = add_finalizer(&meta_with(None, None), "f1").unwrap();
        let doc = apply(&patch, json!({ "metadata": {} }));
        assert_eq!(doc["metadata"]["finalizers"], json!(["f1"]));
    }

    #[test]
    fn later_finalizers_append() {
        let patch = add_finalizer(&meta_with(Some(vec!["f1"]), None), "f2").unwrap();
        let doc = apply(&patch, json!({ "metadata": { "finalizers": ["f1"] } }));
        assert_eq!(doc["metadata"]["finalizers"], json!(["f1", "f2"]));
    }

    #[test]
    fn add_finalizers_batches_and_skips_present() {
        let meta = meta_with(Some(vec!["f1"]), None);
        let patch = add_finalizers(&meta, &["f1", "f2", "f3"]).unwrap().unwrap();
        let doc = apply(&patch, json!({ "metadata": { "finalizers": ["f1"] } }));
        assert_eq!(doc["metadata"]["finalizers"], json!(["f1", "f2", "f3"]));

        assert!(add_finalizers(&meta, &["f1"]).unwrap().is_none());

        let patch = add_finalizers(&meta_with(None, None), &["f1", "f2"])
            .unwrap()
            .unwrap();
        let doc = apply(&patch, json!({ "metadata": {} }));
        assert_eq!(doc["metadata"]["finalizers"], json!(["f1", "f2"]));
    }

    #[test]
    fn remove_finalizer_keeps_the_rest() {
        let meta = meta_with(Some(vec!["f1", "f2"]), None);
        let patch = remove_finalizer(&meta, "f1").unwrap().unwrap();
        let doc = apply(&patch, json!({ "metadata": { "finalizers": ["f1", "f2"] } }));
        assert_eq!(doc["metadata"]["finalizers"], json!(["f2"]));
    }

    #[test]
    fn remove_absent_finalizer_is_a_noop() {
        let meta = meta_with(Some(vec!["f1"]), None);
        assert!(remove_finalizer(&meta, "other").unwrap().is_none());
        assert!(remove_finalizer(&meta_with(None, None), "f1").unwrap().is_none());
    }

    #[test]
    fn set_annotation_merges_with_existing() {
        let meta = meta_with(None, Some(vec![("a", "1")]));
        let patch = set_annotation(&meta, "b", "2").unwrap();
        let doc = apply(&patch, json!({ "metadata": { "annotations": { "a": "1" } } }));
        assert_eq!(
            doc["metadata"]["annotations"],
            json!({ "a": "1", "b": "2" })
        );
    }

    #[test]
    fn set_annotation_works_without_existing_map() {
        let patch = set_annotation(&meta_with(None, None), "a", "1").unwrap();
        let doc = apply(&patch, json!({ "metadata": {} }));
        assert_eq!(doc["metadata"]["annotations"], json!({ "a": "1" }));
    }

    #[test]
    fn remove_annotation_drops_only_that_key() {
        let meta = meta_with(None, Some(vec![("a", "1"), ("b", "2")]));
        let patch = remove_annotation(&meta, "a").unwrap().unwrap();
        let doc = apply(
            &patch,
            json!({ "metadata": { "annotations": { "a": "1", "b": "2" } } }),
        );
        assert_eq!(doc["metadata"]["annotations"], json!({ "b": "2" }));
    }

    #[test]
    fn remove_absent_annotation_is_a_noop() {
        assert!(remove_annotation(&meta_with(None, None), "a").unwrap().is_none());
        let meta = meta_with(None, Some(vec![("b", "2")]));
        assert!(remove_annotation(&meta, "a").unwrap().is_none());
    }

    #[test]
    fn bind_content_sets_uid_and_optional_class() {
        let patch = bind_content("uid-1", Some("gold")).unwrap();
        let doc = apply(
            &patch,
            json!({ "spec": { "exportRef": { "name": "e1", "namespace": "ns" } } }),
        );
        assert_eq!(doc["spec"]["exportRef"]["uid"], json!("uid-1"));
        assert_eq!(doc["spec"]["className"], json!("gold"));

        let patch = bind_content("uid-1", None).unwrap();
        let doc = apply(
            &patch,
            json!({ "spec": { "exportRef": { "name": "e1", "namespace": "ns" } } }),
        );
        assert!(doc["spec"].get("className").is_none());
    }
}
