//! In-memory [`ClusterApi`] for reconciler tests.
//!
//! Mimics the orchestrator closely enough for scenario tests: monotonically
//! increasing resource versions on every write, JSON-patch application,
//! AlreadyExists on duplicate create, and finalizer-aware deletion (an object
//! with finalizers gets a deletionTimestamp and is only removed once the last
//! finalizer is cleared). Errors can be injected per operation to simulate
//! orchestrator failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, PersistentVolume, PersistentVolumeClaim, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::ClusterApi;
use crate::crd::{NfsExport, NfsExportClass, NfsExportContent};
use crate::error::Error;
use crate::patch::JsonPatch;

#[derive(Default)]
struct FakeState {
    contents: BTreeMap<String, NfsExportContent>,
    exports: BTreeMap<String, NfsExport>,
    classes: BTreeMap<String, NfsExportClass>,
    pvcs: BTreeMap<String, PersistentVolumeClaim>,
    pvs: BTreeMap<String, PersistentVolume>,
    secrets: BTreeMap<String, Secret>,
    nodes: Vec<Node>,
    removed_contents: Vec<String>,
    errors: HashMap<&'static str, String>,
    resource_version: u64,
}

/// In-memory cluster for tests.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

fn namespaced_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn already_exists(kind: &str, name: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: format!("{kind} {name:?} already exists"),
            reason: "AlreadyExists".into(),
            code: 409,
        }),
    }
}

impl FakeCluster {
    /// Create an empty fake cluster.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn fail(&self, op: &'static str) -> Result<(), Error> {
        if let Some(message) = self.lock().errors.get(op) {
            return Err(Error::internal(op, message.clone()));
        }
        Ok(())
    }

    fn next_version(state: &mut FakeState) -> String {
        state.resource_version += 1;
        state.resource_version.to_string()
    }

    /// Make the named operation fail with the given message.
    pub fn inject_error(&self, op: &'static str, message: &str) {
        self.lock().errors.insert(op, message.to_string());
    }

    /// Seed a content object.
    pub fn add_content(&self, mut content: NfsExportContent) {
        let mut state = self.lock();
        content.metadata.resource_version = Some(Self::next_version(&mut state));
        state.contents.insert(content.name_any(), content);
    }

    /// Seed an export object.
    pub fn add_export(&self, mut export: NfsExport) {
        let mut state = self.lock();
        export.metadata.resource_version = Some(Self::next_version(&mut state));
        let key = namespaced_key(&export.namespace().unwrap_or_default(), &export.name_any());
        state.exports.insert(key, export);
    }

    /// Seed a class object.
    pub fn add_class(&self, mut class: NfsExportClass) {
        let mut state = self.lock();
        class.metadata.resource_version = Some(Self::next_version(&mut state));
        state.classes.insert(class.name_any(), class);
    }

    /// Seed a PVC.
    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        let key = namespaced_key(&pvc.namespace().unwrap_or_default(), &pvc.name_any());
        self.lock().pvcs.insert(key, pvc);
    }

    /// Seed a PV.
    pub fn add_pv(&self, pv: PersistentVolume) {
        self.lock().pvs.insert(pv.name_any(), pv);
    }

    /// Seed a secret.
    pub fn add_secret(&self, secret: Secret) {
        let key = namespaced_key(&secret.namespace().unwrap_or_default(), &secret.name_any());
        self.lock().secrets.insert(key, secret);
    }

    /// Seed a node.
    pub fn add_node(&self, node: Node) {
        self.lock().nodes.push(node);
    }

    /// Current view of a content, for assertions.
    pub fn content(&self, name: &str) -> Option<NfsExportContent> {
        self.lock().contents.get(name).cloned()
    }

    /// Current view of an export, for assertions.
    pub fn export(&self, namespace: &str, name: &str) -> Option<NfsExport> {
        self.lock().exports.get(&namespaced_key(namespace, name)).cloned()
    }

    /// Current view of a PVC, for assertions.
    pub fn pvc(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.lock().pvcs.get(&namespaced_key(namespace, name)).cloned()
    }

    /// Names of contents that have been fully removed from the store.
    pub fn removed_contents(&self) -> Vec<String> {
        self.lock().removed_contents.clone()
    }

    fn apply_patch<T>(obj: &T, patch: &JsonPatch) -> Result<T, Error>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut doc = serde_json::to_value(obj)
            .map_err(|e| Error::internal("fake", format!("serialize: {e}")))?;
        json_patch::patch(&mut doc, patch)
            .map_err(|e| Error::internal("fake", format!("patch: {e}")))?;
        serde_json::from_value(doc).map_err(|e| Error::internal("fake", format!("deserialize: {e}")))
    }

    /// Remove a content whose deletion was requested once its finalizers are
    /// gone. Mirrors the API server's finalizer handling.
    fn reap_content(state: &mut FakeState, name: &str) {
        let remove = state
            .contents
            .get(name)
            .map(|c| {
                c.metadata.deletion_timestamp.is_some()
                    && c.metadata.finalizers.as_deref().unwrap_or_default().is_empty()
            })
            .unwrap_or(false);
        if remove {
            state.contents.remove(name);
            state.removed_contents.push(name.to_string());
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_content(&self, name: &str) -> Result<Option<NfsExportContent>, Error> {
        self.fail("get_content")?;
        Ok(self.lock().contents.get(name).cloned())
    }

    async fn create_content(
        &self,
        content: &NfsExportContent,
    ) -> Result<NfsExportContent, Error> {
        self.fail("create_content")?;
        let mut state = self.lock();
        let name = content.name_any();
        if state.contents.contains_key(&name) {
            return Err(already_exists("NfsExportContent", &name));
        }
        let mut stored = content.clone();
        stored.metadata.resource_version = Some(Self::next_version(&mut state));
        state.contents.insert(name, stored.clone());
        Ok(stored)
    }

    async fn delete_content(&self, name: &str) -> Result<(), Error> {
        self.fail("delete_content")?;
        let mut state = self.lock();
        if !state.contents.contains_key(name) {
            return Ok(());
        }
        let version = Self::next_version(&mut state);
        if let Some(content) = state.contents.get_mut(name) {
            if content.metadata.deletion_timestamp.is_none() {
                content.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            }
            content.metadata.resource_version = Some(version);
        }
        Self::reap_content(&mut state, name);
        Ok(())
    }

    async fn patch_content(
        &self,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<NfsExportContent, Error> {
        self.fail("patch_content")?;
        let mut state = self.lock();
        let Some(existing) = state.contents.get(name).cloned() else {
            return Err(Error::internal("fake", format!("content {name} not found")));
        };
        let mut patched: NfsExportContent = Self::apply_patch(&existing, patch)?;
        patched.metadata.resource_version = Some(Self::next_version(&mut state));
        state.contents.insert(name.to_string(), patched.clone());
        Self::reap_content(&mut state, name);
        Ok(patched)
    }

    async fn patch_content_status(
        &self,
        name: &str,
        status: serde_json::Value,
    ) -> Result<NfsExportContent, Error> {
        self.fail("patch_content_status")?;
        let mut state = self.lock();
        let Some(existing) = state.contents.get(name).cloned() else {
            return Err(Error::internal("fake", format!("content {name} not found")));
        };
        let mut doc = serde_json::to_value(&existing)
            .map_err(|e| Error::internal("fake", format!("serialize: {e}")))?;
        merge_patch(&mut doc["status"], &status);
        let mut merged: NfsExportContent = serde_json::from_value(doc)
            .map_err(|e| Error::internal("fake", format!("deserialize: {e}")))?;
        merged.metadata.resource_version = Some(Self::next_version(&mut state));
        state.contents.insert(name.to_string(), merged.clone());
        Ok(merged)
    }

    async fn update_content(
        &self,
        content: &NfsExportContent,
    ) -> Result<NfsExportContent, Error> {
        self.fail("update_content")?;
        let mut state = self.lock();
        let name = content.name_any();
        let mut stored = content.clone();
        stored.metadata.resource_version = Some(Self::next_version(&mut state));
        state.contents.insert(name.clone(), stored.clone());
        Self::reap_content(&mut state, &name);
        Ok(stored)
    }

    async fn get_export(&self, namespace: &str, name: &str) -> Result<Option<NfsExport>, Error> {
        self.fail("get_export")?;
        Ok(self.lock().exports.get(&namespaced_key(namespace, name)).cloned())
    }

    async fn list_exports(&self, namespace: &str) -> Result<Vec<NfsExport>, Error> {
        self.fail("list_exports")?;
        let prefix = format!("{namespace}/");
        Ok(self
            .lock()
            .exports
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn patch_export(
        &self,
        namespace: &str,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<NfsExport, Error> {
        self.fail("patch_export")?;
        let mut state = self.lock();
        let key = namespaced_key(namespace, name);
        let Some(existing) = state.exports.get(&key).cloned() else {
            return Err(Error::internal("fake", format!("export {key} not found")));
        };
        let mut patched: NfsExport = Self::apply_patch(&existing, patch)?;
        patched.metadata.resource_version = Some(Self::next_version(&mut state));
        state.exports.insert(key, patched.clone());
        Ok(patched)
    }

    async fn update_export(&self, export: &NfsExport) -> Result<NfsExport, Error> {
        self.fail("update_export")?;
        let mut state = self.lock();
        let key = namespaced_key(&export.namespace().unwrap_or_default(), &export.name_any());
        let mut stored = export.clone();
        stored.metadata.resource_version = Some(Self::next_version(&mut state));
        // Finalizer-aware removal, like the API server.
        if stored.metadata.deletion_timestamp.is_some()
            && stored.metadata.finalizers.as_deref().unwrap_or_default().is_empty()
        {
            state.exports.remove(&key);
        } else {
            state.exports.insert(key, stored.clone());
        }
        Ok(stored)
    }

    async fn patch_export_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<NfsExport, Error> {
        self.fail("patch_export_status")?;
        let mut state = self.lock();
        let key = namespaced_key(namespace, name);
        let Some(existing) = state.exports.get(&key).cloned() else {
            return Err(Error::internal("fake", format!("export {key} not found")));
        };
        let mut doc = serde_json::to_value(&existing)
            .map_err(|e| Error::internal("fake", format!("serialize: {e}")))?;
        merge_patch(&mut doc["status"], &status);
        let mut merged: NfsExport = serde_json::from_value(doc)
            .map_err(|e| Error::internal("fake", format!("deserialize: {e}")))?;
        merged.metadata.resource_version = Some(Self::next_version(&mut state));
        state.exports.insert(key, merged.clone());
        Ok(merged)
    }

    async fn get_class(&self, name: &str) -> Result<Option<NfsExportClass>, Error> {
        self.fail("get_class")?;
        Ok(self.lock().classes.get(name).cloned())
    }

    async fn list_classes(&self) -> Result<Vec<NfsExportClass>, Error> {
        self.fail("list_classes")?;
        Ok(self.lock().classes.values().cloned().collect())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        self.fail("get_pvc")?;
        Ok(self.lock().pvcs.get(&namespaced_key(namespace, name)).cloned())
    }

    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>, Error> {
        self.fail("list_pvcs")?;
        let prefix = format!("{namespace}/");
        Ok(self
            .lock()
            .pvcs
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn update_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        self.fail("update_pvc")?;
        let key = namespaced_key(&pvc.namespace().unwrap_or_default(), &pvc.name_any());
        self.lock().pvcs.insert(key, pvc.clone());
        Ok(pvc.clone())
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>, Error> {
        self.fail("get_pv")?;
        Ok(self.lock().pvs.get(name).cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        self.fail("get_secret")?;
        Ok(self.lock().secrets.get(&namespaced_key(namespace, name)).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        self.fail("list_nodes")?;
        Ok(self.lock().nodes.clone())
    }
}

/// RFC 7386 merge patch for the status subresource.
fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(entries) => {
            if !target.is_object() {
                *target = serde_json::json!({});
            }
            let map = target.as_object_mut().expect("just ensured object");
            for (key, value) in entries {
                if value.is_null() {
                    map.remove(key);
                } else {
                    merge_patch(map.entry(key.clone()).or_insert(serde_json::Value::Null), value);
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ContentSource, DeletionPolicy, ExportRef, NfsExportContentSpec};
    use crate::keys;
    use crate::patch;

    fn content(name: &str) -> NfsExportContent {
        NfsExportContent::new(
            name,
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
        )
    }

    #[tokio::test]
    async fn create_bumps_resource_version_and_rejects_duplicates() {
        let cluster = FakeCluster::new();
        let created = cluster.create_content(&content("c1")).await.unwrap();
        assert!(created.resource_version().is_some());

        let err = cluster.create_content(&content("c1")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn delete_respects_finalizers() {
        let cluster = FakeCluster::new();
        let mut c = content("c1");
        c.metadata.finalizers = Some(vec![keys::FINALIZER_CONTENT_BOUND.into()]);
        cluster.add_content(c);

        cluster.delete_content("c1").await.unwrap();
        let pending = cluster.content("c1").expect("still present");
        assert!(pending.metadata.deletion_timestamp.is_some());
        assert!(cluster.removed_contents().is_empty());

        // Clearing the finalizer reaps the object.
        let p = patch::remove_finalizer(&pending.metadata, keys::FINALIZER_CONTENT_BOUND)
            .unwrap()
            .unwrap();
        cluster.patch_content("c1", &p).await.unwrap();
        assert!(cluster.content("c1").is_none());
        assert_eq!(cluster.removed_contents(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn status_merge_patch_clears_nulled_fields() {
        let cluster = FakeCluster::new();
        cluster.add_content(content("c1"));
        cluster
            .patch_content_status(
                "c1",
                serde_json::json!({ "exportHandle": "e1", "readyToUse": true }),
            )
            .await
            .unwrap();
        let stored = cluster.content("c1").unwrap();
        assert_eq!(
            stored.status.as_ref().unwrap().export_handle.as_deref(),
            Some("e1")
        );

        cluster
            .patch_content_status("c1", serde_json::json!({ "exportHandle": null }))
            .await
            .unwrap();
        let stored = cluster.content("c1").unwrap();
        assert!(stored.status.as_ref().unwrap().export_handle.is_none());
        assert_eq!(stored.status.as_ref().unwrap().ready_to_use, Some(true));
    }

    #[tokio::test]
    async fn injected_errors_surface() {
        let cluster = FakeCluster::new();
        cluster.inject_error("get_secret", "boom");
        let err = cluster.get_secret("ns", "s").await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
