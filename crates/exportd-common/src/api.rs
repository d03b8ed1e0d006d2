//! The slice of the orchestrator API the reconcilers depend on.
//!
//! Both reconcilers talk to the cluster exclusively through [`ClusterApi`], so
//! tests can drive full reconciliation scenarios against the in-memory
//! implementation in [`crate::testing`] the same way production runs against
//! [`KubeClusterApi`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, ObjectReference, PersistentVolume, PersistentVolumeClaim, Secret,
};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};

use crate::crd::{NfsExport, NfsExportClass, NfsExportContent};
use crate::error::Error;
use crate::patch::JsonPatch;

/// Field manager used for all writes issued by the controllers.
pub const FIELD_MANAGER: &str = "exportd";

/// Orchestrator operations used by the reconcilers.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    // NfsExportContent (cluster-scoped)

    /// Fetch a content by name; `None` when absent.
    async fn get_content(&self, name: &str) -> Result<Option<NfsExportContent>, Error>;
    /// Create a content object. AlreadyExists surfaces as an error the caller
    /// may treat as success (idempotent creation).
    async fn create_content(&self, content: &NfsExportContent)
        -> Result<NfsExportContent, Error>;
    /// Request deletion of a content object (finalizers still apply).
    async fn delete_content(&self, name: &str) -> Result<(), Error>;
    /// Apply a JSON patch to a content.
    async fn patch_content(
        &self,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<NfsExportContent, Error>;
    /// Merge-patch the status subresource of a content.
    async fn patch_content_status(
        &self,
        name: &str,
        status: serde_json::Value,
    ) -> Result<NfsExportContent, Error>;
    /// Replace a content object (label maintenance).
    async fn update_content(&self, content: &NfsExportContent)
        -> Result<NfsExportContent, Error>;

    // NfsExport (namespaced)

    /// Fetch an export; `None` when absent.
    async fn get_export(&self, namespace: &str, name: &str) -> Result<Option<NfsExport>, Error>;
    /// List the exports of a namespace.
    async fn list_exports(&self, namespace: &str) -> Result<Vec<NfsExport>, Error>;
    /// Apply a JSON patch to an export.
    async fn patch_export(
        &self,
        namespace: &str,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<NfsExport, Error>;
    /// Replace an export object (class default, finalizer removal, labels).
    async fn update_export(&self, export: &NfsExport) -> Result<NfsExport, Error>;
    /// Merge-patch the status subresource of an export.
    async fn patch_export_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<NfsExport, Error>;

    // NfsExportClass (cluster-scoped)

    /// Fetch a class; `None` when absent.
    async fn get_class(&self, name: &str) -> Result<Option<NfsExportClass>, Error>;
    /// List all classes.
    async fn list_classes(&self) -> Result<Vec<NfsExportClass>, Error>;

    // Core objects (read-only except PVC finalizers)

    /// Fetch a PVC; `None` when absent.
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;
    /// List the PVCs of a namespace.
    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>, Error>;
    /// Replace a PVC (finalizer add/remove only).
    async fn update_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error>;
    /// Fetch a PV; `None` when absent.
    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>, Error>;
    /// Fetch a secret; `None` when absent.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
    /// List cluster nodes (distributed export mode).
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;
}

/// Production implementation over a kube [`Client`].
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap a kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn contents(&self) -> Api<NfsExportContent> {
        Api::all(self.client.clone())
    }

    fn exports(&self, namespace: &str) -> Api<NfsExport> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn classes(&self) -> Api<NfsExportClass> {
        Api::all(self.client.clone())
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_content(&self, name: &str) -> Result<Option<NfsExportContent>, Error> {
        Ok(self.contents().get_opt(name).await?)
    }

    async fn create_content(
        &self,
        content: &NfsExportContent,
    ) -> Result<NfsExportContent, Error> {
        Ok(self
            .contents()
            .create(&PostParams::default(), content)
            .await?)
    }

    async fn delete_content(&self, name: &str) -> Result<(), Error> {
        self.contents()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn patch_content(
        &self,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<NfsExportContent, Error> {
        Ok(self
            .contents()
            .patch(name, &Self::patch_params(), &Patch::Json::<()>(patch.clone()))
            .await?)
    }

    async fn patch_content_status(
        &self,
        name: &str,
        status: serde_json::Value,
    ) -> Result<NfsExportContent, Error> {
        Ok(self
            .contents()
            .patch_status(
                name,
                &Self::patch_params(),
                &Patch::Merge(&serde_json::json!({ "status": status })),
            )
            .await?)
    }

    async fn update_content(
        &self,
        content: &NfsExportContent,
    ) -> Result<NfsExportContent, Error> {
        Ok(self
            .contents()
            .replace(&content.name_any(), &PostParams::default(), content)
            .await?)
    }

    async fn get_export(&self, namespace: &str, name: &str) -> Result<Option<NfsExport>, Error> {
        Ok(self.exports(namespace).get_opt(name).await?)
    }

    async fn list_exports(&self, namespace: &str) -> Result<Vec<NfsExport>, Error> {
        Ok(self
            .exports(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn patch_export(
        &self,
        namespace: &str,
        name: &str,
        patch: &JsonPatch,
    ) -> Result<NfsExport, Error> {
        Ok(self
            .exports(namespace)
            .patch(name, &Self::patch_params(), &Patch::Json::<()>(patch.clone()))
            .await?)
    }

    async fn update_export(&self, export: &NfsExport) -> Result<NfsExport, Error> {
        let namespace = export.namespace().unwrap_or_default();
        Ok(self
            .exports(&namespace)
            .replace(&export.name_any(), &PostParams::default(), export)
            .await?)
    }

    async fn patch_export_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<NfsExport, Error> {
        Ok(self
            .exports(namespace)
            .patch_status(
                name,
                &Self::patch_params(),
                &Patch::Merge(&serde_json::json!({ "status": status })),
            )
            .await?)
    }

    async fn get_class(&self, name: &str) -> Result<Option<NfsExportClass>, Error> {
        Ok(self.classes().get_opt(name).await?)
    }

    async fn list_classes(&self) -> Result<Vec<NfsExportClass>, Error> {
        Ok(self.classes().list(&ListParams::default()).await?.items)
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let namespace = pvc.namespace().unwrap_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api
            .replace(&pvc.name_any(), &PostParams::default(), pvc)
            .await?)
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>, Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Create a kube client from an optional kubeconfig path; in-cluster config
/// otherwise.
pub async fn create_client(kubeconfig: Option<&std::path::Path>) -> Result<Client, Error> {
    use kube::config::{KubeConfigOptions, Kubeconfig};

    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal("client", format!("failed to read kubeconfig: {e}"))
            })?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        Error::internal("client", format!("failed to load kubeconfig: {e}"))
                    })?;
            Client::try_from(config)
                .map_err(|e| Error::internal("client", format!("failed to create client: {e}")))
        }
        None => Client::try_default()
            .await
            .map_err(|e| Error::internal("client", format!("failed to create client: {e}"))),
    }
}

/// Fetch the credentials stored in the referenced secret as a string map.
///
/// `Ok(None)` when no reference is given; an error when the secret is missing
/// or unreadable.
pub async fn credentials(
    api: &dyn ClusterApi,
    secret_ref: Option<&crate::secret::SecretRef>,
) -> Result<Option<BTreeMap<String, String>>, Error> {
    let Some(secret_ref) = secret_ref else {
        return Ok(None);
    };
    let secret = api
        .get_secret(&secret_ref.namespace, &secret_ref.name)
        .await
        .map_err(|e| {
            Error::secrets(format!(
                "error getting secret {} in namespace {}: {e}",
                secret_ref.name, secret_ref.namespace
            ))
        })?
        .ok_or_else(|| {
            Error::secrets(format!(
                "error getting secret {} in namespace {}: not found",
                secret_ref.name, secret_ref.namespace
            ))
        })?;

    let mut creds = BTreeMap::new();
    if let Some(data) = secret.data {
        for (key, value) in data {
            let text = String::from_utf8(value.0).map_err(|_| {
                Error::secrets(format!(
                    "secret {}/{} key {key} holds non-UTF-8 data",
                    secret_ref.namespace, secret_ref.name
                ))
            })?;
            creds.insert(key, text);
        }
    }
    if let Some(string_data) = secret.string_data {
        for (key, value) in string_data {
            creds.insert(key, value);
        }
    }
    Ok(Some(creds))
}

/// Event anchor for an export.
pub fn export_object_ref(export: &NfsExport) -> ObjectReference {
    ObjectReference {
        api_version: Some("nfsexport.exportd.io/v1".into()),
        kind: Some("NfsExport".into()),
        name: export.metadata.name.clone(),
        namespace: export.metadata.namespace.clone(),
        uid: export.metadata.uid.clone(),
        ..Default::default()
    }
}

/// Event anchor for a content.
pub fn content_object_ref(content: &NfsExportContent) -> ObjectReference {
    ObjectReference {
        api_version: Some("nfsexport.exportd.io/v1".into()),
        kind: Some("NfsExportContent".into()),
        name: content.metadata.name.clone(),
        uid: content.metadata.uid.clone(),
        ..Default::default()
    }
}
