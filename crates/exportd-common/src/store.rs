//! Controller object cache with resource-version ordering.
//!
//! Reconcilers keep their own view of the objects they manage, updated both
//! from watch events and from API responses to their own writes. An update is
//! accepted only if its resourceVersion is equal to or newer than the cached
//! one; equal versions pass so periodic resyncs still reach the sync
//! functions, strictly older versions are dropped as stale views.

use std::collections::HashMap;

use kube::{Resource, ResourceExt};

use crate::error::Error;

/// Newer-resourceVersion-wins object cache keyed by `namespace/name` (or plain
/// name for cluster-scoped objects).
#[derive(Debug, Default)]
pub struct VersionedStore<T> {
    objects: HashMap<String, T>,
}

impl<T> VersionedStore<T>
where
    T: Resource<DynamicType = ()> + Clone,
{
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
        }
    }

    /// Cache key for an object.
    pub fn key_of(obj: &T) -> String {
        match obj.namespace() {
            Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name_any()),
            _ => obj.name_any(),
        }
    }

    /// Store a new object version. Returns `true` if the cache was updated,
    /// `false` if the object is strictly older than the cached version and
    /// should be ignored.
    pub fn update(&mut self, obj: &T) -> Result<bool, Error> {
        let key = Self::key_of(obj);
        let new_version = parse_version(obj)?;

        if let Some(existing) = self.objects.get(&key) {
            let old_version = parse_version(existing)?;
            // Throw away only older versions; let the same version pass so
            // periodic sync events are processed.
            if old_version > new_version {
                return Ok(false);
            }
        }
        self.objects.insert(key, obj.clone());
        Ok(true)
    }

    /// Look up an object by key.
    pub fn get(&self, key: &str) -> Option<T> {
        self.objects.get(key).cloned()
    }

    /// Remove an object by key (delete event processed).
    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.objects.remove(key)
    }

    /// All cached keys, for resync enqueueing.
    pub fn keys(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

fn parse_version<T: Resource<DynamicType = ()>>(obj: &T) -> Result<u64, Error> {
    let raw = obj.resource_version().unwrap_or_default();
    raw.parse::<u64>().map_err(|e| {
        Error::internal(
            "store",
            format!("error parsing resourceVersion {raw:?}: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ContentSource, DeletionPolicy, ExportRef, NfsExportContent, NfsExportContentSpec};

    fn content(name: &str, rv: &str) -> NfsExportContent {
        let mut c = NfsExportContent::new(
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
        );
        c.metadata.resource_version = Some(rv.into());
        c
    }

    #[test]
    fn first_version_is_stored() {
        let mut store = VersionedStore::new();
        assert!(store.update(&content("c1", "5")).unwrap());
        assert!(store.get("c1").is_some());
    }

    #[test]
    fn newer_version_replaces_older() {
        let mut store = VersionedStore::new();
        store.update(&content("c1", "5")).unwrap();
        assert!(store.update(&content("c1", "7")).unwrap());
        assert_eq!(store.get("c1").unwrap().resource_version().unwrap(), "7");
    }

    #[test]
    fn equal_version_passes_for_periodic_resync() {
        let mut store = VersionedStore::new();
        store.update(&content("c1", "5")).unwrap();
        assert!(store.update(&content("c1", "5")).unwrap());
    }

    #[test]
    fn strictly_older_version_is_rejected() {
        let mut store = VersionedStore::new();
        store.update(&content("c1", "7")).unwrap();
        assert!(!store.update(&content("c1", "5")).unwrap());
        assert_eq!(store.get("c1").unwrap().resource_version().unwrap(), "7");
    }

    #[test]
    fn versions_compare_numerically_not_lexically() {
        let mut store = VersionedStore::new();
        store.update(&content("c1", "9")).unwrap();
        // "10" < "9" lexically; must still be accepted.
        assert!(store.update(&content("c1", "10")).unwrap());
    }

    #[test]
    fn unparseable_version_is_an_error() {
        let mut store = VersionedStore::new();
        assert!(store.update(&content("c1", "not-a-number")).is_err());
    }

    #[test]
    fn remove_drops_the_entry() {
        let mut store = VersionedStore::new();
        store.update(&content("c1", "5")).unwrap();
        assert!(store.remove("c1").is_some());
        assert!(store.get("c1").is_none());
        assert!(store.is_empty());
    }
}
