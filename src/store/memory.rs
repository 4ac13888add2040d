//! In-process resource store
//!
//! Behaves like a Kubernetes API server for the four operations the
//! handshake uses: names are unique, `generateName` gets a random suffix,
//! every write gets a fresh resource version, and an update carrying a
//! stale resource version is rejected with a conflict.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use rand::seq::SliceRandom;
use tracing::trace;

use super::{kind_of, LabelSelector, ResourceStore, StoredResource};
use crate::{Error, Result};

/// Characters Kubernetes uses for generated name suffixes
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..5)
        .filter_map(|_| SUFFIX_ALPHABET.choose(&mut rng).map(|b| *b as char))
        .collect()
}

/// Thread-safe in-memory store for one kind of object
pub struct InMemoryStore<K> {
    objects: DashMap<String, K>,
    last_version: AtomicU64,
}

impl<K: StoredResource> InMemoryStore<K> {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            last_version: AtomicU64::new(0),
        }
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True if no objects are stored
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn next_version(&self) -> String {
        (self.last_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

impl<K: StoredResource> Default for InMemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: StoredResource> ResourceStore<K> for InMemoryStore<K> {
    async fn create(&self, object: &K) -> Result<K> {
        let mut object = object.clone();
        let meta = object.meta_mut();

        if meta.resource_version.is_some() {
            return Err(Error::validation(
                "resourceVersion should not be set on objects to be created",
            ));
        }

        let name = match (meta.name.as_deref(), meta.generate_name.as_deref()) {
            (Some(name), _) if !name.is_empty() => name.to_string(),
            (_, Some(prefix)) if !prefix.is_empty() => format!("{prefix}{}", random_suffix()),
            _ => {
                return Err(Error::validation(format!(
                    "{}: name or generateName is required",
                    kind_of::<K>()
                )))
            }
        };

        meta.name = Some(name.clone());
        meta.resource_version = Some(self.next_version());
        meta.creation_timestamp = Some(Time(Utc::now()));

        match self.objects.entry(name.clone()) {
            Entry::Occupied(_) => Err(Error::already_exists(kind_of::<K>(), name)),
            Entry::Vacant(slot) => {
                trace!(kind = %kind_of::<K>(), name = %name, "Created object");
                slot.insert(object.clone());
                Ok(object)
            }
        }
    }

    async fn get(&self, name: &str) -> Result<K> {
        self.objects
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(kind_of::<K>(), name))
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        let mut items: Vec<K> = self
            .objects
            .iter()
            .filter(|entry| selector.matches(entry.value().labels()))
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by_key(|o| o.name_any());
        Ok(items)
    }

    async fn update(&self, object: &K) -> Result<K> {
        let name = object
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::validation(format!("{}: name is required", kind_of::<K>())))?;

        let mut current = self
            .objects
            .get_mut(&name)
            .ok_or_else(|| Error::not_found(kind_of::<K>(), &name))?;

        // An absent resource version is an unconditional update, as in Kubernetes
        let presented = object.meta().resource_version.as_ref();
        if presented.is_some() && presented != current.meta().resource_version.as_ref() {
            return Err(Error::conflict(kind_of::<K>(), name));
        }

        let mut updated = object.clone();
        updated.meta_mut().resource_version = Some(self.next_version());
        updated.meta_mut().creation_timestamp = current.meta().creation_timestamp.clone();
        *current = updated.clone();

        trace!(kind = %kind_of::<K>(), name = %name, "Updated object");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SpokeCluster;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    fn labeled_secret(name: &str, cluster: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some([("cluster".to_string(), cluster.to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_assigns_resource_version() {
        let store = InMemoryStore::<SpokeCluster>::new();
        let created = store.create(&SpokeCluster::pending("edge-1")).await.unwrap();

        assert!(created.resource_version().is_some());
        assert!(created.creation_timestamp().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_create_duplicate_name_fails() {
        let store = InMemoryStore::<SpokeCluster>::new();
        store.create(&SpokeCluster::pending("edge-1")).await.unwrap();

        let err = store
            .create(&SpokeCluster::pending("edge-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_create_with_resource_version_rejected() {
        let store = InMemoryStore::<SpokeCluster>::new();
        let mut record = SpokeCluster::pending("edge-1");
        record.metadata.resource_version = Some("7".to_string());

        assert!(matches!(
            store.create(&record).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_generate_name_gets_suffix() {
        let store = InMemoryStore::<Secret>::new();
        let secret = Secret {
            metadata: ObjectMeta {
                generate_name: Some("edge-1-".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let a = store.create(&secret).await.unwrap();
        let b = store.create(&secret).await.unwrap();

        assert!(a.name_any().starts_with("edge-1-"));
        assert_eq!(a.name_any().len(), "edge-1-".len() + 5);
        assert_ne!(a.name_any(), b.name_any());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryStore::<SpokeCluster>::new();
        assert!(store.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_label() {
        let store = InMemoryStore::<Secret>::new();
        store.create(&labeled_secret("b", "edge-1")).await.unwrap();
        store.create(&labeled_secret("a", "edge-1")).await.unwrap();
        store.create(&labeled_secret("c", "edge-2")).await.unwrap();

        let items = store
            .list(&LabelSelector::eq("cluster", "edge-1"))
            .await
            .unwrap();
        let names: Vec<String> = items.iter().map(|s| s.name_any()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let all = store.list(&LabelSelector::everything()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    /// Story: A writer holding a stale copy cannot overwrite a newer write
    #[tokio::test]
    async fn story_stale_update_is_a_conflict() {
        let store = InMemoryStore::<SpokeCluster>::new();
        let created = store.create(&SpokeCluster::pending("edge-1")).await.unwrap();

        let mut first = created.clone();
        first.spec.hub_accepts_client = true;
        let written = store.update(&first).await.unwrap();
        assert_ne!(written.resource_version(), created.resource_version());

        // Second writer still holds the original copy
        let mut second = created.clone();
        second.spec.hub_accepts_client = false;
        assert!(store.update(&second).await.unwrap_err().is_conflict());

        // The first write survived
        assert!(store.get("edge-1").await.unwrap().spec.hub_accepts_client);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = InMemoryStore::<SpokeCluster>::new();
        assert!(store
            .update(&SpokeCluster::pending("ghost"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_resource_versions_increase() {
        let store = InMemoryStore::<SpokeCluster>::new();
        let v1 = store.create(&SpokeCluster::pending("edge-1")).await.unwrap();
        let v2 = store.update(&v1).await.unwrap();

        let parse = |r: &SpokeCluster| r.resource_version().unwrap().parse::<u64>().unwrap();
        assert!(parse(&v2) > parse(&v1));
    }
}
