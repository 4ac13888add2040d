//! Resource store contract
//!
//! The handshake only needs four operations against the hub's object store:
//! create, get, list by label, and update with optimistic concurrency. A
//! write whose resource version is stale fails with [`Error::Conflict`](crate::Error::Conflict);
//! nothing else in the crate serializes writers.
//!
//! - [`InMemoryStore`] keeps objects in process (loopback runs and tests)
//! - [`KubeStore`] talks to a Kubernetes API server through `kube::Api`

mod kube_store;
mod memory;
mod selector;

use std::fmt::Debug;

use async_trait::async_trait;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

pub use kube_store::KubeStore;
pub use memory::InMemoryStore;
pub use selector::{LabelSelector, Requirement};

/// Objects the store can hold: any Kubernetes resource with static type info
pub trait StoredResource:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoredResource for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Kind name of a stored resource, for errors and logs
pub fn kind_of<K: StoredResource>() -> String {
    K::kind(&()).into_owned()
}

/// Generic create/get/list/update API over one kind of object.
///
/// Each store is bound to a single kind (and, for namespaced kinds, a single
/// namespace) at construction; callers pass store handles explicitly.
#[async_trait]
pub trait ResourceStore<K: StoredResource>: Send + Sync {
    /// Create a new object.
    ///
    /// Fails with [`Error::AlreadyExists`](crate::Error::AlreadyExists) if an
    /// object with the same name exists.
    async fn create(&self, object: &K) -> Result<K>;

    /// Fetch an object by name; [`Error::NotFound`](crate::Error::NotFound)
    /// if absent.
    async fn get(&self, name: &str) -> Result<K>;

    /// List objects whose labels match the selector
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>>;

    /// Replace an object.
    ///
    /// Fails with [`Error::Conflict`](crate::Error::Conflict) if the object's
    /// resource version is not the current one.
    async fn update(&self, object: &K) -> Result<K>;
}
