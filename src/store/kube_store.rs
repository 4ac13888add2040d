//! Resource store backed by a Kubernetes API server

use async_trait::async_trait;
use kube::api::{Api, ListParams, PostParams};
use kube::ResourceExt;
use tracing::{debug, instrument};

use super::{kind_of, LabelSelector, ResourceStore, StoredResource};
use crate::{Error, Result};

/// [`ResourceStore`] over a `kube::Api`.
///
/// Some kinds only accept certain writes through a subresource: CSR
/// approval goes through `approval` and certificate issuance through
/// `status`. Set one with [`KubeStore::with_update_subresource`] and every
/// `update` is sent there instead of the main resource.
#[derive(Clone)]
pub struct KubeStore<K> {
    api: Api<K>,
    update_subresource: Option<String>,
}

impl<K: StoredResource> KubeStore<K> {
    /// Wrap an API handle (already scoped to a namespace if `K` is namespaced)
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            update_subresource: None,
        }
    }

    /// Send updates to the named subresource
    pub fn with_update_subresource(mut self, subresource: impl Into<String>) -> Self {
        self.update_subresource = Some(subresource.into());
        self
    }

    fn map_error(err: kube::Error, name: &str) -> Error {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind_of::<K>(), name),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Error::already_exists(kind_of::<K>(), name)
            }
            kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind_of::<K>(), name),
            other => Error::Kube(other),
        }
    }
}

#[async_trait]
impl<K: StoredResource> ResourceStore<K> for KubeStore<K> {
    #[instrument(skip(self, object), fields(kind = %kind_of::<K>(), name = %object.name_any()))]
    async fn create(&self, object: &K) -> Result<K> {
        let created = self
            .api
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| Self::map_error(e, &object.name_any()))?;
        debug!(name = %created.name_any(), "Created object");
        Ok(created)
    }

    async fn get(&self, name: &str) -> Result<K> {
        self.api
            .get(name)
            .await
            .map_err(|e| Self::map_error(e, name))
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        let params = if selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(&selector.to_string())
        };
        let list = self
            .api
            .list(&params)
            .await
            .map_err(|e| Self::map_error(e, &selector.to_string()))?;
        Ok(list.items)
    }

    #[instrument(skip(self, object), fields(kind = %kind_of::<K>(), name = %object.name_any()))]
    async fn update(&self, object: &K) -> Result<K> {
        let name = object.name_any();
        let pp = PostParams::default();
        let result = match &self.update_subresource {
            Some(sub) => {
                let body = serde_json::to_vec(object)?;
                self.api.replace_subresource(sub, &name, &pp, body).await
            }
            None => self.api.replace(&name, &pp, object).await,
        };
        result.map_err(|e| Self::map_error(e, &name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SpokeCluster;
    use kube::core::ErrorResponse;
    use rstest::rstest;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[rstest]
    #[case::missing(404, "NotFound", "NotFound")]
    #[case::duplicate(409, "AlreadyExists", "AlreadyExists")]
    #[case::stale(409, "Conflict", "Conflict")]
    #[case::forbidden(403, "Forbidden", "Kube")]
    #[case::server(500, "InternalError", "Kube")]
    fn test_api_errors_map_to_store_errors(
        #[case] code: u16,
        #[case] reason: &str,
        #[case] expected: &str,
    ) {
        let mapped = KubeStore::<SpokeCluster>::map_error(api_error(code, reason), "edge-1");
        let variant = match mapped {
            Error::NotFound { .. } => "NotFound",
            Error::AlreadyExists { .. } => "AlreadyExists",
            Error::Conflict { .. } => "Conflict",
            Error::Kube(_) => "Kube",
            other => panic!("unexpected mapping: {other:?}"),
        };
        assert_eq!(variant, expected);
    }

    #[test]
    fn test_mapped_errors_carry_kind_and_name() {
        match KubeStore::<SpokeCluster>::map_error(api_error(404, "NotFound"), "edge-1") {
            Error::NotFound { kind, name } => {
                assert_eq!(kind, "SpokeCluster");
                assert_eq!(name, "edge-1");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
