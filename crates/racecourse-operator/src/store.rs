//! The object store the reconciler converges against.
//!
//! The core only ever needs four verbs: fetch by identity, create, replace
//! with a version check, and replace the status subresource with a version
//! check. Keeping them behind a trait lets the reconciliation engine run
//! against the API server in production and an in-memory store in tests.
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service, networking::v1::Ingress};
use k8s_openapi::NamespaceResourceScope;
use kube::{api::{Api, Patch, PatchParams, PostParams}, Client, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::trace;

use crate::crd::Racecourse;
use crate::error::{Error, Result};

#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Fails with [`Error::Conflict`] if `obj`'s resource version is stale.
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Writes only `status`; versioned independently of the main object.
    async fn replace_status(&self, obj: &K) -> Result<K>;
}

/// Every kind the racecourse reconciler reads or writes.
pub trait ClusterStore:
    ObjectStore<Racecourse> + ObjectStore<Deployment> + ObjectStore<Service> + ObjectStore<Ingress>
{
}

impl<T> ClusterStore for T where
    T: ObjectStore<Racecourse> + ObjectStore<Deployment> + ObjectStore<Service> + ObjectStore<Ingress>
{
}

/// API server backed store.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }

    fn api<K>(&self, obj: &K) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &obj.namespace().unwrap_or_default())
    }

    fn post_params(&self) -> PostParams {
        PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        trace!(kind = %K::kind(&()), %name, "store.create");
        self.api(obj)
            .create(&self.post_params(), obj)
            .await
            .map_err(|e| Error::from_api(e, &K::kind(&()), &name))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        trace!(kind = %K::kind(&()), %name, rv = ?obj.resource_version(), "store.replace");
        self.api(obj)
            .replace(&name, &self.post_params(), obj)
            .await
            .map_err(|e| Error::from_api(e, &K::kind(&()), &name))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        trace!(kind = %K::kind(&()), %name, rv = ?obj.resource_version(), "store.replace_status");
        // resourceVersion in a merge patch makes the API server reject stale writes with 409
        let status = serde_json::to_value(obj)?.get("status").cloned().unwrap_or(serde_json::Value::Null);
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });
        let params = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        self.api(obj)
            .patch_status(&name, &params, &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_api(e, &K::kind(&()), &name))
    }
}
