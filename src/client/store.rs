//! Typed access to the declarative resources the controllers read and write.
//!
//! [`ResourceStore`] is the seam between reconciliation logic and the
//! Kubernetes API. [`KubeStore`] implements it with `kube::Api`; functional
//! tests implement it in memory.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::controller::common::{add_finalizer, classify, remove_finalizer};
use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::Result;
use crate::crd::{Cache, CacheStatus, DataGridCluster, DataGridClusterStatus};

/// CRUD and list access with optimistic concurrency.
///
/// Reads return `Ok(None)` for missing objects. Writes return
/// `Error::Conflict` when the object changed since it was read and
/// `Error::NotFound` when it vanished.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<DataGridCluster>>;

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DataGridClusterStatus,
    ) -> Result<()>;

    async fn get_cache(&self, namespace: &str, name: &str) -> Result<Option<Cache>>;

    /// Caches whose `spec.clusterName` is `cluster`.
    async fn list_caches_for_cluster(&self, namespace: &str, cluster: &str) -> Result<Vec<Cache>>;

    /// Create a cache; `metadata.generateName` is honoured.
    async fn create_cache(&self, cache: &Cache) -> Result<Cache>;

    /// Replace a cache, failing with a conflict if its resourceVersion is stale.
    async fn replace_cache(&self, cache: &Cache) -> Result<Cache>;

    async fn patch_cache_status(&self, namespace: &str, name: &str, status: &CacheStatus)
    -> Result<()>;

    async fn add_cache_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    async fn remove_cache_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete a cache resource. Missing resources are not an error.
    async fn delete_cache(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    async fn apply_stateful_set(&self, sts: &StatefulSet) -> Result<()>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a secret. An existing secret yields `Error::Conflict`.
    async fn create_secret(&self, secret: &Secret) -> Result<()>;

    async fn apply_service(&self, service: &Service) -> Result<()>;
}

/// [`ResourceStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn object_name(namespace: Option<String>, name: &str) -> String {
    format!("{}/{}", namespace.unwrap_or_default(), name)
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<DataGridCluster>> {
        Ok(self.api::<DataGridCluster>(namespace).get_opt(name).await?)
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DataGridClusterStatus,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api::<DataGridCluster>(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, &format!("cluster {namespace}/{name}")))?;
        Ok(())
    }

    async fn get_cache(&self, namespace: &str, name: &str) -> Result<Option<Cache>> {
        Ok(self.api::<Cache>(namespace).get_opt(name).await?)
    }

    async fn list_caches_for_cluster(&self, namespace: &str, cluster: &str) -> Result<Vec<Cache>> {
        let caches = self.api::<Cache>(namespace).list(&ListParams::default()).await?;
        Ok(caches
            .items
            .into_iter()
            .filter(|c| c.spec.cluster_name == cluster)
            .collect())
    }

    async fn create_cache(&self, cache: &Cache) -> Result<Cache> {
        let namespace = cache.namespace().unwrap_or_default();
        let what = object_name(
            cache.namespace(),
            cache
                .metadata
                .name
                .as_deref()
                .or(cache.metadata.generate_name.as_deref())
                .unwrap_or_default(),
        );
        self.api::<Cache>(&namespace)
            .create(&PostParams::default(), cache)
            .await
            .map_err(|e| classify(e, &format!("cache {what}")))
    }

    async fn replace_cache(&self, cache: &Cache) -> Result<Cache> {
        let namespace = cache.namespace().unwrap_or_default();
        let name = cache.name_any();
        self.api::<Cache>(&namespace)
            .replace(&name, &PostParams::default(), cache)
            .await
            .map_err(|e| classify(e, &format!("cache {namespace}/{name}")))
    }

    async fn patch_cache_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CacheStatus,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api::<Cache>(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, &format!("cache {namespace}/{name}")))?;
        Ok(())
    }

    async fn add_cache_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        add_finalizer(&self.api::<Cache>(namespace), name, crate::crd::CACHE_FINALIZER).await
    }

    async fn remove_cache_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        remove_finalizer(&self.api::<Cache>(namespace), name, crate::crd::CACHE_FINALIZER).await
    }

    async fn delete_cache(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<Cache>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.api::<StatefulSet>(namespace).get_opt(name).await?)
    }

    async fn apply_stateful_set(&self, sts: &StatefulSet) -> Result<()> {
        let namespace = sts.namespace().unwrap_or_default();
        self.api::<StatefulSet>(&namespace)
            .patch(
                &sts.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(sts),
            )
            .await?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&label_selector(selector));
        Ok(self.api::<Pod>(namespace).list(&params).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.api::<Secret>(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        self.api::<Secret>(&namespace)
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| classify(e, &format!("secret {namespace}/{name}")))?;
        Ok(())
    }

    async fn apply_service(&self, service: &Service) -> Result<()> {
        let namespace = service.namespace().unwrap_or_default();
        self.api::<Service>(&namespace)
            .patch(
                &service.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(service),
            )
            .await?;
        Ok(())
    }
}
