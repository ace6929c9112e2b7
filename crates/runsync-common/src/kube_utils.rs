//! Generic keyed CRUD over Kubernetes resources
//!
//! Reconcilers never talk to `kube::Api` directly. They go through
//! [`ResourceClient`], one instance per resource kind, bound to a namespace
//! (or to the cluster for cluster-scoped kinds). [`NamespacedClients`] hands
//! out such clients for namespaces only known at reconcile time. All errors
//! are classified into [`Error::NotFound`] / [`Error::Conflict`] at this
//! boundary.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use kube::core::{ClusterResourceScope, NamespaceResourceScope};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::Error;

/// Field manager used for status patches
pub const FIELD_MANAGER: &str = "runsync-controller";
/// Label marking objects this operator created
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

// =============================================================================
// Client trait
// =============================================================================

/// Keyed CRUD capability for one resource kind in one namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<K>, Error>;

    /// List objects matching a label selector
    async fn list(&self, label_selector: &str) -> Result<Vec<K>, Error>;

    /// Create an object. An existing object yields [`Error::Conflict`].
    async fn create(&self, obj: &K) -> Result<K, Error>;

    /// Replace an object. The object's resourceVersion is sent along, so a
    /// stale read yields [`Error::Conflict`].
    async fn update(&self, obj: &K) -> Result<K, Error>;

    /// Merge-patch the status subresource
    async fn patch_status(&self, name: &str, status: serde_json::Value) -> Result<(), Error>;

    /// Delete with background propagation so dependents go promptly.
    /// Deleting a missing object succeeds.
    async fn delete(&self, name: &str) -> Result<(), Error>;
}

// =============================================================================
// kube-rs implementation
// =============================================================================

/// [`ResourceClient`] backed by a `kube::Api`
pub struct KubeResourceClient<K> {
    api: Api<K>,
}

impl<K> KubeResourceClient<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    /// Bind a client to a namespace
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

impl<K> KubeResourceClient<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
{
    /// Client for a cluster-scoped kind
    pub fn cluster(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_string()
}

#[async_trait]
impl<K> ResourceClient<K> for KubeResourceClient<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, Error> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, kind_of::<K>(), name))
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<K>, Error> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .api
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, kind_of::<K>(), label_selector))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let name = obj.name_any();
        self.api
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, kind_of::<K>(), name))
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        let name = obj.name_any();
        self.api
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, kind_of::<K>(), name.clone()))
    }

    async fn patch_status(&self, name: &str, status: serde_json::Value) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        self.api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, kind_of::<K>(), name))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => match Error::from_kube(e, kind_of::<K>(), name) {
                Error::NotFound { .. } => {
                    debug!(kind = %kind_of::<K>(), name = %name, "already deleted");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }
}

// =============================================================================
// Per-namespace clients
// =============================================================================

/// Source of [`ResourceClient`]s for namespaces chosen per object
pub trait NamespacedClients<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    fn in_namespace(&self, namespace: &str) -> Arc<dyn ResourceClient<K>>;
}

/// [`NamespacedClients`] over one cluster connection
#[derive(Clone)]
pub struct KubeClients {
    client: Client,
}

impl KubeClients {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl<K> NamespacedClients<K> for KubeClients
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    fn in_namespace(&self, namespace: &str) -> Arc<dyn ResourceClient<K>> {
        Arc::new(KubeResourceClient::namespaced(self.client.clone(), namespace))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Create an object, or return the existing one when another writer won the race
///
/// Creation is "create if absent, else reuse": a 409 on create means an object
/// with the deterministic name already exists, so it is fetched and adopted.
pub async fn create_or_adopt<K>(
    client: &dyn ResourceClient<K>,
    obj: &K,
    name: &str,
) -> Result<K, Error>
where
    K: Clone + Send + Sync + 'static,
{
    match client.create(obj).await {
        Ok(created) => Ok(created),
        Err(e) if e.is_conflict() => client.get(name).await?.ok_or_else(|| {
            Error::internal_with_context(
                format!("{} vanished after create conflict", name),
                "create_or_adopt",
            )
        }),
        Err(e) => Err(e),
    }
}

/// Create a namespace labelled as ours unless it already exists
pub async fn ensure_namespace(
    namespaces: &dyn ResourceClient<Namespace>,
    name: &str,
) -> Result<(), Error> {
    if namespaces.get(name).await?.is_some() {
        return Ok(());
    }
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                "runsync".to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    };
    create_or_adopt(namespaces, &ns, name).await?;
    debug!(namespace = %name, "ensured namespace");
    Ok(())
}

/// True when the object has been marked for deletion
pub fn is_terminating<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}
