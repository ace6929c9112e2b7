//! In-memory stand-ins for the cluster and the console

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use runsync_common::{Error, NamespacedClients, ResourceClient};
use runsync_console::{
    ConsoleError, Page, RunKind, RunRecord, RunSource, StatusAttributes, StepStatus,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A namespaced object store with API-server-like create, update and delete
///
/// Deleting an object with finalizers only marks it; it disappears once an
/// update clears the finalizers. Every mutating call is counted.
pub struct FakeStore<K> {
    objects: Mutex<BTreeMap<String, K>>,
    mutations: AtomicUsize,
    next_uid: AtomicUsize,
    conflict_next_update: AtomicBool,
    fail_deletes: AtomicBool,
}

impl<K> Default for FakeStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            mutations: AtomicUsize::new(0),
            next_uid: AtomicUsize::new(1),
            conflict_next_update: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }
}

impl<K> FakeStore<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn object(&self, name: &str) -> Option<K> {
        self.objects.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// Insert or overwrite without counting a mutation
    pub fn put(&self, obj: K) {
        self.objects.lock().insert(obj.name_any(), obj);
    }

    pub fn conflict_next_update(&self) {
        self.conflict_next_update.store(true, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    pub fn allow_deletes(&self) {
        self.fail_deletes.store(false, Ordering::SeqCst);
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn bump(obj: &mut K) {
        let rv = obj
            .meta()
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        obj.meta_mut().resource_version = Some((rv + 1).to_string());
    }
}

fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let Value::Object(out) = target else { return };
    for (key, value) in fields {
        if value.is_null() {
            out.remove(key);
        } else {
            merge(out.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

fn selector_matches<K: Resource>(obj: &K, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => obj.labels().get(k).is_some_and(|l| l == v),
            None => false,
        })
}

#[async_trait]
impl<K> ResourceClient<K> for FakeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, Error> {
        Ok(self.objects.lock().get(name).cloned())
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<K>, Error> {
        Ok(self
            .objects
            .lock()
            .values()
            .filter(|o| selector_matches(*o, label_selector))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let name = obj.name_any();
        let mut objects = self.objects.lock();
        if objects.contains_key(&name) {
            return Err(Error::conflict(Self::kind(), name, "already exists"));
        }
        let mut obj = obj.clone();
        let uid = self.next_uid.fetch_add(1, Ordering::SeqCst);
        obj.meta_mut().uid = Some(format!("uid-{}", uid));
        obj.meta_mut().resource_version = Some("1".to_string());
        objects.insert(name, obj.clone());
        Ok(obj)
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let name = obj.name_any();
        if self.conflict_next_update.swap(false, Ordering::SeqCst) {
            return Err(Error::conflict(Self::kind(), name, "object has been modified"));
        }
        let mut objects = self.objects.lock();
        let Some(current) = objects.get(&name) else {
            return Err(Error::not_found(Self::kind(), name));
        };
        let mut obj = obj.clone();
        obj.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
        Self::bump(&mut obj);
        if obj.meta().deletion_timestamp.is_some() && obj.finalizers().is_empty() {
            objects.remove(&name);
        } else {
            objects.insert(name, obj.clone());
        }
        Ok(obj)
    }

    async fn patch_status(&self, name: &str, status: Value) -> Result<(), Error> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock();
        let Some(current) = objects.get(name) else {
            return Err(Error::not_found(Self::kind(), name));
        };
        let mut json = serde_json::to_value(current)?;
        merge(&mut json, &serde_json::json!({ "status": status }));
        let mut obj: K = serde_json::from_value(json)?;
        Self::bump(&mut obj);
        objects.insert(name.to_string(), obj);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::internal(format!("delete of {} refused", name)));
        }
        let mut objects = self.objects.lock();
        let Some(finalized) = objects.get(name).map(|o| o.finalizers().is_empty()) else {
            return Ok(());
        };
        if finalized {
            objects.remove(name);
        } else if let Some(obj) = objects.get_mut(name) {
            obj.meta_mut()
                .deletion_timestamp
                .get_or_insert_with(|| Time(k8s_openapi::chrono::Utc::now()));
        }
        Ok(())
    }
}

/// One [`FakeStore`] per namespace, created on first use
pub struct FakeStores<K> {
    stores: Mutex<BTreeMap<String, Arc<FakeStore<K>>>>,
}

impl<K> Default for FakeStores<K> {
    fn default() -> Self {
        Self {
            stores: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<K> FakeStores<K> {
    pub fn store(&self, namespace: &str) -> Arc<FakeStore<K>> {
        self.stores
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }
}

impl<K> NamespacedClients<K> for FakeStores<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn in_namespace(&self, namespace: &str) -> Arc<dyn ResourceClient<K>> {
        self.store(namespace)
    }
}

/// Console stand-in serving fixed records and recording status updates
#[derive(Default)]
pub struct FakeSource {
    pub records: Mutex<BTreeMap<String, RunRecord>>,
    pub updates: Mutex<Vec<(RunKind, String, StatusAttributes)>>,
    pub step_updates: Mutex<Vec<(String, StepStatus)>>,
    gone: AtomicBool,
}

impl FakeSource {
    /// Answer every call with NotFound from now on
    pub fn vanish(&self) {
        self.gone.store(true, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<(RunKind, String, StatusAttributes)> {
        self.updates.lock().clone()
    }

    pub fn step_updates(&self) -> Vec<(String, StepStatus)> {
        self.step_updates.lock().clone()
    }
}

#[async_trait]
impl RunSource for FakeSource {
    async fn get_run(&self, _kind: RunKind, id: &str) -> Result<RunRecord, ConsoleError> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(ConsoleError::NotFound { id: id.to_string() });
        }
        self.records
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ConsoleError::NotFound { id: id.to_string() })
    }

    async fn list_runs(
        &self,
        _kind: RunKind,
        _cursor: Option<String>,
        _page_size: usize,
    ) -> Result<Page, ConsoleError> {
        Ok(Page {
            items: self.records.lock().values().cloned().collect(),
            ..Default::default()
        })
    }

    async fn update_run_status(
        &self,
        kind: RunKind,
        id: &str,
        attrs: StatusAttributes,
    ) -> Result<(), ConsoleError> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(ConsoleError::NotFound { id: id.to_string() });
        }
        self.updates.lock().push((kind, id.to_string(), attrs));
        Ok(())
    }

    async fn update_run_step(&self, step_id: &str, status: StepStatus) -> Result<(), ConsoleError> {
        self.step_updates.lock().push((step_id.to_string(), status));
        Ok(())
    }
}
