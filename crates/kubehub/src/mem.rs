//! In-memory `Cluster`. Backs tests and local dry runs; it also plays the
//! engine agent through the operation status helpers.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use kanso_core::{KansoError, KansoResult, ResourceKey, TenantKey, TenantResolver};
use kanso_schema::{ApiObject, Operation, OperationState, OperationStatus};

use crate::Cluster;

type Named = (String, String);

#[derive(Default)]
struct MemState {
    namespaces: BTreeMap<String, String>,
    objects: BTreeMap<ResourceKey, ApiObject>,
    secrets: BTreeMap<Named, Secret>,
    operations: BTreeMap<Named, Operation>,
    status_patches: u64,
    uid_seq: u64,
}

#[derive(Default)]
pub struct MemCluster {
    state: Mutex<MemState>,
}

/// RFC 7386 merge patch.
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge(t.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

fn with_status<T: Serialize + DeserializeOwned>(obj: &T, status: &Value) -> KansoResult<T> {
    let mut raw = serde_json::to_value(obj).map_err(|e| KansoError::Fatal(e.to_string()))?;
    merge(&mut raw, &serde_json::json!({ "status": status }));
    serde_json::from_value(raw).map_err(|e| KansoError::Validation(format!("status patch rejected: {e}")))
}

impl MemCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> KansoResult<MutexGuard<'_, MemState>> {
        self.state.lock().map_err(|_| KansoError::Fatal("mem cluster lock poisoned".into()))
    }

    fn next_uid(st: &mut MemState, prefix: &str) -> String {
        st.uid_seq += 1;
        format!("{prefix}-{:04}", st.uid_seq)
    }

    /// Registers a namespace and returns its UID (the tenant key).
    pub fn add_namespace(&self, name: &str) -> KansoResult<String> {
        let mut st = self.lock()?;
        if let Some(uid) = st.namespaces.get(name) {
            return Ok(uid.clone());
        }
        let uid = Self::next_uid(&mut st, "ns");
        st.namespaces.insert(name.to_string(), uid.clone());
        Ok(uid)
    }

    pub fn remove_namespace(&self, name: &str) -> KansoResult<()> {
        self.lock()?.namespaces.remove(name);
        Ok(())
    }

    /// Creates or replaces an object; assigns a UID when the object has none.
    pub fn put(&self, mut obj: ApiObject) -> KansoResult<String> {
        let mut st = self.lock()?;
        let uid = match obj.uid() {
            Some(uid) => uid.to_string(),
            None => {
                let uid = Self::next_uid(&mut st, "uid");
                obj.meta_mut().uid = Some(uid.clone());
                uid
            }
        };
        let key = ResourceKey::new(obj.kind(), obj.namespace(), obj.name());
        st.objects.insert(key, obj);
        Ok(uid)
    }

    pub fn object(&self, key: &ResourceKey) -> KansoResult<Option<ApiObject>> {
        Ok(self.lock()?.objects.get(key).cloned())
    }

    pub fn remove(&self, key: &ResourceKey) -> KansoResult<Option<ApiObject>> {
        Ok(self.lock()?.objects.remove(key))
    }

    /// Sets a deletion timestamp, as the API server does while finalizers run.
    pub fn mark_terminating(&self, key: &ResourceKey) -> KansoResult<()> {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
        let mut st = self.lock()?;
        if let Some(obj) = st.objects.get_mut(key) {
            obj.meta_mut().deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        }
        Ok(())
    }

    /// Number of status patches applied so far.
    pub fn status_patches(&self) -> KansoResult<u64> {
        Ok(self.lock()?.status_patches)
    }

    pub fn put_secret(&self, namespace: &str, mut secret: Secret) -> KansoResult<()> {
        let mut st = self.lock()?;
        secret.metadata.namespace = Some(namespace.to_string());
        let name = secret.metadata.name.clone().unwrap_or_default();
        st.secrets.insert((namespace.to_string(), name), secret);
        Ok(())
    }

    pub fn secret(&self, namespace: &str, name: &str) -> KansoResult<Option<Secret>> {
        Ok(self.lock()?.secrets.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    pub fn remove_secret(&self, namespace: &str, name: &str) -> KansoResult<bool> {
        Ok(self.lock()?.secrets.remove(&(namespace.to_string(), name.to_string())).is_some())
    }

    pub fn secret_names(&self, namespace: &str) -> KansoResult<Vec<String>> {
        let st = self.lock()?;
        Ok(st.secrets.keys().filter(|(ns, _)| ns == namespace).map(|(_, n)| n.clone()).collect())
    }

    pub fn operations(&self, namespace: &str) -> KansoResult<Vec<Operation>> {
        let st = self.lock()?;
        Ok(st.operations.iter().filter(|((ns, _), _)| ns == namespace).map(|(_, o)| o.clone()).collect())
    }

    /// Writes an Operation's status the way the engine agent would.
    pub fn set_operation_status(&self, namespace: &str, name: &str, status: OperationStatus) -> KansoResult<bool> {
        let mut st = self.lock()?;
        match st.operations.get_mut(&(namespace.to_string(), name.to_string())) {
            Some(op) => {
                op.status = Some(status);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Moves every non-terminal Operation in `namespace` to `state`; returns how many changed.
    pub fn finish_operations(&self, namespace: &str, state: OperationState, message: &str) -> KansoResult<usize> {
        let mut st = self.lock()?;
        let mut n = 0;
        for ((ns, _), op) in st.operations.iter_mut() {
            let open = op.status.as_ref().map(|s| !s.state.is_terminal()).unwrap_or(true);
            if ns == namespace && open {
                op.status = Some(OperationStatus { state, message: message.to_string(), ..Default::default() });
                n += 1;
            }
        }
        Ok(n)
    }
}

impl TenantResolver for MemCluster {
    fn tenant_key(&self, namespace: &str) -> Option<TenantKey> {
        let st = self.state.lock().ok()?;
        st.namespaces.get(namespace).cloned().map(TenantKey)
    }
}

#[async_trait]
impl Cluster for MemCluster {
    async fn get(&self, key: &ResourceKey) -> KansoResult<Option<ApiObject>> {
        self.object(key)
    }

    async fn patch_status(&self, key: &ResourceKey, status: Value) -> KansoResult<bool> {
        let mut st = self.lock()?;
        let Some(obj) = st.objects.get(key) else {
            return Ok(false);
        };
        let patched = match obj {
            ApiObject::Deployment(o) => ApiObject::Deployment(with_status(o, &status)?),
            ApiObject::ManagedEnvironment(o) => ApiObject::ManagedEnvironment(with_status(o, &status)?),
            ApiObject::RepositoryCredential(o) => ApiObject::RepositoryCredential(with_status(o, &status)?),
            ApiObject::SyncRun(o) => ApiObject::SyncRun(with_status(o, &status)?),
        };
        st.objects.insert(key.clone(), patched);
        st.status_patches += 1;
        Ok(true)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> KansoResult<Option<Secret>> {
        self.secret(namespace, name)
    }

    async fn apply_secret(&self, namespace: &str, secret: Secret) -> KansoResult<()> {
        self.put_secret(namespace, secret)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> KansoResult<bool> {
        self.remove_secret(namespace, name)
    }

    async fn create_operation(&self, namespace: &str, mut op: Operation) -> KansoResult<()> {
        let mut st = self.lock()?;
        let name = op.metadata.name.clone().unwrap_or_default();
        let slot = (namespace.to_string(), name);
        if !st.operations.contains_key(&slot) {
            op.metadata.namespace = Some(namespace.to_string());
            st.operations.insert(slot, op);
        }
        Ok(())
    }

    async fn get_operation(&self, namespace: &str, name: &str) -> KansoResult<Option<Operation>> {
        Ok(self.lock()?.operations.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn delete_operation(&self, namespace: &str, name: &str) -> KansoResult<bool> {
        Ok(self.lock()?.operations.remove(&(namespace.to_string(), name.to_string())).is_some())
    }
}
