//! Kanso kubehub: the cluster seam used by workers, its kube-backed and
//! in-memory implementations, and the notifier shims that feed the normalizer.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;

use kanso_core::{KansoError, KansoResult, ResourceKey};
use kanso_schema::{ApiObject, Operation};

mod kube_cluster;
#[cfg(any(test, feature = "testing"))]
mod mem;
mod namespaces;
mod notify;

pub use kube_cluster::KubeCluster;
#[cfg(any(test, feature = "testing"))]
pub use mem::MemCluster;
pub use namespaces::NamespaceCache;
pub use notify::{start_notifier, start_secret_watcher, Sightings};

/// Everything a reconciliation worker needs from the API server.
///
/// Reads return `Ok(None)` for objects that do not exist; deletes return
/// `Ok(false)` for objects that were already gone.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> KansoResult<Option<ApiObject>>;
    /// Merge-patches the status subresource of a reconciled object.
    /// Returns false when the object no longer exists.
    async fn patch_status(&self, key: &ResourceKey, status: serde_json::Value) -> KansoResult<bool>;

    async fn get_secret(&self, namespace: &str, name: &str) -> KansoResult<Option<Secret>>;
    /// Creates or replaces the secret.
    async fn apply_secret(&self, namespace: &str, secret: Secret) -> KansoResult<()>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> KansoResult<bool>;

    /// Creates the signal object; an existing object with the same name is left untouched.
    async fn create_operation(&self, namespace: &str, op: Operation) -> KansoResult<()>;
    async fn get_operation(&self, namespace: &str, name: &str) -> KansoResult<Option<Operation>>;
    async fn delete_operation(&self, namespace: &str, name: &str) -> KansoResult<bool>;
}

/// Maps API server failures onto the error taxonomy.
pub fn kube_error(e: kube::Error) -> KansoError {
    match &e {
        kube::Error::Api(ae) if ae.code == 409 => KansoError::Conflict(ae.message.clone()),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => KansoError::Validation(ae.message.clone()),
        kube::Error::Api(ae) if ae.code == 404 => {
            KansoError::Transient(format!("not found: {}", ae.message))
        }
        _ => KansoError::Transient(e.to_string()),
    }
}
