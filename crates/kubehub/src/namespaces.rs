use anyhow::{anyhow, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::Api,
    runtime::{
        reflector::{self, ObjectRef},
        watcher, WatchStreamExt,
    },
    Client,
};
use tracing::{info, warn};

use kanso_core::{TenantKey, TenantResolver};

/// Reflector-backed namespace name to UID lookup.
#[derive(Clone)]
pub struct NamespaceCache {
    store: reflector::Store<Namespace>,
}

impl NamespaceCache {
    /// Starts the namespace reflector and waits for its first full list.
    pub async fn start(client: Client) -> Result<Self> {
        let api: Api<Namespace> = Api::all(client);
        let (store, writer) = reflector::store();
        let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default())).default_backoff();
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(ev) = stream.next().await {
                if let Err(e) = ev {
                    warn!(error = %e, "namespace reflector error; backing off");
                }
            }
            warn!("namespace reflector stream ended");
        });
        store.wait_until_ready().await.map_err(|e| anyhow!("namespace cache: {e}"))?;
        info!(namespaces = store.state().len(), "namespace cache ready");
        Ok(Self { store })
    }
}

impl TenantResolver for NamespaceCache {
    fn tenant_key(&self, namespace: &str) -> Option<TenantKey> {
        let ns = self.store.get(&ObjectRef::new(namespace))?;
        ns.metadata.uid.clone().map(TenantKey)
    }
}
