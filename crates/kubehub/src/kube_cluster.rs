use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    Client,
};
use metrics::histogram;
use serde::de::DeserializeOwned;
use tracing::debug;

use kanso_core::{KansoResult, ResourceKey, ResourceKind};
use kanso_schema::{
    ApiObject, GitOpsDeployment, GitOpsDeploymentManagedEnvironment, GitOpsDeploymentRepositoryCredential,
    GitOpsDeploymentSyncRun, Operation,
};

use crate::{kube_error, Cluster};

const FIELD_MANAGER: &str = "kanso";

/// `Cluster` backed by a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    async fn get_typed<K>(&self, ns: &str, name: &str) -> KansoResult<Option<K>>
    where
        K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), ns);
        api.get_opt(name).await.map_err(kube_error)
    }

    async fn patch_status_typed<K>(&self, ns: &str, name: &str, status: serde_json::Value) -> KansoResult<bool>
    where
        K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), ns);
        let patch = serde_json::json!({ "status": status });
        match api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(kube_error(e)),
        }
    }
}

async fn delete_named<K>(api: Api<K>, name: &str) -> KansoResult<bool>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(kube_error(e)),
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get(&self, key: &ResourceKey) -> KansoResult<Option<ApiObject>> {
        let started = Instant::now();
        let (ns, name) = (key.namespace.as_str(), key.name.as_str());
        let obj = match key.kind {
            ResourceKind::Deployment => self.get_typed::<GitOpsDeployment>(ns, name).await?.map(ApiObject::Deployment),
            ResourceKind::ManagedEnvironment => self
                .get_typed::<GitOpsDeploymentManagedEnvironment>(ns, name)
                .await?
                .map(ApiObject::ManagedEnvironment),
            ResourceKind::RepositoryCredential => self
                .get_typed::<GitOpsDeploymentRepositoryCredential>(ns, name)
                .await?
                .map(ApiObject::RepositoryCredential),
            ResourceKind::SyncRun => self.get_typed::<GitOpsDeploymentSyncRun>(ns, name).await?.map(ApiObject::SyncRun),
        };
        histogram!("kubehub_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(obj)
    }

    async fn patch_status(&self, key: &ResourceKey, status: serde_json::Value) -> KansoResult<bool> {
        let (ns, name) = (key.namespace.as_str(), key.name.as_str());
        debug!(key = %key, "patching status");
        match key.kind {
            ResourceKind::Deployment => self.patch_status_typed::<GitOpsDeployment>(ns, name, status).await,
            ResourceKind::ManagedEnvironment => {
                self.patch_status_typed::<GitOpsDeploymentManagedEnvironment>(ns, name, status).await
            }
            ResourceKind::RepositoryCredential => {
                self.patch_status_typed::<GitOpsDeploymentRepositoryCredential>(ns, name, status).await
            }
            ResourceKind::SyncRun => self.patch_status_typed::<GitOpsDeploymentSyncRun>(ns, name, status).await,
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> KansoResult<Option<Secret>> {
        self.get_typed::<Secret>(namespace, name).await
    }

    async fn apply_secret(&self, namespace: &str, secret: Secret) -> KansoResult<()> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &pp, &Patch::Apply(&secret)).await.map_err(kube_error)?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> KansoResult<bool> {
        delete_named::<Secret>(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn create_operation(&self, namespace: &str, op: Operation) -> KansoResult<()> {
        let api: Api<Operation> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), &op).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(kube_error(e)),
        }
    }

    async fn get_operation(&self, namespace: &str, name: &str) -> KansoResult<Option<Operation>> {
        self.get_typed::<Operation>(namespace, name).await
    }

    async fn delete_operation(&self, namespace: &str, name: &str) -> KansoResult<bool> {
        delete_named::<Operation>(Api::namespaced(self.client.clone(), namespace), name).await
    }
}
