//! Kanso schema: the custom resources users submit, the Operation signal object
//! shared with the engine agent, and spec validation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use kanso_core::ResourceKind;

pub mod validate;

pub const GROUP: &str = "managed-gitops.kanso.dev";
pub const VERSION: &str = "v1alpha1";

/// Condition type raised while the last reconciliation ended in a permanent error.
pub const CONDITION_ERROR_OCCURRED: &str = "ErrorOccurred";
/// Condition type on a ManagedEnvironment once its credential artifact exists.
pub const CONDITION_CONNECTION_READY: &str = "ConnectionInitializationSucceeded";
/// Secret key carrying the kubeconfig of a managed environment.
pub const KUBECONFIG_KEY: &str = "kubeconfig";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False"
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

// ---- GitOpsDeployment ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub target_revision: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    /// Name of a GitOpsDeploymentManagedEnvironment in the same namespace; empty targets the local cluster.
    #[serde(default)]
    pub environment: String,
    /// Target namespace; defaults to the namespace of the GitOpsDeployment.
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeploymentType {
    Automated,
    #[default]
    Manual,
}

impl DeploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::Automated => "Automated",
            DeploymentType::Manual => "Manual",
        }
    }
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "managed-gitops.kanso.dev",
    version = "v1alpha1",
    kind = "GitOpsDeployment",
    plural = "gitopsdeployments",
    shortname = "gd",
    namespaced,
    status = "GitOpsDeploymentStatus",
    printcolumn = r#"{"name":"Sync", "type":"string", "jsonPath":".status.sync.status"}"#,
    printcolumn = r#"{"name":"Health", "type":"string", "jsonPath":".status.health.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsDeploymentSpec {
    pub source: ApplicationSource,
    #[serde(default)]
    pub destination: ApplicationDestination,
    #[serde(rename = "type", default)]
    pub type_: DeploymentType,
    /// Requests a sync even for `Manual` deployments.
    #[serde(default)]
    pub sync_requested: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SyncStatusCode {
    Synced,
    OutOfSync,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum HealthStatusCode {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    #[default]
    Unknown,
}

impl HealthStatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatusCode::Healthy => "Healthy",
            HealthStatusCode::Progressing => "Progressing",
            HealthStatusCode::Degraded => "Degraded",
            HealthStatusCode::Suspended => "Suspended",
            HealthStatusCode::Missing => "Missing",
            HealthStatusCode::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Healthy" => HealthStatusCode::Healthy,
            "Progressing" => HealthStatusCode::Progressing,
            "Degraded" => HealthStatusCode::Degraded,
            "Suspended" => HealthStatusCode::Suspended,
            "Missing" => HealthStatusCode::Missing,
            _ => HealthStatusCode::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SyncStatus {
    pub status: SyncStatusCode,
    #[serde(default)]
    pub revision: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HealthStatus {
    pub status: HealthStatusCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Summary of one resource the engine manages for a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceStatus {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsDeploymentStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub sync: SyncStatus,
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub resources: Vec<ResourceStatus>,
    #[serde(rename = "operationID", default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

// ---- ManagedEnvironment ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "managed-gitops.kanso.dev",
    version = "v1alpha1",
    kind = "GitOpsDeploymentManagedEnvironment",
    plural = "gitopsdeploymentmanagedenvironments",
    shortname = "gdme",
    namespaced,
    status = "ConditionsStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsDeploymentManagedEnvironmentSpec {
    #[serde(rename = "apiURL")]
    pub api_url: String,
    /// Secret in the same namespace holding the `kubeconfig` key.
    pub credentials_secret: String,
}

/// Status shape shared by kinds that only report conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConditionsStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// ---- RepositoryCredential ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "managed-gitops.kanso.dev",
    version = "v1alpha1",
    kind = "GitOpsDeploymentRepositoryCredential",
    plural = "gitopsdeploymentrepositorycredentials",
    shortname = "gdrc",
    namespaced,
    status = "ConditionsStatus"
)]
pub struct GitOpsDeploymentRepositoryCredentialSpec {
    pub repository: String,
    pub secret: String,
}

// ---- SyncRun ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "managed-gitops.kanso.dev",
    version = "v1alpha1",
    kind = "GitOpsDeploymentSyncRun",
    plural = "gitopsdeploymentsyncruns",
    shortname = "gdsr",
    namespaced,
    status = "GitOpsDeploymentSyncRunStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsDeploymentSyncRunSpec {
    pub gitops_deployment_name: String,
    #[serde(rename = "revisionID", default)]
    pub revision_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GitOpsDeploymentSyncRunStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub phase: String,
}

// ---- Operation (engine boundary) ----

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum OperationState {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "Pending",
            OperationState::InProgress => "InProgress",
            OperationState::Completed => "Completed",
            OperationState::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(OperationState::Pending),
            "InProgress" => Some(OperationState::InProgress),
            "Completed" => Some(OperationState::Completed),
            "Failed" => Some(OperationState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Completed | OperationState::Failed)
    }
}

/// Only the worker writes spec; only the agent writes status.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "managed-gitops.kanso.dev",
    version = "v1alpha1",
    kind = "Operation",
    plural = "operations",
    namespaced,
    status = "OperationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    #[serde(rename = "operationID")]
    pub operation_id: String,
    pub resource_type: String,
    #[serde(rename = "resourceID")]
    pub resource_id: String,
    pub generation: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OperationStatus {
    #[serde(default)]
    pub state: OperationState,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
    #[serde(default)]
    pub resources: Vec<ResourceStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
}

/// All CRDs served by the control plane, for `kansoctl crds`.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        GitOpsDeployment::crd(),
        GitOpsDeploymentManagedEnvironment::crd(),
        GitOpsDeploymentRepositoryCredential::crd(),
        GitOpsDeploymentSyncRun::crd(),
        Operation::crd(),
    ]
}

pub fn crds_yaml() -> Result<String, serde_yaml::Error> {
    let mut out = String::new();
    for crd in crds() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}

/// A fetched API object of any reconciled kind.
#[derive(Debug, Clone)]
pub enum ApiObject {
    Deployment(GitOpsDeployment),
    ManagedEnvironment(GitOpsDeploymentManagedEnvironment),
    RepositoryCredential(GitOpsDeploymentRepositoryCredential),
    SyncRun(GitOpsDeploymentSyncRun),
}

impl ApiObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ApiObject::Deployment(_) => ResourceKind::Deployment,
            ApiObject::ManagedEnvironment(_) => ResourceKind::ManagedEnvironment,
            ApiObject::RepositoryCredential(_) => ResourceKind::RepositoryCredential,
            ApiObject::SyncRun(_) => ResourceKind::SyncRun,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ApiObject::Deployment(o) => &o.metadata,
            ApiObject::ManagedEnvironment(o) => &o.metadata,
            ApiObject::RepositoryCredential(o) => &o.metadata,
            ApiObject::SyncRun(o) => &o.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ApiObject::Deployment(o) => &mut o.metadata,
            ApiObject::ManagedEnvironment(o) => &mut o.metadata,
            ApiObject::RepositoryCredential(o) => &mut o.metadata,
            ApiObject::SyncRun(o) => &mut o.metadata,
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.meta().uid.as_deref()
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    /// Object is being deleted (deletion timestamp set).
    pub fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

/// Builds namespaced metadata for tests and in-memory fixtures.
pub fn object_meta(namespace: &str, name: &str, uid: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(uid.to_string()),
        labels: Some(BTreeMap::new()),
        ..Default::default()
    }
}
