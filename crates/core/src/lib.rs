//! Kanso core types: canonical events, resource keys and the seams between
//! notifiers, the dispatcher and the reconciliation workers.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;

pub use config::Settings;
pub use error::{ErrorClass, KansoError, KansoResult};

pub mod prelude {
    pub use super::{
        CanonicalEvent, ChangeKind, DbRelationType, EventOrigin, EventSink, ObjectRequest, ResourceKey,
        ResourceKind, SecretIndex, TenantKey, TenantResolver,
    };
    pub use super::error::{ErrorClass, KansoError, KansoResult};
}

/// The closed set of API object kinds the control plane reconciles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Deployment,
    ManagedEnvironment,
    RepositoryCredential,
    SyncRun,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Deployment,
        ResourceKind::ManagedEnvironment,
        ResourceKind::RepositoryCredential,
        ResourceKind::SyncRun,
    ];

    /// Kubernetes kind name of the custom resource.
    pub fn api_kind(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "GitOpsDeployment",
            ResourceKind::ManagedEnvironment => "GitOpsDeploymentManagedEnvironment",
            ResourceKind::RepositoryCredential => "GitOpsDeploymentRepositoryCredential",
            ResourceKind::SyncRun => "GitOpsDeploymentSyncRun",
        }
    }

    /// Durable entity kind backing this API kind.
    pub fn relation(&self) -> DbRelationType {
        match self {
            ResourceKind::Deployment => DbRelationType::DeploymentTarget,
            ResourceKind::ManagedEnvironment => DbRelationType::ManagedEnvironment,
            ResourceKind::RepositoryCredential => DbRelationType::RepositoryCredential,
            ResourceKind::SyncRun => DbRelationType::SyncRun,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_kind())
    }
}

impl FromStr for ResourceKind {
    type Err = KansoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.api_kind() == s)
            .ok_or_else(|| KansoError::Fatal(format!("unknown resource kind: {s}")))
    }
}

/// Durable entity kinds (one table each).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DbRelationType {
    DeploymentTarget,
    ManagedEnvironment,
    RepositoryCredential,
    SyncRun,
}

impl DbRelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbRelationType::DeploymentTarget => "DeploymentTarget",
            DbRelationType::ManagedEnvironment => "ManagedEnvironment",
            DbRelationType::RepositoryCredential => "RepositoryCredential",
            DbRelationType::SyncRun => "SyncRun",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            DbRelationType::DeploymentTarget => "deployment_target",
            DbRelationType::ManagedEnvironment => "managed_environment",
            DbRelationType::RepositoryCredential => "repository_credential",
            DbRelationType::SyncRun => "sync_run",
        }
    }
}

impl fmt::Display for DbRelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbRelationType {
    type Err = KansoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DeploymentTarget" => Ok(DbRelationType::DeploymentTarget),
            "ManagedEnvironment" => Ok(DbRelationType::ManagedEnvironment),
            "RepositoryCredential" => Ok(DbRelationType::RepositoryCredential),
            "SyncRun" => Ok(DbRelationType::SyncRun),
            other => Err(KansoError::Fatal(format!("unknown relation type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Why an event sits in a key queue. Notifier events come from the outside;
/// refresh events are re-queued by a worker whose operation wait timed out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventOrigin {
    Notifier,
    StatusRefresh,
}

/// Immutable identity of the owning namespace (its UID, never its name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantKey(pub String);

impl TenantKey {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialization unit: all events for one key run on one worker, in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Raw notification payload: which object changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectRequest {
    pub namespace: String,
    pub name: String,
}

impl ObjectRequest {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub tenant_key: TenantKey,
    pub change: ChangeKind,
    pub received_at: DateTime<Utc>,
    pub origin: EventOrigin,
    /// Number of failed attempts so far (0 for a fresh event).
    pub attempt: u32,
}

impl CanonicalEvent {
    pub fn new(kind: ResourceKind, req: &ObjectRequest, tenant_key: TenantKey, change: ChangeKind) -> Self {
        Self {
            kind,
            namespace: req.namespace.clone(),
            name: req.name.clone(),
            tenant_key,
            change,
            received_at: Utc::now(),
            origin: EventOrigin::Notifier,
            attempt: 0,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind, self.namespace.clone(), self.name.clone())
    }

    /// Follow-up event that only refreshes status from an in-flight operation.
    pub fn refresh(&self) -> Self {
        Self {
            change: ChangeKind::Modified,
            received_at: Utc::now(),
            origin: EventOrigin::StatusRefresh,
            attempt: 0,
            ..self.clone()
        }
    }
}

/// Synchronous, cheap tenant lookup against a namespace name.
pub trait TenantResolver: Send + Sync {
    fn tenant_key(&self, namespace: &str) -> Option<TenantKey>;
}

/// Intake for raw change notifications. Must not block on downstream work.
pub trait EventSink: Send + Sync {
    fn receive(&self, req: &ObjectRequest, kind: ResourceKind, change: ChangeKind) -> KansoResult<()>;
}

/// Reverse lookup from a Secret to the API objects that reference it.
pub trait SecretIndex: Send + Sync {
    fn referencing(&self, namespace: &str, secret: &str) -> KansoResult<Vec<ResourceKey>>;
}
