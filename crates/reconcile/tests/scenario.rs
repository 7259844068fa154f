use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tokio_util::sync::CancellationToken;

use kanso_core::{
    CanonicalEvent, ChangeKind, DbRelationType, EventSink, KansoError, KansoResult, ObjectRequest, ResourceKey,
    ResourceKind, SecretIndex, TenantResolver,
};
use kanso_dispatch::{Dispatcher, DispatcherConfig, Handler, KeyScope, Normalizer, Outcome};
use kanso_kubehub::{Cluster, MemCluster};
use kanso_ops::CredentialManager;
use kanso_persist::{DeploymentTarget, SqliteStore};
use kanso_reconcile::{Reconciler, ReconcilerConfig, StoreSecretIndex};
use kanso_schema::{
    object_meta, ApiObject, ApplicationDestination, ApplicationSource, Condition, DeploymentType, GitOpsDeployment,
    GitOpsDeploymentManagedEnvironment, GitOpsDeploymentManagedEnvironmentSpec, GitOpsDeploymentRepositoryCredential,
    GitOpsDeploymentRepositoryCredentialSpec, GitOpsDeploymentSpec, GitOpsDeploymentStatus, GitOpsDeploymentSyncRun,
    GitOpsDeploymentSyncRunSpec, HealthStatus, HealthStatusCode, Operation, OperationState, OperationStatus,
    ResourceStatus, SyncStatusCode,
};

const ENGINE: &str = "gitops-engine";
const TEAM_A: &str = "team-a";

struct Harness {
    store: Arc<SqliteStore>,
    cluster: Arc<MemCluster>,
    rec: Arc<Reconciler>,
}

fn harness() -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cluster = Arc::new(MemCluster::new());
    cluster.add_namespace(TEAM_A).unwrap();
    cluster.add_namespace("team-b").unwrap();
    let rec = Arc::new(Reconciler::new(store.clone(), cluster.clone(), config()));
    Harness { store, cluster, rec }
}

fn config() -> ReconcilerConfig {
    ReconcilerConfig {
        engine_namespace: ENGINE.into(),
        op_timeout: Duration::from_millis(40),
        op_poll: Duration::from_millis(5),
        refresh_delay: Duration::from_millis(10),
    }
}

/// Fails the next `fail_applies` secret writes with a transient error.
struct Flaky {
    inner: Arc<MemCluster>,
    fail_applies: AtomicUsize,
}

#[async_trait]
impl Cluster for Flaky {
    async fn get(&self, key: &ResourceKey) -> KansoResult<Option<ApiObject>> {
        self.inner.get(key).await
    }
    async fn patch_status(&self, key: &ResourceKey, status: serde_json::Value) -> KansoResult<bool> {
        self.inner.patch_status(key, status).await
    }
    async fn get_secret(&self, namespace: &str, name: &str) -> KansoResult<Option<Secret>> {
        self.inner.get_secret(namespace, name).await
    }
    async fn apply_secret(&self, namespace: &str, secret: Secret) -> KansoResult<()> {
        if self.fail_applies.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(KansoError::Transient("apiserver unavailable".into()));
        }
        self.inner.apply_secret(namespace, secret).await
    }
    async fn delete_secret(&self, namespace: &str, name: &str) -> KansoResult<bool> {
        self.inner.delete_secret(namespace, name).await
    }
    async fn create_operation(&self, namespace: &str, op: Operation) -> KansoResult<()> {
        self.inner.create_operation(namespace, op).await
    }
    async fn get_operation(&self, namespace: &str, name: &str) -> KansoResult<Option<Operation>> {
        self.inner.get_operation(namespace, name).await
    }
    async fn delete_operation(&self, namespace: &str, name: &str) -> KansoResult<bool> {
        self.inner.delete_operation(namespace, name).await
    }
}

fn meta(ns: &str, name: &str) -> ObjectMeta {
    let mut m = object_meta(ns, name, "");
    m.uid = None;
    m
}

fn deployment(ns: &str, name: &str, dest_ns: &str, environment: &str, type_: DeploymentType) -> ApiObject {
    let mut d = GitOpsDeployment::new(
        name,
        GitOpsDeploymentSpec {
            source: ApplicationSource {
                repo_url: "https://github.com/acme/app".into(),
                path: "overlays/dev".into(),
                target_revision: "main".into(),
            },
            destination: ApplicationDestination { environment: environment.into(), namespace: dest_ns.into() },
            type_,
            sync_requested: false,
        },
    );
    d.metadata = meta(ns, name);
    ApiObject::Deployment(d)
}

fn environment(ns: &str, name: &str, api_url: &str, secret: &str) -> ApiObject {
    let mut e = GitOpsDeploymentManagedEnvironment::new(
        name,
        GitOpsDeploymentManagedEnvironmentSpec { api_url: api_url.into(), credentials_secret: secret.into() },
    );
    e.metadata = meta(ns, name);
    ApiObject::ManagedEnvironment(e)
}

fn secret(name: &str, pairs: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
        data: Some(pairs.iter().map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec()))).collect::<BTreeMap<_, _>>()),
        ..Default::default()
    }
}

fn key(kind: ResourceKind, ns: &str, name: &str) -> ResourceKey {
    ResourceKey::new(kind, ns, name)
}

impl Harness {
    async fn handle(&self, kind: ResourceKind, ns: &str, name: &str, change: ChangeKind) -> Outcome {
        let tenant = self.cluster.tenant_key(ns).unwrap();
        let ev = CanonicalEvent::new(kind, &ObjectRequest::new(ns, name), tenant, change);
        self.rec.handle(&ev, &KeyScope::detached()).await.unwrap()
    }

    fn deployment(&self, ns: &str, name: &str) -> GitOpsDeployment {
        match self.cluster.object(&key(ResourceKind::Deployment, ns, name)).unwrap() {
            Some(ApiObject::Deployment(d)) => d,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn deployment_status(&self, ns: &str, name: &str) -> GitOpsDeploymentStatus {
        self.deployment(ns, name).status.expect("status written")
    }

    fn conditions(&self, kind: ResourceKind, ns: &str, name: &str) -> Vec<Condition> {
        match self.cluster.object(&key(kind, ns, name)).unwrap() {
            Some(ApiObject::Deployment(o)) => o.status.map(|s| s.conditions),
            Some(ApiObject::ManagedEnvironment(o)) => o.status.map(|s| s.conditions),
            Some(ApiObject::RepositoryCredential(o)) => o.status.map(|s| s.conditions),
            Some(ApiObject::SyncRun(o)) => o.status.map(|s| s.conditions),
            None => None,
        }
        .unwrap_or_default()
    }

    fn condition(&self, kind: ResourceKind, ns: &str, name: &str, type_: &str) -> Condition {
        self.conditions(kind, ns, name).into_iter().find(|c| c.type_ == type_).expect("condition present")
    }

    fn entity_id(&self, kind: ResourceKind, ns: &str, name: &str) -> String {
        let tenant = self.cluster.tenant_key(ns).unwrap();
        self.store.entity_id_by_name(kind, &tenant, ns, name).unwrap().expect("mapped")
    }

    fn edit_deployment(&self, ns: &str, name: &str, f: impl FnOnce(&mut GitOpsDeploymentSpec)) {
        let mut d = self.deployment(ns, name);
        f(&mut d.spec);
        self.cluster.put(ApiObject::Deployment(d)).unwrap();
    }

    fn only_operation_name(&self) -> String {
        let ops = self.cluster.operations(ENGINE).unwrap();
        assert_eq!(ops.len(), 1, "expected exactly one operation");
        ops[0].metadata.name.clone().unwrap()
    }
}

#[tokio::test]
async fn sync_request_dispatches_one_operation_and_reports_completion() {
    let t = harness();
    let dep_key = key(ResourceKind::Deployment, TEAM_A, "a");
    t.cluster.put(deployment(TEAM_A, "a", "x", "", DeploymentType::Manual)).unwrap();

    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "a", ChangeKind::Created).await, Outcome::Done);
    let mappings = t.store.list_mappings().unwrap();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].db_relation_type, DbRelationType::DeploymentTarget);
    let entity: DeploymentTarget = t.store.load(&mappings[0].db_relation_key).unwrap().unwrap();
    assert_eq!(entity.fields.target, "in-cluster/x");
    assert_eq!(entity.generation, 1);
    assert!(t.cluster.operations(ENGINE).unwrap().is_empty(), "no sync requested yet");

    t.edit_deployment(TEAM_A, "a", |s| s.sync_requested = true);
    let out = t.handle(ResourceKind::Deployment, TEAM_A, "a", ChangeKind::Modified).await;
    assert!(matches!(out, Outcome::Refresh(_)), "agent has not answered yet");
    let ops = t.cluster.operations(ENGINE).unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].spec.resource_id, entity.id);
    assert_eq!(ops[0].spec.generation, 2);
    assert_eq!(t.deployment_status(TEAM_A, "a").operation_id.as_deref(), Some(ops[0].spec.operation_id.as_str()));

    // the same observation again must not start a second operation
    let out = t.handle(ResourceKind::Deployment, TEAM_A, "a", ChangeKind::Modified).await;
    assert!(matches!(out, Outcome::Refresh(_)));
    assert_eq!(t.cluster.operations(ENGINE).unwrap().len(), 1);
    assert_eq!(t.store.operations_for(DbRelationType::DeploymentTarget, &entity.id).unwrap().len(), 1);

    let op_name = t.only_operation_name();
    t.cluster
        .set_operation_status(
            ENGINE,
            &op_name,
            OperationStatus {
                state: OperationState::Completed,
                message: String::new(),
                health: Some(HealthStatus { status: HealthStatusCode::Healthy, message: String::new() }),
                resources: vec![ResourceStatus {
                    kind: "Deployment".into(),
                    namespace: "x".into(),
                    name: "web".into(),
                    status: "Synced".into(),
                    ..Default::default()
                }],
                revision: "c0ffee".into(),
            },
        )
        .unwrap();
    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "a", ChangeKind::Modified).await, Outcome::Done);
    let status = t.deployment_status(TEAM_A, "a");
    assert_eq!(status.sync.status, SyncStatusCode::Synced);
    assert_eq!(status.sync.revision, "c0ffee");
    assert_eq!(status.health.status, HealthStatusCode::Healthy);
    assert_eq!(status.resources.len(), 1);
    assert_eq!(status.resources[0].name, "web");
    assert!(status.operation_id.is_none());
    assert_eq!(t.condition(ResourceKind::Deployment, TEAM_A, "a", "ErrorOccurred").status, "False");
    assert!(t.cluster.operations(ENGINE).unwrap().is_empty(), "signal object collected");
    assert!(t.store.operations_for(DbRelationType::DeploymentTarget, &entity.id).unwrap().is_empty());

    t.cluster.remove(&dep_key).unwrap();
    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "a", ChangeKind::Deleted).await, Outcome::Done);
    assert!(t.store.list_mappings().unwrap().is_empty());
    assert!(t.store.gc_pending().unwrap().is_empty());
    assert!(t.store.load::<DeploymentTarget>(&entity.id).unwrap().is_none());
}

#[tokio::test]
async fn replayed_created_is_idempotent() {
    let t = harness();
    t.cluster.put(deployment(TEAM_A, "web", "", "", DeploymentType::Manual)).unwrap();
    t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Created).await;
    let first = t.store.list_mappings().unwrap();
    t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Created).await;
    let second = t.store.list_mappings().unwrap();
    assert_eq!(first, second);
    assert_eq!(second.len(), 1);
    let entity: DeploymentTarget = t.store.load(&second[0].db_relation_key).unwrap().unwrap();
    assert_eq!(entity.version, 1, "nothing rewritten");
    assert_eq!(entity.fields.target, "in-cluster/team-a");
}

#[tokio::test]
async fn racing_claims_on_one_target_leave_one_winner() {
    let t = harness();
    t.cluster.put(deployment(TEAM_A, "a", "shared", "", DeploymentType::Manual)).unwrap();
    t.cluster.put(deployment("team-b", "b", "shared", "", DeploymentType::Manual)).unwrap();

    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "a", ChangeKind::Created).await, Outcome::Done);
    assert_eq!(t.handle(ResourceKind::Deployment, "team-b", "b", ChangeKind::Created).await, Outcome::Done);

    let mappings = t.store.list_mappings().unwrap();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].namespace, TEAM_A);
    let lost = t.condition(ResourceKind::Deployment, "team-b", "b", "ErrorOccurred");
    assert_eq!(lost.status, "True");
    assert_eq!(lost.reason, "UniqueViolation");
    assert_eq!(t.condition(ResourceKind::Deployment, TEAM_A, "a", "ErrorOccurred").status, "False");
}

#[tokio::test]
async fn failed_operation_is_surfaced_and_not_retried() {
    let t = harness();
    t.cluster.put(deployment(TEAM_A, "web", "", "", DeploymentType::Automated)).unwrap();
    let out = t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Created).await;
    assert!(matches!(out, Outcome::Refresh(_)));
    assert_eq!(t.cluster.finish_operations(ENGINE, OperationState::Failed, "repository unreachable").unwrap(), 1);

    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Modified).await, Outcome::Done);
    let cond = t.condition(ResourceKind::Deployment, TEAM_A, "web", "ErrorOccurred");
    assert_eq!((cond.status.as_str(), cond.reason.as_str()), ("True", "OperationFailed"));
    assert_eq!(cond.message, "repository unreachable");
    assert_eq!(t.deployment_status(TEAM_A, "web").sync.status, SyncStatusCode::OutOfSync);

    // another pass without a spec change keeps the failure and dispatches nothing
    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Modified).await, Outcome::Done);
    assert!(t.cluster.operations(ENGINE).unwrap().is_empty());
    assert_eq!(t.condition(ResourceKind::Deployment, TEAM_A, "web", "ErrorOccurred").status, "True");

    // a spec change re-triggers
    t.edit_deployment(TEAM_A, "web", |s| s.source.path = "overlays/prod".into());
    let out = t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Modified).await;
    assert!(matches!(out, Outcome::Refresh(_)));
    assert_eq!(t.cluster.operations(ENGINE).unwrap().len(), 1);
}

#[tokio::test]
async fn environment_round_trip_leaves_nothing_behind() {
    let t = harness();
    t.cluster.put_secret(TEAM_A, secret("prod-creds", &[("kubeconfig", "cfg-v1")])).unwrap();
    t.cluster.put(environment(TEAM_A, "prod", "https://10.0.0.1:6443", "prod-creds")).unwrap();

    assert_eq!(t.handle(ResourceKind::ManagedEnvironment, TEAM_A, "prod", ChangeKind::Created).await, Outcome::Done);
    let env_id = t.entity_id(ResourceKind::ManagedEnvironment, TEAM_A, "prod");
    let artifact = CredentialManager::artifact_name(&env_id);
    assert_eq!(t.cluster.secret_names(ENGINE).unwrap(), vec![artifact.clone()]);
    let ready = t.condition(ResourceKind::ManagedEnvironment, TEAM_A, "prod", "ConnectionInitializationSucceeded");
    assert_eq!(ready.status, "True");

    // a deployment targeting the environment claims "<env id>/<namespace>"
    t.cluster.put(deployment(TEAM_A, "web", "apps", "prod", DeploymentType::Automated)).unwrap();
    let out = t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Created).await;
    assert!(matches!(out, Outcome::Refresh(_)));
    let dep: DeploymentTarget = t.store.load(&t.entity_id(ResourceKind::Deployment, TEAM_A, "web")).unwrap().unwrap();
    assert_eq!(dep.fields.target, format!("{env_id}/apps"));
    t.cluster.finish_operations(ENGINE, OperationState::Completed, "").unwrap();
    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Modified).await, Outcome::Done);

    // update: new API URL regenerates the artifact and hands the change to the engine
    let mut env = match t.cluster.object(&key(ResourceKind::ManagedEnvironment, TEAM_A, "prod")).unwrap() {
        Some(ApiObject::ManagedEnvironment(e)) => e,
        other => panic!("unexpected {other:?}"),
    };
    env.spec.api_url = "https://10.0.0.2:6443".into();
    t.cluster.put(ApiObject::ManagedEnvironment(env)).unwrap();
    let out = t.handle(ResourceKind::ManagedEnvironment, TEAM_A, "prod", ChangeKind::Modified).await;
    assert!(matches!(out, Outcome::Refresh(_)));
    let regenerated = t.cluster.secret(ENGINE, &artifact).unwrap().unwrap();
    assert_eq!(regenerated.data.unwrap()["server"].0, b"https://10.0.0.2:6443");
    assert_eq!(t.cluster.operations(ENGINE).unwrap()[0].spec.resource_type, "ManagedEnvironment");

    t.cluster.remove(&key(ResourceKind::ManagedEnvironment, TEAM_A, "prod")).unwrap();
    assert_eq!(t.handle(ResourceKind::ManagedEnvironment, TEAM_A, "prod", ChangeKind::Deleted).await, Outcome::Done);
    t.cluster.remove(&key(ResourceKind::Deployment, TEAM_A, "web")).unwrap();
    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Deleted).await, Outcome::Done);

    assert!(t.store.list_mappings().unwrap().is_empty());
    assert!(t.cluster.secret_names(ENGINE).unwrap().is_empty(), "no orphaned artifacts");
    assert!(t.cluster.operations(ENGINE).unwrap().is_empty());
    assert!(t.store.gc_pending().unwrap().is_empty());
}

#[tokio::test]
async fn deleting_environment_tolerates_a_manually_removed_artifact() {
    let t = harness();
    t.cluster.put_secret(TEAM_A, secret("prod-creds", &[("kubeconfig", "cfg")])).unwrap();
    t.cluster.put(environment(TEAM_A, "prod", "https://10.0.0.1:6443", "prod-creds")).unwrap();
    t.handle(ResourceKind::ManagedEnvironment, TEAM_A, "prod", ChangeKind::Created).await;
    let env_id = t.entity_id(ResourceKind::ManagedEnvironment, TEAM_A, "prod");
    let artifact = CredentialManager::artifact_name(&env_id);

    // a live environment gets its artifact back
    assert!(t.cluster.remove_secret(ENGINE, &artifact).unwrap());
    t.handle(ResourceKind::ManagedEnvironment, TEAM_A, "prod", ChangeKind::Modified).await;
    assert!(t.cluster.secret(ENGINE, &artifact).unwrap().is_some());

    assert!(t.cluster.remove_secret(ENGINE, &artifact).unwrap());
    t.cluster.remove(&key(ResourceKind::ManagedEnvironment, TEAM_A, "prod")).unwrap();
    assert_eq!(t.handle(ResourceKind::ManagedEnvironment, TEAM_A, "prod", ChangeKind::Deleted).await, Outcome::Done);
    assert!(t.store.list_mappings().unwrap().is_empty());
    assert!(t.cluster.secret_names(ENGINE).unwrap().is_empty());
    // and a second delete is a no-op
    assert_eq!(t.handle(ResourceKind::ManagedEnvironment, TEAM_A, "prod", ChangeKind::Deleted).await, Outcome::Done);
}

#[tokio::test]
async fn deleting_the_source_secret_removes_the_artifact() {
    let t = harness();
    t.cluster.put_secret(TEAM_A, secret("prod-creds", &[("kubeconfig", "cfg")])).unwrap();
    t.cluster.put(environment(TEAM_A, "prod", "https://10.0.0.1:6443", "prod-creds")).unwrap();
    t.handle(ResourceKind::ManagedEnvironment, TEAM_A, "prod", ChangeKind::Created).await;
    let env_id = t.entity_id(ResourceKind::ManagedEnvironment, TEAM_A, "prod");
    let artifact = CredentialManager::artifact_name(&env_id);

    let index = StoreSecretIndex::new(t.store.clone());
    assert_eq!(
        index.referencing(TEAM_A, "prod-creds").unwrap(),
        vec![key(ResourceKind::ManagedEnvironment, TEAM_A, "prod")]
    );

    assert!(t.cluster.remove_secret(TEAM_A, "prod-creds").unwrap());
    assert_eq!(t.handle(ResourceKind::ManagedEnvironment, TEAM_A, "prod", ChangeKind::Modified).await, Outcome::Done);
    assert!(t.cluster.secret(ENGINE, &artifact).unwrap().is_none());
    let err = t.condition(ResourceKind::ManagedEnvironment, TEAM_A, "prod", "ErrorOccurred");
    assert_eq!((err.status.as_str(), err.reason.as_str()), ("True", "MissingReference"));
    let ready = t.condition(ResourceKind::ManagedEnvironment, TEAM_A, "prod", "ConnectionInitializationSucceeded");
    assert_eq!(ready.status, "False");
    assert_eq!(t.store.list_mappings().unwrap().len(), 1, "the registration itself stays");

    // restoring the secret restores the artifact
    t.cluster.put_secret(TEAM_A, secret("prod-creds", &[("kubeconfig", "cfg-rotated")])).unwrap();
    let _ = t.handle(ResourceKind::ManagedEnvironment, TEAM_A, "prod", ChangeKind::Modified).await;
    let restored = t.cluster.secret(ENGINE, &artifact).unwrap().unwrap();
    assert_eq!(restored.data.unwrap()["config"].0, b"cfg-rotated");
    assert_eq!(t.condition(ResourceKind::ManagedEnvironment, TEAM_A, "prod", "ErrorOccurred").status, "False");
}

#[tokio::test]
async fn recreated_object_retires_its_predecessor() {
    let t = harness();
    let dep_key = key(ResourceKind::Deployment, TEAM_A, "web");
    t.cluster.put(deployment(TEAM_A, "web", "x", "", DeploymentType::Manual)).unwrap();
    t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Created).await;
    let old = t.store.list_mappings().unwrap().remove(0);

    // delete and recreate under the same name; the delete notification was never seen
    t.cluster.remove(&dep_key).unwrap();
    let new_uid = t.cluster.put(deployment(TEAM_A, "web", "x", "", DeploymentType::Manual)).unwrap();
    assert_ne!(new_uid, old.api_resource_uid);
    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Modified).await, Outcome::Done);

    let now = t.store.list_mappings().unwrap();
    assert_eq!(now.len(), 1);
    assert_eq!(now[0].api_resource_uid, new_uid);
    assert_ne!(now[0].db_relation_key, old.db_relation_key);
    assert!(t.store.load::<DeploymentTarget>(&old.db_relation_key).unwrap().is_none());

    // a late delete for the old object leaves the new one alone
    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Deleted).await, Outcome::Done);
    assert_eq!(t.store.list_mappings().unwrap(), now);
}

#[tokio::test]
async fn terminating_object_is_treated_as_deleted() {
    let t = harness();
    let dep_key = key(ResourceKind::Deployment, TEAM_A, "web");
    t.cluster.put(deployment(TEAM_A, "web", "", "", DeploymentType::Manual)).unwrap();
    t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Created).await;
    t.cluster.mark_terminating(&dep_key).unwrap();
    t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Modified).await;
    assert!(t.store.list_mappings().unwrap().is_empty());
}

#[tokio::test]
async fn sweeper_finishes_interrupted_deletes() {
    let t = harness();
    t.cluster.put_secret(TEAM_A, secret("prod-creds", &[("kubeconfig", "cfg")])).unwrap();
    t.cluster.put(environment(TEAM_A, "prod", "https://10.0.0.1:6443", "prod-creds")).unwrap();
    t.handle(ResourceKind::ManagedEnvironment, TEAM_A, "prod", ChangeKind::Created).await;
    let mapping = t.store.list_mappings().unwrap().remove(0);

    // crash right after the mapping was retired
    assert!(t.store.retire_mapping(&mapping).unwrap());
    assert_eq!(t.cluster.secret_names(ENGINE).unwrap().len(), 1);

    assert_eq!(t.rec.sweep().await.unwrap(), 1);
    assert!(t.cluster.secret_names(ENGINE).unwrap().is_empty());
    assert!(t.store.gc_pending().unwrap().is_empty());
    assert_eq!(t.rec.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn sync_run_drives_its_own_operation() {
    let t = harness();
    t.cluster.put(deployment(TEAM_A, "web", "", "", DeploymentType::Manual)).unwrap();
    t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Created).await;

    let mut run = GitOpsDeploymentSyncRun::new(
        "run-1",
        GitOpsDeploymentSyncRunSpec { gitops_deployment_name: "web".into(), revision_id: "abc123".into() },
    );
    run.metadata = meta(TEAM_A, "run-1");
    t.cluster.put(ApiObject::SyncRun(run)).unwrap();
    let out = t.handle(ResourceKind::SyncRun, TEAM_A, "run-1", ChangeKind::Created).await;
    assert!(matches!(out, Outcome::Refresh(_)));
    let ops = t.cluster.operations(ENGINE).unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].spec.resource_type, "SyncRun");

    t.cluster.finish_operations(ENGINE, OperationState::Completed, "").unwrap();
    assert_eq!(t.handle(ResourceKind::SyncRun, TEAM_A, "run-1", ChangeKind::Modified).await, Outcome::Done);
    match t.cluster.object(&key(ResourceKind::SyncRun, TEAM_A, "run-1")).unwrap() {
        Some(ApiObject::SyncRun(r)) => assert_eq!(r.status.unwrap().phase, "Succeeded"),
        other => panic!("unexpected {other:?}"),
    }

    let mut orphan = GitOpsDeploymentSyncRun::new(
        "run-2",
        GitOpsDeploymentSyncRunSpec { gitops_deployment_name: "missing".into(), revision_id: String::new() },
    );
    orphan.metadata = meta(TEAM_A, "run-2");
    t.cluster.put(ApiObject::SyncRun(orphan)).unwrap();
    assert_eq!(t.handle(ResourceKind::SyncRun, TEAM_A, "run-2", ChangeKind::Created).await, Outcome::Done);
    assert_eq!(t.condition(ResourceKind::SyncRun, TEAM_A, "run-2", "ErrorOccurred").reason, "MissingReference");
}

#[tokio::test]
async fn repository_credentials_are_unique_per_tenant_and_repository() {
    let t = harness();
    t.cluster.put_secret(TEAM_A, secret("git-creds", &[("username", "bot"), ("password", "s3cret")])).unwrap();
    for name in ["creds-1", "creds-2"] {
        let mut rc = GitOpsDeploymentRepositoryCredential::new(
            name,
            GitOpsDeploymentRepositoryCredentialSpec {
                repository: "https://github.com/acme/app".into(),
                secret: "git-creds".into(),
            },
        );
        rc.metadata = meta(TEAM_A, name);
        t.cluster.put(ApiObject::RepositoryCredential(rc)).unwrap();
    }

    let out = t.handle(ResourceKind::RepositoryCredential, TEAM_A, "creds-1", ChangeKind::Created).await;
    assert!(matches!(out, Outcome::Refresh(_)));
    assert_eq!(t.cluster.operations(ENGINE).unwrap()[0].spec.resource_type, "RepositoryCredential");

    assert_eq!(t.handle(ResourceKind::RepositoryCredential, TEAM_A, "creds-2", ChangeKind::Created).await, Outcome::Done);
    assert_eq!(t.condition(ResourceKind::RepositoryCredential, TEAM_A, "creds-2", "ErrorOccurred").reason, "UniqueViolation");
    assert_eq!(t.store.list_mappings().unwrap().len(), 1);
}

#[tokio::test]
async fn end_to_end_through_the_dispatcher() {
    let t = harness();
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), t.rec.clone());
    let normalizer = Normalizer::new(t.cluster.clone(), dispatcher.clone());

    // plays the engine agent
    let stop = CancellationToken::new();
    let agent = {
        let cluster = t.cluster.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        let _ = cluster.finish_operations(ENGINE, OperationState::Completed, "synced");
                    }
                    _ = stop.cancelled() => break,
                }
            }
        })
    };

    t.cluster.put(deployment(TEAM_A, "web", "", "", DeploymentType::Automated)).unwrap();
    normalizer.receive(&ObjectRequest::new(TEAM_A, "web"), ResourceKind::Deployment, ChangeKind::Created).unwrap();
    tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_idle()).await.expect("dispatcher settles");
    assert_eq!(t.deployment_status(TEAM_A, "web").sync.status, SyncStatusCode::Synced);

    let err = normalizer
        .receive(&ObjectRequest::new("nowhere", "web"), ResourceKind::Deployment, ChangeKind::Created)
        .unwrap_err();
    assert!(matches!(err, KansoError::NamespaceNotFound(_)));

    stop.cancel();
    agent.await.unwrap();
    dispatcher.shutdown().await;
    assert!(dispatcher.dead_letters().is_empty());
}

#[tokio::test]
async fn rotation_interrupted_after_commit_is_still_handed_off() {
    let t = harness();
    let flaky = Arc::new(Flaky { inner: t.cluster.clone(), fail_applies: AtomicUsize::new(0) });
    let rec = Reconciler::new(t.store.clone(), flaky.clone(), config());
    let tenant = t.cluster.tenant_key(TEAM_A).unwrap();
    let ev = |change| CanonicalEvent::new(ResourceKind::ManagedEnvironment, &ObjectRequest::new(TEAM_A, "prod"), tenant.clone(), change);

    t.cluster.put_secret(TEAM_A, secret("prod-creds", &[("kubeconfig", "cfg-v1")])).unwrap();
    t.cluster.put(environment(TEAM_A, "prod", "https://10.0.0.1:6443", "prod-creds")).unwrap();
    assert_eq!(rec.handle(&ev(ChangeKind::Created), &KeyScope::detached()).await.unwrap(), Outcome::Done);
    assert!(t.cluster.operations(ENGINE).unwrap().is_empty(), "registration is not handed off");

    // the rotated material is committed, then the artifact write fails
    t.cluster.put_secret(TEAM_A, secret("prod-creds", &[("kubeconfig", "cfg-v2")])).unwrap();
    flaky.fail_applies.store(1, Ordering::SeqCst);
    let err = rec.handle(&ev(ChangeKind::Modified), &KeyScope::detached()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(t.cluster.operations(ENGINE).unwrap().is_empty());

    // the retry sees no spec change but still owes the engine this generation
    let out = rec.handle(&ev(ChangeKind::Modified), &KeyScope::detached()).await.unwrap();
    assert!(matches!(out, Outcome::Refresh(_)));
    let ops = t.cluster.operations(ENGINE).unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].spec.resource_type, "ManagedEnvironment");
    let artifact = CredentialManager::artifact_name(&t.entity_id(ResourceKind::ManagedEnvironment, TEAM_A, "prod"));
    assert_eq!(t.cluster.secret(ENGINE, &artifact).unwrap().unwrap().data.unwrap()["config"].0, b"cfg-v2");

    // and once handed off, further passes dispatch nothing new
    t.cluster.finish_operations(ENGINE, OperationState::Completed, "").unwrap();
    assert_eq!(rec.handle(&ev(ChangeKind::Modified), &KeyScope::detached()).await.unwrap(), Outcome::Done);
    assert_eq!(rec.handle(&ev(ChangeKind::Modified), &KeyScope::detached()).await.unwrap(), Outcome::Done);
    assert!(t.cluster.operations(ENGINE).unwrap().is_empty());
}

#[tokio::test]
async fn completed_sync_run_clears_the_deployment_failure() {
    let t = harness();
    t.cluster.put(deployment(TEAM_A, "web", "", "", DeploymentType::Automated)).unwrap();
    t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Created).await;
    t.cluster.finish_operations(ENGINE, OperationState::Failed, "repository unreachable").unwrap();
    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Modified).await, Outcome::Done);
    assert_eq!(t.condition(ResourceKind::Deployment, TEAM_A, "web", "ErrorOccurred").status, "True");
    assert_eq!(t.deployment_status(TEAM_A, "web").sync.status, SyncStatusCode::OutOfSync);

    let mut run = GitOpsDeploymentSyncRun::new(
        "retry",
        GitOpsDeploymentSyncRunSpec { gitops_deployment_name: "web".into(), revision_id: "abc123".into() },
    );
    run.metadata = meta(TEAM_A, "retry");
    t.cluster.put(ApiObject::SyncRun(run)).unwrap();
    t.handle(ResourceKind::SyncRun, TEAM_A, "retry", ChangeKind::Created).await;
    let op = t.only_operation_name();
    let done = OperationStatus { state: OperationState::Completed, revision: "abc123".into(), ..Default::default() };
    assert!(t.cluster.set_operation_status(ENGINE, &op, done).unwrap());
    assert_eq!(t.handle(ResourceKind::SyncRun, TEAM_A, "retry", ChangeKind::Modified).await, Outcome::Done);

    // written straight away, without an event for the deployment
    let status = t.deployment_status(TEAM_A, "web");
    assert_eq!(status.sync.status, SyncStatusCode::Synced);
    assert_eq!(status.sync.revision, "abc123");
    assert_eq!(t.condition(ResourceKind::Deployment, TEAM_A, "web", "ErrorOccurred").status, "False");

    // the deployment's own next pass agrees and dispatches nothing
    assert_eq!(t.handle(ResourceKind::Deployment, TEAM_A, "web", ChangeKind::Modified).await, Outcome::Done);
    assert_eq!(t.deployment_status(TEAM_A, "web").sync.status, SyncStatusCode::Synced);
    assert!(t.cluster.operations(ENGINE).unwrap().is_empty());
}
