//! Kanso reconcile: the per-key worker. One event runs through
//! resolve mapping, create/update/delete the entity, optional operation
//! hand-off, and status write-back.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use kanso_core::{CanonicalEvent, ChangeKind, DbRelationType, ErrorClass, KansoError, KansoResult, ResourceKey, Settings};
use kanso_dispatch::{Handler, KeyScope, Outcome};
use kanso_kubehub::Cluster;
use kanso_ops::{CredentialManager, OperationDispatcher, OperationWait};
use kanso_persist::{EntityMapping, NewMapping, SqliteStore};
use kanso_schema::{ApiObject, Condition};

mod deployment;
mod environment;
mod gc;
mod index;
mod repocred;
mod rows;
mod status;
mod syncrun;

pub use gc::spawn_sweeper;
pub use index::StoreSecretIndex;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub engine_namespace: String,
    /// Bound on one wait for an operation before a status refresh is re-queued.
    pub op_timeout: Duration,
    pub op_poll: Duration,
    pub refresh_delay: Duration,
}

impl ReconcilerConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            engine_namespace: s.engine_namespace.clone(),
            op_timeout: s.op_timeout(),
            op_poll: s.op_poll(),
            refresh_delay: s.refresh_delay(),
        }
    }
}

/// What one pass over a live object wants written back.
#[derive(Debug, Default)]
pub(crate) struct Report {
    pub(crate) status: Map<String, Value>,
    /// Conditions to upsert; `None` leaves the current ones alone.
    pub(crate) conditions: Option<Vec<Condition>>,
    /// An operation was still open when the bounded wait ended.
    pub(crate) waiting: bool,
}

pub struct Reconciler {
    store: Arc<SqliteStore>,
    cluster: Arc<dyn Cluster>,
    ops: OperationDispatcher,
    creds: CredentialManager,
    cfg: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<SqliteStore>, cluster: Arc<dyn Cluster>, cfg: ReconcilerConfig) -> Self {
        let ops = OperationDispatcher::new(store.clone(), cluster.clone(), cfg.engine_namespace.clone(), cfg.op_poll);
        let creds = CredentialManager::new(cluster.clone(), cfg.engine_namespace.clone());
        Self { store, cluster, ops, creds, cfg }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn operations(&self) -> &OperationDispatcher {
        &self.ops
    }

    fn new_mapping(ev: &CanonicalEvent, uid: &str) -> NewMapping {
        NewMapping {
            kind: ev.kind,
            uid: uid.to_string(),
            namespace: ev.namespace.clone(),
            name: ev.name.clone(),
            tenant_key: ev.tenant_key.clone(),
        }
    }

    /// Removes every mapping under the event's key except the one for `keep_uid`,
    /// finishing each entity's cleanup in this pass. Safe to repeat.
    async fn delete_mapped(&self, ev: &CanonicalEvent, keep_uid: Option<&str>) -> KansoResult<usize> {
        let key = ev.key();
        let stale: Vec<EntityMapping> = self
            .store
            .mappings_for_key(&key, &ev.tenant_key)?
            .into_iter()
            .filter(|m| Some(m.api_resource_uid.as_str()) != keep_uid)
            .collect();
        for m in &stale {
            info!(key = %key, uid = %m.api_resource_uid, entity = %m.db_relation_key, "retiring mapping");
            self.delete_entity(m).await?;
        }
        Ok(stale.len())
    }

    /// Waits on the newest operation of an entity, dropping superseded ones.
    /// Returns `None` when the entity has no operation at all.
    async fn await_operations(
        &self,
        rel: DbRelationType,
        id: &str,
        scope: &KeyScope,
    ) -> KansoResult<Option<(String, OperationWait)>> {
        let mut ops = self.store.operations_for(rel, id)?;
        let Some(newest) = ops.pop() else {
            return Ok(None);
        };
        for old in &ops {
            info!(op_id = %old.id, generation = old.generation, "operation superseded");
            self.ops.collect(&old.id).await?;
        }
        let wait = self.ops.await_terminal(&newest.id, self.cfg.op_timeout, scope.token()).await?;
        Ok(Some((newest.id, wait)))
    }

    async fn write_status(&self, key: &ResourceKey, obj: &ApiObject, report: Report) -> KansoResult<()> {
        let mut patch = report.status;
        if let Some(updates) = report.conditions {
            let merged = status::merge_conditions(&status::existing_conditions(obj), updates);
            patch.insert("conditions".into(), status::to_value(&merged));
        }
        if patch.is_empty() {
            return Ok(());
        }
        if !self.cluster.patch_status(key, Value::Object(patch)).await? {
            debug!(key = %key, "object gone before status write");
        }
        Ok(())
    }

    async fn reconcile_live(&self, ev: &CanonicalEvent, obj: ApiObject, scope: &KeyScope) -> KansoResult<Outcome> {
        let key = ev.key();
        let uid = obj
            .uid()
            .ok_or_else(|| KansoError::Fatal(format!("{key} has no uid")))?
            .to_string();
        self.delete_mapped(ev, Some(&uid)).await?;
        let mapping = self.store.get_mapping(ev.kind, &uid)?;
        let target = Self::new_mapping(ev, &uid);

        let result = match &obj {
            ApiObject::Deployment(d) => self.deployment(ev, d, mapping.as_ref(), &target, scope).await,
            ApiObject::ManagedEnvironment(e) => self.environment(ev, e, mapping.as_ref(), &target, scope).await,
            ApiObject::RepositoryCredential(r) => self.repository_credential(ev, r, mapping.as_ref(), &target, scope).await,
            ApiObject::SyncRun(s) => self.sync_run(ev, s, mapping.as_ref(), &target, scope).await,
        };
        let report = match result {
            Ok(r) => r,
            Err(e) if e.class() == ErrorClass::Permanent => {
                counter!("kanso_reconcile_permanent_failures_total", 1u64);
                warn!(key = %key, reason = e.reason(), error = %e, "reconciliation failed permanently");
                Report { conditions: Some(status::failure_conditions(ev.kind, &e)), ..Default::default() }
            }
            Err(e) => return Err(e),
        };
        let waiting = report.waiting;
        self.write_status(&key, &obj, report).await?;
        if waiting {
            debug!(key = %key, delay_ms = self.cfg.refresh_delay.as_millis() as u64, "operation still open; refresh queued");
            return Ok(Outcome::Refresh(self.cfg.refresh_delay));
        }
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Handler for Reconciler {
    async fn handle(&self, ev: &CanonicalEvent, scope: &KeyScope) -> KansoResult<Outcome> {
        let live = self.cluster.get(&ev.key()).await?.filter(|o| !o.is_terminating());
        match (ev.change, live) {
            // the object was recreated under the same name; only its predecessor goes
            (ChangeKind::Deleted, Some(obj)) => {
                self.delete_mapped(ev, obj.uid()).await?;
                Ok(Outcome::Done)
            }
            (_, None) => {
                if self.delete_mapped(ev, None).await? == 0 {
                    debug!(key = %ev.key(), "nothing mapped; delete is a no-op");
                }
                Ok(Outcome::Done)
            }
            (_, Some(obj)) => self.reconcile_live(ev, obj, scope).await,
        }
    }
}
