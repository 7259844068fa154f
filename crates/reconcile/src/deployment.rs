//! GitOpsDeployment: the deployment target entity and its sync operations.

use tracing::{debug, info};

use kanso_core::{CanonicalEvent, DbRelationType, KansoError, KansoResult, ResourceKey, ResourceKind};
use kanso_dispatch::KeyScope;
use kanso_ops::OperationWait;
use kanso_persist::{new_id, DeploymentFields, DeploymentTarget, EntityMapping, NewMapping};
use kanso_schema::{validate, DeploymentType, GitOpsDeployment, OperationState, OperationStatus};

use crate::rows::{ensure_entity, load_entity, update_entity};
use crate::status::{self, REASON_OPERATION_FAILED};
use crate::{Reconciler, Report};

const REL: DbRelationType = DbRelationType::DeploymentTarget;
const IN_CLUSTER: &str = "in-cluster";

/// Folds a terminal operation into the row. Returns false when already applied.
fn record_outcome(row: &mut DeploymentTarget, generation: i64, state: OperationState, status: &OperationStatus, resources_json: &str) -> bool {
    let before = row.clone();
    row.synced_generation = row.synced_generation.max(generation);
    match state {
        OperationState::Failed => {
            row.last_failure = if status.message.is_empty() { "operation failed".to_string() } else { status.message.clone() };
        }
        _ => {
            row.last_failure.clear();
            if !status.revision.is_empty() {
                row.sync_revision = status.revision.clone();
            }
            if let Some(h) = &status.health {
                row.health = h.status.as_str().to_string();
                row.health_message = h.message.clone();
            }
            row.resources_json = resources_json.to_string();
        }
    }
    *row != before
}

fn resource_summary(status: &OperationStatus) -> KansoResult<String> {
    serde_json::to_string(&status.resources).map_err(|e| KansoError::Fatal(format!("resource summary: {e}")))
}

fn deployment_report(row: &DeploymentTarget, open_op: Option<&str>, waiting: bool) -> Report {
    let condition = if row.last_failure.is_empty() {
        status::no_error()
    } else {
        status::error_occurred(REASON_OPERATION_FAILED, row.last_failure.clone())
    };
    Report { status: status::deployment_status(row, open_op), conditions: Some(vec![condition]), waiting }
}

impl Reconciler {
    fn deployment_fields(&self, ev: &CanonicalEvent, obj: &GitOpsDeployment) -> KansoResult<DeploymentFields> {
        let spec = &obj.spec;
        let env_name = &spec.destination.environment;
        let env_id = if env_name.is_empty() {
            String::new()
        } else {
            self.store
                .entity_id_by_name(ResourceKind::ManagedEnvironment, &ev.tenant_key, &ev.namespace, env_name)?
                .ok_or_else(|| KansoError::missing(ResourceKind::ManagedEnvironment.api_kind(), env_name.as_str()))?
        };
        let dest_namespace =
            if spec.destination.namespace.is_empty() { ev.namespace.clone() } else { spec.destination.namespace.clone() };
        let claim = if env_id.is_empty() { IN_CLUSTER } else { env_id.as_str() };
        Ok(DeploymentFields {
            repo_url: spec.source.repo_url.clone(),
            path: spec.source.path.clone(),
            target_revision: spec.source.target_revision.clone(),
            target: format!("{claim}/{dest_namespace}"),
            dest_environment_id: env_id,
            dest_namespace,
            sync_mode: spec.type_.as_str().to_string(),
            sync_requested: spec.sync_requested,
        })
    }

    pub(crate) async fn deployment(
        &self,
        ev: &CanonicalEvent,
        obj: &GitOpsDeployment,
        mapping: Option<&EntityMapping>,
        target: &NewMapping,
        scope: &KeyScope,
    ) -> KansoResult<Report> {
        validate::deployment(&obj.spec)?;
        let fields = self.deployment_fields(ev, obj)?;

        let (id, created) = ensure_entity(&self.store, mapping, target, || DeploymentTarget {
            id: new_id(),
            tenant_key: ev.tenant_key.0.clone(),
            fields: fields.clone(),
            generation: 1,
            resources_json: "[]".into(),
            version: 1,
            ..Default::default()
        })?;
        let mut row = if created {
            load_entity::<DeploymentTarget>(&self.store, &id)?
        } else {
            let (row, changed) = update_entity(&self.store, &id, |row: &mut DeploymentTarget| {
                if row.fields == fields {
                    return false;
                }
                info!(entity = %row.id, changed = ?row.fields.changed_fields(&fields), "deployment spec changed");
                row.fields = fields.clone();
                row.generation += 1;
                row.last_failure.clear();
                true
            })?;
            if !changed {
                debug!(entity = %row.id, generation = row.generation, "deployment unchanged");
            }
            row
        };

        let wants_sync = row.fields.sync_mode == DeploymentType::Automated.as_str() || row.fields.sync_requested;
        if wants_sync && row.generation > row.synced_generation {
            self.ops.dispatch(REL, &row.id, row.generation).await?;
        }

        let mut open_op = None;
        let mut waiting = false;
        match self.await_operations(REL, &row.id, scope).await? {
            None => {}
            Some((op_id, OperationWait::Finished { record, status: outcome })) => {
                let resources_json = resource_summary(&outcome)?;
                row = update_entity(&self.store, &row.id, |r: &mut DeploymentTarget| {
                    record_outcome(r, record.generation, record.state, &outcome, &resources_json)
                })?
                .0;
                self.ops.collect(&op_id).await?;
            }
            Some((op_id, OperationWait::TimedOut)) => {
                open_op = Some(op_id);
                waiting = true;
            }
            Some((op_id, OperationWait::Interrupted)) => open_op = Some(op_id),
        }

        Ok(deployment_report(&row, open_op.as_deref(), waiting))
    }

    /// Applies a completed manual sync to the deployment it targeted and
    /// refreshes that deployment's status.
    pub(crate) async fn fold_manual_sync(&self, deployment_id: &str, outcome: &OperationStatus) -> KansoResult<()> {
        if self.store.load::<DeploymentTarget>(deployment_id)?.is_none() {
            debug!(entity = %deployment_id, "deployment gone before its manual sync finished");
            return Ok(());
        }
        let resources_json = resource_summary(outcome)?;
        let (row, changed) = update_entity(&self.store, deployment_id, |r: &mut DeploymentTarget| {
            let generation = r.generation;
            record_outcome(r, generation, OperationState::Completed, outcome, &resources_json)
        })?;
        if !changed {
            return Ok(());
        }
        info!(entity = %row.id, revision = %row.sync_revision, "manual sync applied to deployment");

        let Some(mapping) = self.store.mapping_for_entity(REL, &row.id)? else {
            return Ok(());
        };
        let key = ResourceKey::new(ResourceKind::Deployment, mapping.namespace, mapping.name);
        let Some(obj) = self.cluster.get(&key).await? else {
            return Ok(());
        };
        if obj.uid() != Some(mapping.api_resource_uid.as_str()) {
            return Ok(());
        }
        let open_op = self.ops.open_operations(REL, &row.id)?.pop().map(|op| op.id);
        self.write_status(&key, &obj, deployment_report(&row, open_op.as_deref(), false)).await
    }
}
