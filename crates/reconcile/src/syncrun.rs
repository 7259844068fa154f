//! GitOpsDeploymentSyncRun: a manual sync request against a deployment of
//! the same tenant.

use serde_json::Value;
use tracing::info;

use kanso_core::{CanonicalEvent, DbRelationType, KansoError, KansoResult, ResourceKind};
use kanso_dispatch::KeyScope;
use kanso_ops::OperationWait;
use kanso_persist::{new_id, EntityMapping, NewMapping, SyncRunFields, SyncRunRecord};
use kanso_schema::{validate, GitOpsDeploymentSyncRun, OperationState};

use crate::rows::{ensure_entity, update_entity};
use crate::status::{self, REASON_OPERATION_FAILED};
use crate::{Reconciler, Report};

const REL: DbRelationType = DbRelationType::SyncRun;

const PHASE_RUNNING: &str = "Running";
const PHASE_SUCCEEDED: &str = "Succeeded";
const PHASE_FAILED: &str = "Failed";

impl Reconciler {
    pub(crate) async fn sync_run(
        &self,
        ev: &CanonicalEvent,
        obj: &GitOpsDeploymentSyncRun,
        mapping: Option<&EntityMapping>,
        target: &NewMapping,
        scope: &KeyScope,
    ) -> KansoResult<Report> {
        validate::sync_run(&obj.spec)?;
        let dep_name = &obj.spec.gitops_deployment_name;
        let deployment_id = self
            .store
            .entity_id_by_name(ResourceKind::Deployment, &ev.tenant_key, &ev.namespace, dep_name)?
            .ok_or_else(|| KansoError::missing(ResourceKind::Deployment.api_kind(), dep_name.as_str()))?;
        let fields = SyncRunFields { deployment_id, revision: obj.spec.revision_id.clone() };

        let (id, created) = ensure_entity(&self.store, mapping, target, || SyncRunRecord {
            id: new_id(),
            tenant_key: ev.tenant_key.0.clone(),
            fields: fields.clone(),
            generation: 1,
            dispatched_generation: 0,
            version: 1,
        })?;
        let (row, changed) = update_entity(&self.store, &id, |row: &mut SyncRunRecord| {
            if row.fields == fields {
                return false;
            }
            info!(entity = %row.id, changed = ?row.fields.changed_fields(&fields), "sync run changed");
            row.fields = fields.clone();
            row.generation += 1;
            true
        })?;
        let row = self.dispatch_pending(row).await?;

        let mut report = Report { conditions: (created || changed).then(|| vec![status::no_error()]), ..Default::default() };
        let phase = match self.await_operations(REL, &row.id, scope).await? {
            None => None,
            Some((_, OperationWait::Interrupted)) => Some(PHASE_RUNNING),
            Some((_, OperationWait::TimedOut)) => {
                report.waiting = true;
                Some(PHASE_RUNNING)
            }
            Some((op_id, OperationWait::Finished { record, status: outcome })) => {
                if record.state == OperationState::Completed {
                    self.fold_manual_sync(&row.fields.deployment_id, &outcome).await?;
                }
                self.ops.collect(&op_id).await?;
                if record.state == OperationState::Failed {
                    report.conditions = Some(vec![status::error_occurred(REASON_OPERATION_FAILED, outcome.message)]);
                    Some(PHASE_FAILED)
                } else {
                    report.conditions = Some(vec![status::no_error()]);
                    Some(PHASE_SUCCEEDED)
                }
            }
        };
        if let Some(phase) = phase {
            report.status.insert("phase".into(), Value::String(phase.to_string()));
        }
        Ok(report)
    }
}
