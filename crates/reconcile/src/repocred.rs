//! GitOpsDeploymentRepositoryCredential.

use tracing::info;

use kanso_core::{CanonicalEvent, DbRelationType, KansoResult};
use kanso_dispatch::KeyScope;
use kanso_ops::{repository_material, OperationWait};
use kanso_persist::{new_id, EntityMapping, NewMapping, RepoCredentialFields, RepositoryCredential};
use kanso_schema::{validate, GitOpsDeploymentRepositoryCredential, OperationState};

use crate::rows::{ensure_entity, update_entity};
use crate::status::{self, REASON_OPERATION_FAILED};
use crate::{Reconciler, Report};

const REL: DbRelationType = DbRelationType::RepositoryCredential;

impl Reconciler {
    pub(crate) async fn repository_credential(
        &self,
        ev: &CanonicalEvent,
        obj: &GitOpsDeploymentRepositoryCredential,
        mapping: Option<&EntityMapping>,
        target: &NewMapping,
        scope: &KeyScope,
    ) -> KansoResult<Report> {
        validate::repository_credential(&obj.spec)?;
        let material = match self.creds.read_source(&ev.namespace, &obj.spec.secret).await {
            Ok(secret) => repository_material(&secret),
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => Err(e),
        };
        let fields = RepoCredentialFields {
            repo_url: obj.spec.repository.clone(),
            secret_name: obj.spec.secret.clone(),
            credential_hash: material.as_ref().cloned().unwrap_or_default(),
        };

        let (id, created) = ensure_entity(&self.store, mapping, target, || RepositoryCredential {
            id: new_id(),
            tenant_key: ev.tenant_key.0.clone(),
            fields: fields.clone(),
            generation: 1,
            dispatched_generation: 0,
            version: 1,
        })?;
        let (row, changed) = update_entity(&self.store, &id, |row: &mut RepositoryCredential| {
            if row.fields == fields {
                return false;
            }
            info!(entity = %row.id, changed = ?row.fields.changed_fields(&fields), "repository credential changed");
            row.fields = fields.clone();
            row.generation += 1;
            true
        })?;
        material?;

        let row = self.dispatch_pending(row).await?;
        let mut conditions = (created || changed).then(|| vec![status::no_error()]);
        let mut waiting = false;
        match self.await_operations(REL, &row.id, scope).await? {
            None | Some((_, OperationWait::Interrupted)) => {}
            Some((_, OperationWait::TimedOut)) => waiting = true,
            Some((op_id, OperationWait::Finished { record, status: outcome })) => {
                self.ops.collect(&op_id).await?;
                conditions = Some(vec![if record.state == OperationState::Failed {
                    status::error_occurred(REASON_OPERATION_FAILED, outcome.message)
                } else {
                    status::no_error()
                }]);
            }
        }
        Ok(Report { conditions, waiting, ..Default::default() })
    }
}
