//! GitOpsDeploymentManagedEnvironment: cluster registration and its
//! credential artifact. The artifact never outlives a valid source secret.

use tracing::{debug, info, warn};

use kanso_core::{CanonicalEvent, DbRelationType, KansoResult};
use kanso_dispatch::KeyScope;
use kanso_ops::{credential_material, OperationWait, SourceCredential};
use kanso_persist::{new_id, EntityMapping, EnvironmentFields, ManagedEnvironment, NewMapping};
use kanso_schema::{validate, GitOpsDeploymentManagedEnvironment, OperationState, CONDITION_CONNECTION_READY};

use crate::rows::{ensure_entity, load_entity, update_entity};
use crate::status::{self, REASON_OPERATION_FAILED};
use crate::{Reconciler, Report};

const REL: DbRelationType = DbRelationType::ManagedEnvironment;

impl Reconciler {
    async fn environment_material(&self, namespace: &str, secret: &str) -> KansoResult<SourceCredential> {
        let source = self.creds.read_source(namespace, secret).await?;
        credential_material(&source)
    }

    pub(crate) async fn environment(
        &self,
        ev: &CanonicalEvent,
        obj: &GitOpsDeploymentManagedEnvironment,
        mapping: Option<&EntityMapping>,
        target: &NewMapping,
        scope: &KeyScope,
    ) -> KansoResult<Report> {
        validate::managed_environment(&obj.spec)?;
        let material = match self.environment_material(&ev.namespace, &obj.spec.credentials_secret).await {
            Err(e) if e.is_retryable() => return Err(e),
            other => other,
        };
        // the entity exists even without usable material, so that the
        // secret watcher can find it once the secret shows up
        let fields = EnvironmentFields {
            api_url: obj.spec.api_url.clone(),
            credentials_secret: obj.spec.credentials_secret.clone(),
            credential_hash: material.as_ref().map(|m| m.fingerprint.clone()).unwrap_or_default(),
        };

        let (id, created) = ensure_entity(&self.store, mapping, target, || ManagedEnvironment {
            id: new_id(),
            tenant_key: ev.tenant_key.0.clone(),
            fields: fields.clone(),
            generation: 1,
            // registering a cluster needs no engine hand-off; later changes do
            dispatched_generation: 1,
            version: 1,
        })?;
        let (row, changed) = if created {
            (load_entity::<ManagedEnvironment>(&self.store, &id)?, true)
        } else {
            update_entity(&self.store, &id, |row: &mut ManagedEnvironment| {
                if row.fields == fields {
                    return false;
                }
                info!(entity = %row.id, changed = ?row.fields.changed_fields(&fields), "environment spec changed");
                row.fields = fields.clone();
                row.generation += 1;
                true
            })?
        };

        let material = match material {
            Ok(m) => m,
            Err(e) => {
                if self.creds.delete_artifact(&row.id).await? {
                    warn!(entity = %row.id, error = %e, "source credentials unusable; artifact removed");
                }
                return Err(e);
            }
        };

        if changed && !created {
            // rotation or a new API URL: the old artifact goes before the new one is written
            self.creds.delete_artifact(&row.id).await?;
        }
        let regenerated = !self.creds.artifact_current(&row.id, &row.fields.api_url, &material).await?;
        if regenerated {
            if !changed {
                warn!(entity = %row.id, "credential artifact missing or stale; regenerating");
            }
            self.creds.ensure_artifact(&row.id, &ev.name, &row.fields.api_url, &material).await?;
        }
        let row = self.dispatch_pending(row).await?;

        let mut conditions = None;
        let mut waiting = false;
        match self.await_operations(REL, &row.id, scope).await? {
            None | Some((_, OperationWait::Interrupted)) => {}
            Some((_, OperationWait::TimedOut)) => waiting = true,
            Some((op_id, OperationWait::Finished { record, status: outcome })) => {
                self.ops.collect(&op_id).await?;
                if record.state == OperationState::Failed {
                    conditions = Some(vec![status::error_occurred(REASON_OPERATION_FAILED, outcome.message)]);
                }
            }
        }
        if conditions.is_none() && (changed || regenerated) {
            conditions = Some(vec![
                status::no_error(),
                status::condition(CONDITION_CONNECTION_READY, true, "Succeeded", "credential artifact is in place"),
            ]);
        }
        debug!(entity = %row.id, changed, regenerated, waiting, "environment reconciled");
        Ok(Report { conditions, waiting, ..Default::default() })
    }
}
