//! Entity teardown, used by the delete path and by the periodic sweeper that
//! finishes deletes interrupted after the mapping was retired.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kanso_core::{DbRelationType, KansoResult};
use kanso_persist::EntityMapping;

use crate::Reconciler;

impl Reconciler {
    /// Retires the mapping and tears the entity down in the same pass.
    pub(crate) async fn delete_entity(&self, m: &EntityMapping) -> KansoResult<()> {
        self.store.retire_mapping(m)?;
        self.finish_cleanup(m.db_relation_type, &m.db_relation_key).await
    }

    /// Removes everything hanging off an entity, then the row itself.
    /// Each step tolerates its target being gone already.
    pub async fn finish_cleanup(&self, rel: DbRelationType, id: &str) -> KansoResult<()> {
        if rel == DbRelationType::ManagedEnvironment {
            self.creds.delete_artifact(id).await?;
            let dependents = self.store.deployments_on_environment(id)?;
            if !dependents.is_empty() {
                warn!(env = id, deployments = dependents.len(), "environment deleted while deployments still target it");
            }
        }
        let collected = self.ops.collect_all(rel, id).await?;
        self.store.purge_entity(rel, id)?;
        counter!("kanso_entities_purged_total", 1u64);
        info!(rel = %rel, entity = id, operations = collected, "entity purged");
        Ok(())
    }

    /// One garbage-collection pass. Returns the number of entities finished.
    pub async fn sweep(&self) -> KansoResult<usize> {
        let pending = self.store.gc_pending()?;
        for (rel, id) in &pending {
            self.finish_cleanup(*rel, id).await?;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "sweep finished interrupted deletes");
        }
        Ok(pending.len())
    }
}

/// Sweeps once right away, then every `interval` until `cancel` fires.
pub fn spawn_sweeper(reconciler: Arc<Reconciler>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = reconciler.sweep().await {
                        warn!(error = %e, "sweep failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}
