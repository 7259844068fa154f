//! Kanso Ops: work handed to the engine agent through Operation signal
//! objects, and the credential artifacts the engine authenticates with.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kanso_core::{DbRelationType, KansoError, KansoResult};
use kanso_kubehub::Cluster;
use kanso_persist::{OperationRecord, SqliteStore, StoreError};
use kanso_schema::{Operation, OperationSpec, OperationState, OperationStatus};

mod credentials;

pub use credentials::{credential_material, fingerprint, repository_material, CredentialManager, SourceCredential};

/// Name of the signal object for an operation id.
pub fn signal_name(op_id: &str) -> String {
    format!("operation-{op_id}")
}

/// How a bounded wait on an operation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationWait {
    /// The agent reported a terminal state.
    Finished { record: OperationRecord, status: OperationStatus },
    TimedOut,
    /// The caller's token fired before the operation finished.
    Interrupted,
}

pub struct OperationDispatcher {
    store: Arc<SqliteStore>,
    cluster: Arc<dyn Cluster>,
    namespace: String,
    poll: Duration,
}

impl OperationDispatcher {
    pub fn new(store: Arc<SqliteStore>, cluster: Arc<dyn Cluster>, namespace: impl Into<String>, poll: Duration) -> Self {
        Self { store, cluster, namespace: namespace.into(), poll: poll.max(Duration::from_millis(1)) }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn signal(&self, op: &OperationRecord) -> Operation {
        let mut obj = Operation::new(
            &signal_name(&op.id),
            OperationSpec {
                operation_id: op.id.clone(),
                resource_type: op.resource_type.as_str().to_string(),
                resource_id: op.resource_key.clone(),
                generation: op.generation,
            },
        );
        obj.metadata.namespace = Some(self.namespace.clone());
        obj
    }

    /// Returns the operation for `(rel, entity_id, generation)`, creating the
    /// record and its signal object on first call. Repeated calls for the
    /// same generation return the same id and re-create a signal object that
    /// went missing while the operation was still open.
    pub async fn dispatch(&self, rel: DbRelationType, entity_id: &str, generation: i64) -> KansoResult<String> {
        let op = match self.store.find_operation(rel, entity_id, generation)? {
            Some(existing) => {
                debug!(op_id = %existing.id, entity = entity_id, generation, "operation already dispatched");
                existing
            }
            None => {
                let fresh = OperationRecord::pending(rel, entity_id, generation);
                match self.store.insert_operation(&fresh) {
                    Ok(()) => {
                        counter!("kanso_operations_dispatched_total", 1u64);
                        info!(op_id = %fresh.id, rel = %rel, entity = entity_id, generation, "operation dispatched");
                        fresh
                    }
                    // lost a race with another writer for the same generation
                    Err(StoreError::Unique(_)) => self
                        .store
                        .find_operation(rel, entity_id, generation)?
                        .ok_or_else(|| KansoError::Transient(format!("operation for {entity_id}@{generation} vanished")))?,
                    Err(e) => return Err(e.into()),
                }
            }
        };
        if !op.is_terminal() {
            self.cluster.create_operation(&self.namespace, self.signal(&op)).await?;
        }
        Ok(op.id)
    }

    /// Operations of an entity that have not reached a terminal state.
    pub fn open_operations(&self, rel: DbRelationType, entity_id: &str) -> KansoResult<Vec<OperationRecord>> {
        Ok(self.store.operations_for(rel, entity_id)?.into_iter().filter(|o| !o.is_terminal()).collect())
    }

    /// Polls the signal object until the agent marks it terminal, the timeout
    /// passes, or `cancel` fires. Terminal states are recorded durably.
    pub async fn await_terminal(&self, op_id: &str, timeout: Duration, cancel: &CancellationToken) -> KansoResult<OperationWait> {
        let deadline = Instant::now() + timeout;
        let name = signal_name(op_id);
        loop {
            let Some(mut record) = self.store.get_operation(op_id)? else {
                return Err(KansoError::Fatal(format!("operation {op_id} has no record")));
            };
            match self.cluster.get_operation(&self.namespace, &name).await? {
                Some(obj) => {
                    let status = obj.status.unwrap_or_default();
                    if status.state.is_terminal() {
                        if record.state != status.state {
                            self.store.set_operation_state(op_id, status.state, &status.message)?;
                            record.state = status.state;
                            record.message = status.message.clone();
                        }
                        info!(op_id, state = status.state.as_str(), "operation finished");
                        return Ok(OperationWait::Finished { record, status });
                    }
                    if record.state != status.state {
                        self.store.set_operation_state(op_id, status.state, &status.message)?;
                    }
                }
                None if record.is_terminal() => {
                    let status = OperationStatus { state: record.state, message: record.message.clone(), ..Default::default() };
                    return Ok(OperationWait::Finished { record, status });
                }
                None => {
                    warn!(op_id, "signal object missing for open operation; re-creating");
                    self.cluster.create_operation(&self.namespace, self.signal(&record)).await?;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(op_id, "operation wait timed out");
                return Ok(OperationWait::TimedOut);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll.min(deadline - now)) => {}
                _ = cancel.cancelled() => return Ok(OperationWait::Interrupted),
            }
        }
    }

    /// Removes the signal object and the record once the outcome was observed.
    pub async fn collect(&self, op_id: &str) -> KansoResult<()> {
        self.cluster.delete_operation(&self.namespace, &signal_name(op_id)).await?;
        self.store.delete_operation(op_id)?;
        debug!(op_id, "operation collected");
        Ok(())
    }

    /// Collects every operation of an entity, open or not. Returns how many there were.
    pub async fn collect_all(&self, rel: DbRelationType, entity_id: &str) -> KansoResult<usize> {
        let ops = self.store.operations_for(rel, entity_id)?;
        for op in &ops {
            if !op.is_terminal() {
                self.store.set_operation_state(&op.id, OperationState::Failed, "owner deleted")?;
            }
            self.collect(&op.id).await?;
        }
        Ok(ops.len())
    }
}
