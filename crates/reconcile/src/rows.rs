//! Create-or-locate and compare-and-swap helpers shared by every kind.

use metrics::counter;
use tracing::{debug, info};

use kanso_core::{KansoError, KansoResult};
use kanso_persist::{
    CreateOutcome, EntityMapping, EntityRow, ManagedEnvironment, NewMapping, RepositoryCredential, SqliteStore, StoreError,
    SyncRunRecord,
};

use crate::Reconciler;

/// Update attempts before a version conflict goes back to the dispatcher.
pub(crate) const CAS_ATTEMPTS: u32 = 3;

pub(crate) fn load_entity<E: EntityRow>(store: &SqliteStore, id: &str) -> KansoResult<E> {
    store
        .load::<E>(id)?
        .ok_or_else(|| KansoError::Fatal(format!("{} {id} is mapped but has no row", E::RELATION)))
}

/// Entity id for the live object. Inserts the entity and its mapping when the
/// object has none yet; the bool is true when this call created them.
pub(crate) fn ensure_entity<E: EntityRow>(
    store: &SqliteStore,
    mapping: Option<&EntityMapping>,
    target: &NewMapping,
    fresh: impl FnOnce() -> E,
) -> KansoResult<(String, bool)> {
    if let Some(m) = mapping {
        return Ok((m.db_relation_key.clone(), false));
    }
    match store.create_entity(target, &fresh())? {
        CreateOutcome::Created(m) => {
            info!(kind = %target.kind, uid = %target.uid, entity = %m.db_relation_key, "entity created");
            Ok((m.db_relation_key, true))
        }
        CreateOutcome::AlreadyMapped(m) => Ok((m.db_relation_key, false)),
    }
}

/// Reloads the row, lets `apply` mutate it, and writes it back with a
/// compare-and-swap. `apply` returns false when nothing changed, in which
/// case nothing is written. A lost race reloads and re-applies.
pub(crate) fn update_entity<E, F>(store: &SqliteStore, id: &str, mut apply: F) -> KansoResult<(E, bool)>
where
    E: EntityRow + Clone,
    F: FnMut(&mut E) -> bool,
{
    let mut attempt = 1;
    loop {
        let mut row: E = load_entity(store, id)?;
        if !apply(&mut row) {
            return Ok((row, false));
        }
        match store.update(&row) {
            Ok(stored) => return Ok((stored, true)),
            Err(StoreError::VersionConflict { .. }) if attempt < CAS_ATTEMPTS => {
                counter!("kanso_update_conflicts_total", 1u64);
                debug!(entity = id, attempt, "version conflict; reloading");
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Rows whose generations are handed to the engine one Operation each.
pub(crate) trait Dispatched: EntityRow + Clone {
    fn generation(&self) -> i64;
    fn dispatched_generation(&mut self) -> &mut i64;
}

macro_rules! dispatched {
    ($($row:ty),+) => {$(
        impl Dispatched for $row {
            fn generation(&self) -> i64 { self.generation }
            fn dispatched_generation(&mut self) -> &mut i64 { &mut self.dispatched_generation }
        }
    )+};
}

dispatched!(ManagedEnvironment, RepositoryCredential, SyncRunRecord);

impl Reconciler {
    /// Dispatches the row's current generation unless an earlier pass already
    /// did, then records the hand-off. A pass that failed between the two
    /// steps dispatches again on retry; the dispatch itself is idempotent.
    pub(crate) async fn dispatch_pending<E: Dispatched>(&self, mut row: E) -> KansoResult<E> {
        let generation = row.generation();
        if generation <= *row.dispatched_generation() {
            return Ok(row);
        }
        self.ops.dispatch(E::RELATION, row.id(), generation).await?;
        let id = row.id().to_string();
        let (stored, _) = update_entity(&self.store, &id, |r: &mut E| {
            let d = r.dispatched_generation();
            if *d >= generation {
                return false;
            }
            *d = generation;
            true
        })?;
        Ok(stored)
    }
}
