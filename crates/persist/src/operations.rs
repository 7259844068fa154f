//! Operation records: durable rows the agent-side signal objects point at.
//! At most one record exists per (entity, generation).

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use kanso_core::DbRelationType;
use kanso_schema::OperationState;

use crate::{new_id, now_ts, SqliteStore, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub resource_type: DbRelationType,
    pub resource_key: String,
    pub generation: i64,
    pub state: OperationState,
    pub message: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OperationRecord {
    pub fn pending(resource_type: DbRelationType, resource_key: impl Into<String>, generation: i64) -> Self {
        let now = now_ts();
        Self {
            id: new_id(),
            resource_type,
            resource_key: resource_key.into(),
            generation,
            state: OperationState::Pending,
            message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

const OP_COLUMNS: &str = "id, resource_type, resource_key, generation, state, message, created_at, updated_at";

fn op_from_row(r: &Row<'_>) -> rusqlite::Result<OperationRecord> {
    let rel: String = r.get(1)?;
    let state: String = r.get(4)?;
    let bad = |col: usize, v: &str| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, format!("unknown value {v}").into())
    };
    Ok(OperationRecord {
        id: r.get(0)?,
        resource_type: rel.parse().map_err(|_| bad(1, &rel))?,
        resource_key: r.get(2)?,
        generation: r.get(3)?,
        state: OperationState::parse(&state).ok_or_else(|| bad(4, &state))?,
        message: r.get(5)?,
        created_at: r.get(6)?,
        updated_at: r.get(7)?,
    })
}

impl SqliteStore {
    /// Fails with `StoreError::Unique` when a record for the same generation exists.
    pub fn insert_operation(&self, op: &OperationRecord) -> StoreResult<()> {
        let db = self.conn()?;
        db.execute(
            &format!("INSERT INTO operation_record({OP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                op.id,
                op.resource_type.as_str(),
                op.resource_key,
                op.generation,
                op.state.as_str(),
                op.message,
                op.created_at,
                op.updated_at
            ],
        )?;
        metrics::counter!("persist_operations_created_total", 1u64);
        Ok(())
    }

    pub fn find_operation(&self, rel: DbRelationType, key: &str, generation: i64) -> StoreResult<Option<OperationRecord>> {
        let db = self.conn()?;
        Ok(db
            .query_row(
                &format!(
                    "SELECT {OP_COLUMNS} FROM operation_record WHERE resource_type = ?1 AND resource_key = ?2 AND generation = ?3"
                ),
                params![rel.as_str(), key, generation],
                op_from_row,
            )
            .optional()?)
    }

    pub fn get_operation(&self, id: &str) -> StoreResult<Option<OperationRecord>> {
        let db = self.conn()?;
        Ok(db
            .query_row(&format!("SELECT {OP_COLUMNS} FROM operation_record WHERE id = ?1"), [id], op_from_row)
            .optional()?)
    }

    pub fn set_operation_state(&self, id: &str, state: OperationState, message: &str) -> StoreResult<()> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE operation_record SET state = ?2, message = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, state.as_str(), message, now_ts()],
        )?;
        if n == 0 {
            return Err(StoreError::Corrupt(format!("operation {id} not found")));
        }
        Ok(())
    }

    /// Operations recorded for one entity, oldest generation first.
    pub fn operations_for(&self, rel: DbRelationType, key: &str) -> StoreResult<Vec<OperationRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {OP_COLUMNS} FROM operation_record WHERE resource_type = ?1 AND resource_key = ?2 ORDER BY generation"
        ))?;
        let rows = stmt.query_map(params![rel.as_str(), key], op_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Returns false when the record was already gone.
    pub fn delete_operation(&self, id: &str) -> StoreResult<bool> {
        let db = self.conn()?;
        Ok(db.execute("DELETE FROM operation_record WHERE id = ?1", [id])? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_record_per_generation() {
        let s = SqliteStore::open_in_memory().unwrap();
        let first = OperationRecord::pending(DbRelationType::DeploymentTarget, "d1", 1);
        s.insert_operation(&first).unwrap();
        let dup = OperationRecord::pending(DbRelationType::DeploymentTarget, "d1", 1);
        assert!(matches!(s.insert_operation(&dup), Err(StoreError::Unique(_))));
        s.insert_operation(&OperationRecord::pending(DbRelationType::DeploymentTarget, "d1", 2)).unwrap();

        let found = s.find_operation(DbRelationType::DeploymentTarget, "d1", 1).unwrap().unwrap();
        assert_eq!(found.id, first.id);
        let gens: Vec<i64> = s.operations_for(DbRelationType::DeploymentTarget, "d1").unwrap().iter().map(|o| o.generation).collect();
        assert_eq!(gens, vec![1, 2]);
    }

    #[test]
    fn state_transitions_and_delete() {
        let s = SqliteStore::open_in_memory().unwrap();
        let op = OperationRecord::pending(DbRelationType::SyncRun, "r1", 1);
        s.insert_operation(&op).unwrap();
        s.set_operation_state(&op.id, OperationState::Failed, "manifest error").unwrap();
        let got = s.get_operation(&op.id).unwrap().unwrap();
        assert!(got.is_terminal());
        assert_eq!(got.message, "manifest error");

        assert!(s.delete_operation(&op.id).unwrap());
        assert!(!s.delete_operation(&op.id).unwrap());
        assert!(s.set_operation_state(&op.id, OperationState::Completed, "").is_err());
    }
}
