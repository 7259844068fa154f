//! The binding table between an API object's immutable UID and its durable entity.

use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use kanso_core::{DbRelationType, ResourceKey, ResourceKind, TenantKey};

use crate::entities::EntityRow;
use crate::{now_ts, SqliteStore, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMapping {
    pub api_resource_type: ResourceKind,
    pub api_resource_uid: String,
    pub namespace: String,
    pub name: String,
    pub tenant_key: String,
    pub db_relation_type: DbRelationType,
    pub db_relation_key: String,
    pub created_at: i64,
}

/// Identity of the API object a new entity is created for.
#[derive(Debug, Clone)]
pub struct NewMapping {
    pub kind: ResourceKind,
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub tenant_key: TenantKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(EntityMapping),
    /// A mapping for this UID already existed; nothing was written.
    AlreadyMapped(EntityMapping),
}

impl CreateOutcome {
    pub fn mapping(&self) -> &EntityMapping {
        match self {
            CreateOutcome::Created(m) | CreateOutcome::AlreadyMapped(m) => m,
        }
    }
}

const MAPPING_COLUMNS: &str = "api_resource_type, api_resource_uid, api_resource_namespace, api_resource_name,
     tenant_key, db_relation_type, db_relation_key, created_at";

fn mapping_from_row(r: &Row<'_>) -> rusqlite::Result<EntityMapping> {
    let kind: String = r.get(0)?;
    let rel: String = r.get(5)?;
    let bad = |col: usize, v: &str| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, format!("unknown value {v}").into())
    };
    Ok(EntityMapping {
        api_resource_type: kind.parse().map_err(|_| bad(0, &kind))?,
        api_resource_uid: r.get(1)?,
        namespace: r.get(2)?,
        name: r.get(3)?,
        tenant_key: r.get(4)?,
        db_relation_type: rel.parse().map_err(|_| bad(5, &rel))?,
        db_relation_key: r.get(6)?,
        created_at: r.get(7)?,
    })
}

impl SqliteStore {
    /// Inserts the entity and its mapping row in one transaction.
    /// A mapping that already exists for the UID makes this a no-op success.
    pub fn create_entity<E: EntityRow>(&self, m: &NewMapping, row: &E) -> StoreResult<CreateOutcome> {
        let started = std::time::Instant::now();
        if m.kind.relation() != E::RELATION {
            return Err(StoreError::Corrupt(format!("{} cannot be backed by {}", m.kind, E::RELATION)));
        }
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let existing = tx
            .query_row(
                &format!("SELECT {MAPPING_COLUMNS} FROM entity_mapping WHERE api_resource_type = ?1 AND api_resource_uid = ?2"),
                params![m.kind.api_kind(), m.uid],
                mapping_from_row,
            )
            .optional()?;
        if let Some(found) = existing {
            debug!(kind = %m.kind, uid = %m.uid, entity = %found.db_relation_key, "mapping already present");
            return Ok(CreateOutcome::AlreadyMapped(found));
        }
        row.insert(&tx)?;
        let mapping = EntityMapping {
            api_resource_type: m.kind,
            api_resource_uid: m.uid.clone(),
            namespace: m.namespace.clone(),
            name: m.name.clone(),
            tenant_key: m.tenant_key.0.clone(),
            db_relation_type: E::RELATION,
            db_relation_key: row.id().to_string(),
            created_at: now_ts(),
        };
        tx.execute(
            &format!("INSERT INTO entity_mapping({MAPPING_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                mapping.api_resource_type.api_kind(),
                mapping.api_resource_uid,
                mapping.namespace,
                mapping.name,
                mapping.tenant_key,
                mapping.db_relation_type.as_str(),
                mapping.db_relation_key,
                mapping.created_at
            ],
        )?;
        tx.commit()?;
        counter!("persist_mappings_created_total", 1u64);
        histogram!("persist_create_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(CreateOutcome::Created(mapping))
    }

    pub fn get_mapping(&self, kind: ResourceKind, uid: &str) -> StoreResult<Option<EntityMapping>> {
        let db = self.conn()?;
        Ok(db
            .query_row(
                &format!("SELECT {MAPPING_COLUMNS} FROM entity_mapping WHERE api_resource_type = ?1 AND api_resource_uid = ?2"),
                params![kind.api_kind(), uid],
                mapping_from_row,
            )
            .optional()?)
    }

    /// Every mapping recorded under a Resource Key in a tenant, whatever the UID.
    pub fn mappings_for_key(&self, key: &ResourceKey, tenant: &TenantKey) -> StoreResult<Vec<EntityMapping>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM entity_mapping
             WHERE api_resource_type = ?1 AND tenant_key = ?2 AND api_resource_namespace = ?3 AND api_resource_name = ?4
             ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![key.kind.api_kind(), tenant.0, key.namespace, key.name], mapping_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_mappings(&self) -> StoreResult<Vec<EntityMapping>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM entity_mapping ORDER BY api_resource_type, api_resource_namespace, api_resource_name"
        ))?;
        let rows = stmt.query_map([], mapping_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn mapping_for_entity(&self, rel: DbRelationType, id: &str) -> StoreResult<Option<EntityMapping>> {
        let db = self.conn()?;
        Ok(db
            .query_row(
                &format!("SELECT {MAPPING_COLUMNS} FROM entity_mapping WHERE db_relation_type = ?1 AND db_relation_key = ?2"),
                params![rel.as_str(), id],
                mapping_from_row,
            )
            .optional()?)
    }

    /// Removes the mapping and marks its entity for garbage collection, atomically.
    /// Returns false when the mapping was already gone.
    pub fn retire_mapping(&self, m: &EntityMapping) -> StoreResult<bool> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let removed = tx.execute(
            "DELETE FROM entity_mapping WHERE api_resource_type = ?1 AND api_resource_uid = ?2",
            params![m.api_resource_type.api_kind(), m.api_resource_uid],
        )?;
        tx.execute(
            &format!("UPDATE {} SET gc_pending = 1 WHERE id = ?1", m.db_relation_type.table()),
            [&m.db_relation_key],
        )?;
        tx.commit()?;
        if removed > 0 {
            counter!("persist_mappings_retired_total", 1u64);
        }
        Ok(removed > 0)
    }

    /// Entity id mapped to the live object `name` of `kind` in the tenant's namespace.
    pub fn entity_id_by_name(&self, kind: ResourceKind, tenant: &TenantKey, namespace: &str, name: &str) -> StoreResult<Option<String>> {
        let key = ResourceKey::new(kind, namespace, name);
        Ok(self.mappings_for_key(&key, tenant)?.pop().map(|m| m.db_relation_key))
    }

    /// API objects in `namespace` whose entity references the named secret.
    pub fn referencing_secret(&self, namespace: &str, secret: &str) -> StoreResult<Vec<ResourceKey>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT m.api_resource_type, m.api_resource_namespace, m.api_resource_name
             FROM entity_mapping m JOIN managed_environment e
               ON m.db_relation_type = 'ManagedEnvironment' AND m.db_relation_key = e.id
             WHERE m.api_resource_namespace = ?1 AND e.credentials_secret = ?2 AND e.gc_pending = 0
             UNION ALL
             SELECT m.api_resource_type, m.api_resource_namespace, m.api_resource_name
             FROM entity_mapping m JOIN repository_credential r
               ON m.db_relation_type = 'RepositoryCredential' AND m.db_relation_key = r.id
             WHERE m.api_resource_namespace = ?1 AND r.secret_name = ?2 AND r.gc_pending = 0",
        )?;
        let rows = stmt.query_map(params![namespace, secret], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (kind, ns, name) = row?;
            let kind: ResourceKind = kind.parse().map_err(|_| StoreError::Corrupt(format!("mapping kind {kind}")))?;
            out.push(ResourceKey::new(kind, ns, name));
        }
        out.sort();
        out.dedup();
        Ok(out)
    }
}
