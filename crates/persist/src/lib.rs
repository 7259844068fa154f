//! Kanso persistence: SQLite store for the entity mapping, durable entities and
//! operation records. Every entity update is a compare-and-swap on `version`.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use metrics::histogram;
use thiserror::Error;
use tracing::debug;

use kanso_core::KansoError;

mod entities;
mod mapping;
mod operations;

pub use entities::{
    DeploymentFields, DeploymentTarget, EntityRow, EnvironmentFields, ManagedEnvironment, RepoCredentialFields,
    RepositoryCredential, SyncRunFields, SyncRunRecord,
};
pub use mapping::{CreateOutcome, EntityMapping, NewMapping};
pub use operations::OperationRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),
    #[error("unique constraint violated: {0}")]
    Unique(String),
    #[error("version conflict on {table} {id}")]
    VersionConflict { table: &'static str, id: String },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(f, msg) = &e {
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            {
                return StoreError::Unique(msg.clone().unwrap_or_else(|| f.to_string()));
            }
        }
        StoreError::Sqlite(e)
    }
}

impl From<StoreError> for KansoError {
    fn from(e: StoreError) -> Self {
        use rusqlite::ErrorCode as C;
        match e {
            StoreError::Unique(m) => KansoError::UniqueViolation(m),
            StoreError::VersionConflict { .. } => KansoError::Conflict(e.to_string()),
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(f, _))
                if matches!(f.code, C::DatabaseBusy | C::DatabaseLocked | C::SystemIoFailure | C::CannotOpen | C::DiskFull) =>
            {
                KansoError::Transient(format!("sqlite: {f}"))
            }
            StoreError::Sqlite(other) => KansoError::Fatal(format!("sqlite: {other}")),
            StoreError::Corrupt(_) | StoreError::Poisoned => KansoError::Fatal(e.to_string()),
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entity_mapping (
    api_resource_type      TEXT NOT NULL,
    api_resource_uid       TEXT NOT NULL,
    api_resource_namespace TEXT NOT NULL,
    api_resource_name      TEXT NOT NULL,
    tenant_key             TEXT NOT NULL,
    db_relation_type       TEXT NOT NULL,
    db_relation_key        TEXT NOT NULL,
    created_at             INTEGER NOT NULL,
    PRIMARY KEY (api_resource_type, api_resource_uid),
    UNIQUE (db_relation_type, db_relation_key)
);
CREATE INDEX IF NOT EXISTS idx_mapping_by_name
    ON entity_mapping(api_resource_type, tenant_key, api_resource_namespace, api_resource_name);

CREATE TABLE IF NOT EXISTS deployment_target (
    id                  TEXT PRIMARY KEY,
    tenant_key          TEXT NOT NULL,
    repo_url            TEXT NOT NULL,
    path                TEXT NOT NULL,
    target_revision     TEXT NOT NULL,
    dest_environment_id TEXT NOT NULL,
    dest_namespace      TEXT NOT NULL,
    target              TEXT NOT NULL UNIQUE,
    sync_mode           TEXT NOT NULL,
    sync_requested      INTEGER NOT NULL,
    generation          INTEGER NOT NULL,
    synced_generation   INTEGER NOT NULL DEFAULT 0,
    sync_revision       TEXT NOT NULL DEFAULT '',
    health              TEXT NOT NULL DEFAULT '',
    health_message      TEXT NOT NULL DEFAULT '',
    resources_json      TEXT NOT NULL DEFAULT '[]',
    last_failure        TEXT NOT NULL DEFAULT '',
    version             INTEGER NOT NULL,
    gc_pending          INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS managed_environment (
    id                 TEXT PRIMARY KEY,
    tenant_key         TEXT NOT NULL,
    api_url            TEXT NOT NULL,
    credentials_secret TEXT NOT NULL,
    credential_hash    TEXT NOT NULL,
    generation         INTEGER NOT NULL,
    dispatched_generation INTEGER NOT NULL DEFAULT 0,
    version            INTEGER NOT NULL,
    gc_pending         INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS repository_credential (
    id              TEXT PRIMARY KEY,
    tenant_key      TEXT NOT NULL,
    repo_url        TEXT NOT NULL,
    secret_name     TEXT NOT NULL,
    credential_hash TEXT NOT NULL,
    generation      INTEGER NOT NULL,
    dispatched_generation INTEGER NOT NULL DEFAULT 0,
    version         INTEGER NOT NULL,
    gc_pending      INTEGER NOT NULL DEFAULT 0,
    UNIQUE (tenant_key, repo_url)
);

CREATE TABLE IF NOT EXISTS sync_run (
    id            TEXT PRIMARY KEY,
    tenant_key    TEXT NOT NULL,
    deployment_id TEXT NOT NULL,
    revision      TEXT NOT NULL,
    generation    INTEGER NOT NULL,
    dispatched_generation INTEGER NOT NULL DEFAULT 0,
    version       INTEGER NOT NULL,
    gc_pending    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS operation_record (
    id            TEXT PRIMARY KEY,
    resource_type TEXT NOT NULL,
    resource_key  TEXT NOT NULL,
    generation    INTEGER NOT NULL,
    state         TEXT NOT NULL,
    message       TEXT NOT NULL DEFAULT '',
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    UNIQUE (resource_type, resource_key, generation)
);
";

/// SQLite-backed store. Simple, synchronous; one guarded connection acts as the pool.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> StoreResult<Self> {
        let started = std::time::Instant::now();
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let db = rusqlite::Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "store opened");
        Ok(me)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(db: rusqlite::Connection) -> StoreResult<Self> {
        db.pragma_update(None, "foreign_keys", "ON").ok();
        db.busy_timeout(std::time::Duration::from_secs(5))?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
