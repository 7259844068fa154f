//! Durable entity rows. Each kind owns one table; `version` is the
//! optimistic-concurrency column and `generation` counts spec changes.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use kanso_core::DbRelationType;

use crate::{SqliteStore, StoreError, StoreResult};

/// A row type stored in one durable entity table.
pub trait EntityRow: Sized {
    const RELATION: DbRelationType;

    fn id(&self) -> &str;
    fn version(&self) -> i64;
    fn insert(&self, conn: &Connection) -> rusqlite::Result<usize>;
    /// Writes the row when the stored version still equals `self.version()`, bumping it.
    fn update(&self, conn: &Connection) -> rusqlite::Result<usize>;
    fn select(conn: &Connection, id: &str) -> rusqlite::Result<Option<Self>>;
}

fn field_diff<'a>(out: &mut Vec<&'a str>, name: &'a str, changed: bool) {
    if changed {
        out.push(name);
    }
}

// ---- deployment_target ----

/// Fields derived from the GitOpsDeployment spec; a difference here is a spec change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentFields {
    pub repo_url: String,
    pub path: String,
    pub target_revision: String,
    /// Empty for the local cluster.
    pub dest_environment_id: String,
    pub dest_namespace: String,
    /// Claim key: `<environment id | in-cluster>/<namespace>`.
    pub target: String,
    pub sync_mode: String,
    pub sync_requested: bool,
}

impl DeploymentFields {
    pub fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        field_diff(&mut out, "repoURL", self.repo_url != other.repo_url);
        field_diff(&mut out, "path", self.path != other.path);
        field_diff(&mut out, "targetRevision", self.target_revision != other.target_revision);
        field_diff(&mut out, "environment", self.dest_environment_id != other.dest_environment_id);
        field_diff(&mut out, "namespace", self.dest_namespace != other.dest_namespace);
        field_diff(&mut out, "type", self.sync_mode != other.sync_mode);
        field_diff(&mut out, "syncRequested", self.sync_requested != other.sync_requested);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub id: String,
    pub tenant_key: String,
    pub fields: DeploymentFields,
    pub generation: i64,
    pub synced_generation: i64,
    pub sync_revision: String,
    pub health: String,
    pub health_message: String,
    pub resources_json: String,
    /// Message of the last failed operation; cleared by the next completed one.
    pub last_failure: String,
    pub version: i64,
}

impl DeploymentTarget {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            tenant_key: r.get(1)?,
            fields: DeploymentFields {
                repo_url: r.get(2)?,
                path: r.get(3)?,
                target_revision: r.get(4)?,
                dest_environment_id: r.get(5)?,
                dest_namespace: r.get(6)?,
                target: r.get(7)?,
                sync_mode: r.get(8)?,
                sync_requested: r.get(9)?,
            },
            generation: r.get(10)?,
            synced_generation: r.get(11)?,
            sync_revision: r.get(12)?,
            health: r.get(13)?,
            health_message: r.get(14)?,
            resources_json: r.get(15)?,
            last_failure: r.get(16)?,
            version: r.get(17)?,
        })
    }
}

impl EntityRow for DeploymentTarget {
    const RELATION: DbRelationType = DbRelationType::DeploymentTarget;

    fn id(&self) -> &str { &self.id }
    fn version(&self) -> i64 { self.version }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let f = &self.fields;
        conn.execute(
            "INSERT INTO deployment_target(id, tenant_key, repo_url, path, target_revision, dest_environment_id,
                 dest_namespace, target, sync_mode, sync_requested, generation, synced_generation, sync_revision,
                 health, health_message, resources_json, last_failure, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                self.id, self.tenant_key, f.repo_url, f.path, f.target_revision, f.dest_environment_id,
                f.dest_namespace, f.target, f.sync_mode, f.sync_requested, self.generation, self.synced_generation,
                self.sync_revision, self.health, self.health_message, self.resources_json, self.last_failure,
                self.version
            ],
        )
    }

    fn update(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let f = &self.fields;
        conn.execute(
            "UPDATE deployment_target SET repo_url = ?3, path = ?4, target_revision = ?5, dest_environment_id = ?6,
                 dest_namespace = ?7, target = ?8, sync_mode = ?9, sync_requested = ?10, generation = ?11,
                 synced_generation = ?12, sync_revision = ?13, health = ?14, health_message = ?15,
                 resources_json = ?16, last_failure = ?17, version = version + 1
             WHERE id = ?1 AND version = ?2 AND gc_pending = 0",
            params![
                self.id, self.version, f.repo_url, f.path, f.target_revision, f.dest_environment_id,
                f.dest_namespace, f.target, f.sync_mode, f.sync_requested, self.generation, self.synced_generation,
                self.sync_revision, self.health, self.health_message, self.resources_json, self.last_failure
            ],
        )
    }

    fn select(conn: &Connection, id: &str) -> rusqlite::Result<Option<Self>> {
        conn.query_row(
            "SELECT id, tenant_key, repo_url, path, target_revision, dest_environment_id, dest_namespace, target,
                    sync_mode, sync_requested, generation, synced_generation, sync_revision, health,
                    health_message, resources_json, last_failure, version
             FROM deployment_target WHERE id = ?1 AND gc_pending = 0",
            [id],
            Self::from_row,
        )
        .optional()
    }
}

// ---- managed_environment ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentFields {
    pub api_url: String,
    pub credentials_secret: String,
    /// Fingerprint of the source secret's connection material.
    pub credential_hash: String,
}

impl EnvironmentFields {
    pub fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        field_diff(&mut out, "apiURL", self.api_url != other.api_url);
        field_diff(&mut out, "credentialsSecret", self.credentials_secret != other.credentials_secret);
        field_diff(&mut out, "credentials", self.credential_hash != other.credential_hash);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedEnvironment {
    pub id: String,
    pub tenant_key: String,
    pub fields: EnvironmentFields,
    pub generation: i64,
    /// Last generation handed to the engine as an Operation.
    pub dispatched_generation: i64,
    pub version: i64,
}

impl EntityRow for ManagedEnvironment {
    const RELATION: DbRelationType = DbRelationType::ManagedEnvironment;

    fn id(&self) -> &str { &self.id }
    fn version(&self) -> i64 { self.version }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO managed_environment(id, tenant_key, api_url, credentials_secret, credential_hash, generation,
                 dispatched_generation, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                self.id, self.tenant_key, self.fields.api_url, self.fields.credentials_secret,
                self.fields.credential_hash, self.generation, self.dispatched_generation, self.version
            ],
        )
    }

    fn update(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE managed_environment SET api_url = ?3, credentials_secret = ?4, credential_hash = ?5,
                 generation = ?6, dispatched_generation = ?7, version = version + 1
             WHERE id = ?1 AND version = ?2 AND gc_pending = 0",
            params![
                self.id, self.version, self.fields.api_url, self.fields.credentials_secret,
                self.fields.credential_hash, self.generation, self.dispatched_generation
            ],
        )
    }

    fn select(conn: &Connection, id: &str) -> rusqlite::Result<Option<Self>> {
        conn.query_row(
            "SELECT id, tenant_key, api_url, credentials_secret, credential_hash, generation, dispatched_generation, version
             FROM managed_environment WHERE id = ?1 AND gc_pending = 0",
            [id],
            |r| {
                Ok(Self {
                    id: r.get(0)?,
                    tenant_key: r.get(1)?,
                    fields: EnvironmentFields { api_url: r.get(2)?, credentials_secret: r.get(3)?, credential_hash: r.get(4)? },
                    generation: r.get(5)?,
                    dispatched_generation: r.get(6)?,
                    version: r.get(7)?,
                })
            },
        )
        .optional()
    }
}

// ---- repository_credential ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCredentialFields {
    pub repo_url: String,
    pub secret_name: String,
    pub credential_hash: String,
}

impl RepoCredentialFields {
    pub fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        field_diff(&mut out, "repository", self.repo_url != other.repo_url);
        field_diff(&mut out, "secret", self.secret_name != other.secret_name);
        field_diff(&mut out, "credentials", self.credential_hash != other.credential_hash);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryCredential {
    pub id: String,
    pub tenant_key: String,
    pub fields: RepoCredentialFields,
    pub generation: i64,
    /// Last generation handed to the engine as an Operation.
    pub dispatched_generation: i64,
    pub version: i64,
}

impl EntityRow for RepositoryCredential {
    const RELATION: DbRelationType = DbRelationType::RepositoryCredential;

    fn id(&self) -> &str { &self.id }
    fn version(&self) -> i64 { self.version }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO repository_credential(id, tenant_key, repo_url, secret_name, credential_hash, generation,
                 dispatched_generation, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                self.id, self.tenant_key, self.fields.repo_url, self.fields.secret_name,
                self.fields.credential_hash, self.generation, self.dispatched_generation, self.version
            ],
        )
    }

    fn update(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE repository_credential SET repo_url = ?3, secret_name = ?4, credential_hash = ?5,
                 generation = ?6, dispatched_generation = ?7, version = version + 1
             WHERE id = ?1 AND version = ?2 AND gc_pending = 0",
            params![
                self.id, self.version, self.fields.repo_url, self.fields.secret_name,
                self.fields.credential_hash, self.generation, self.dispatched_generation
            ],
        )
    }

    fn select(conn: &Connection, id: &str) -> rusqlite::Result<Option<Self>> {
        conn.query_row(
            "SELECT id, tenant_key, repo_url, secret_name, credential_hash, generation, dispatched_generation, version
             FROM repository_credential WHERE id = ?1 AND gc_pending = 0",
            [id],
            |r| {
                Ok(Self {
                    id: r.get(0)?,
                    tenant_key: r.get(1)?,
                    fields: RepoCredentialFields { repo_url: r.get(2)?, secret_name: r.get(3)?, credential_hash: r.get(4)? },
                    generation: r.get(5)?,
                    dispatched_generation: r.get(6)?,
                    version: r.get(7)?,
                })
            },
        )
        .optional()
    }
}

// ---- sync_run ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunFields {
    pub deployment_id: String,
    pub revision: String,
}

impl SyncRunFields {
    pub fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        field_diff(&mut out, "gitopsDeploymentName", self.deployment_id != other.deployment_id);
        field_diff(&mut out, "revisionID", self.revision != other.revision);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub id: String,
    pub tenant_key: String,
    pub fields: SyncRunFields,
    pub generation: i64,
    /// Last generation handed to the engine as an Operation.
    pub dispatched_generation: i64,
    pub version: i64,
}

impl EntityRow for SyncRunRecord {
    const RELATION: DbRelationType = DbRelationType::SyncRun;

    fn id(&self) -> &str { &self.id }
    fn version(&self) -> i64 { self.version }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO sync_run(id, tenant_key, deployment_id, revision, generation, dispatched_generation, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.id, self.tenant_key, self.fields.deployment_id, self.fields.revision, self.generation,
                self.dispatched_generation, self.version
            ],
        )
    }

    fn update(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE sync_run SET deployment_id = ?3, revision = ?4, generation = ?5, dispatched_generation = ?6,
                 version = version + 1
             WHERE id = ?1 AND version = ?2 AND gc_pending = 0",
            params![
                self.id, self.version, self.fields.deployment_id, self.fields.revision, self.generation,
                self.dispatched_generation
            ],
        )
    }

    fn select(conn: &Connection, id: &str) -> rusqlite::Result<Option<Self>> {
        conn.query_row(
            "SELECT id, tenant_key, deployment_id, revision, generation, dispatched_generation, version
             FROM sync_run WHERE id = ?1 AND gc_pending = 0",
            [id],
            |r| {
                Ok(Self {
                    id: r.get(0)?,
                    tenant_key: r.get(1)?,
                    fields: SyncRunFields { deployment_id: r.get(2)?, revision: r.get(3)? },
                    generation: r.get(4)?,
                    dispatched_generation: r.get(5)?,
                    version: r.get(6)?,
                })
            },
        )
        .optional()
    }
}

impl SqliteStore {
    pub fn load<E: EntityRow>(&self, id: &str) -> StoreResult<Option<E>> {
        let db = self.conn()?;
        Ok(E::select(&db, id)?)
    }

    /// Compare-and-swap write. Returns the stored row (with its new version) on success.
    pub fn update<E: EntityRow + Clone>(&self, row: &E) -> StoreResult<E> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let n = row.update(&db)?;
        if n == 0 {
            metrics::counter!("persist_version_conflicts_total", 1u64);
            return Err(StoreError::VersionConflict { table: E::RELATION.table(), id: row.id().to_string() });
        }
        let stored = E::select(&db, row.id())?
            .ok_or_else(|| StoreError::Corrupt(format!("{} {} vanished after update", E::RELATION.table(), row.id())))?;
        metrics::histogram!("persist_update_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(stored)
    }

    /// Entities whose mapping was removed but whose cleanup has not finished.
    pub fn gc_pending(&self) -> StoreResult<Vec<(DbRelationType, String)>> {
        let db = self.conn()?;
        let mut out = Vec::new();
        for rel in [
            DbRelationType::DeploymentTarget,
            DbRelationType::ManagedEnvironment,
            DbRelationType::RepositoryCredential,
            DbRelationType::SyncRun,
        ] {
            let mut stmt = db.prepare(&format!("SELECT id FROM {} WHERE gc_pending = 1", rel.table()))?;
            let ids = stmt.query_map([], |r| r.get::<_, String>(0))?;
            for id in ids {
                out.push((rel, id?));
            }
        }
        Ok(out)
    }

    /// Physically removes an entity row and every operation record that points at it.
    pub fn purge_entity(&self, rel: DbRelationType, id: &str) -> StoreResult<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(&format!("DELETE FROM {} WHERE id = ?1", rel.table()), [id])?;
        tx.execute(
            "DELETE FROM operation_record WHERE resource_type = ?1 AND resource_key = ?2",
            params![rel.as_str(), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Deployment targets that point at the given environment entity.
    pub fn deployments_on_environment(&self, env_id: &str) -> StoreResult<Vec<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT id FROM deployment_target WHERE dest_environment_id = ?1 AND gc_pending = 0")?;
        let ids = stmt.query_map([env_id], |r| r.get::<_, String>(0))?;
        Ok(ids.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
