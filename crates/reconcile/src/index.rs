use std::sync::Arc;

use kanso_core::{KansoResult, ResourceKey, SecretIndex};
use kanso_persist::SqliteStore;

/// Secret fan-out lookup backed by the entity tables.
pub struct StoreSecretIndex {
    store: Arc<SqliteStore>,
}

impl StoreSecretIndex {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

impl SecretIndex for StoreSecretIndex {
    fn referencing(&self, namespace: &str, secret: &str) -> KansoResult<Vec<ResourceKey>> {
        Ok(self.store.referencing_secret(namespace, secret)?)
    }
}
