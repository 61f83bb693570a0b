//! In-memory backend
//!
//! Not durable. Useful for tests and for embedding the runtime behind an
//! external persistence layer.

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use super::{Installation, StateStore};
use crate::error::StorageResult;

/// Installation store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    installations: RwLock<BTreeMap<String, Installation>>,
}

impl MemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with installations
    pub fn with_installations(installations: impl IntoIterator<Item = Installation>) -> Self {
        Self {
            installations: RwLock::new(
                installations
                    .into_iter()
                    .map(|inst| (inst.id.clone(), inst))
                    .collect(),
            ),
        }
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &str) -> StorageResult<Option<Installation>> {
        Ok(self.installations.read().await.get(id).cloned())
    }

    async fn put(&self, installation: Installation) -> StorageResult<()> {
        self.installations
            .write()
            .await
            .insert(installation.id.clone(), installation);
        Ok(())
    }

    async fn delete(&self, id: &str) -> StorageResult<Option<Installation>> {
        Ok(self.installations.write().await.remove(id))
    }

    async fn list(&self) -> StorageResult<Vec<Installation>> {
        Ok(self.installations.read().await.values().cloned().collect())
    }
}
