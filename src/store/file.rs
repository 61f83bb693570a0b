//! JSON file backend
//!
//! The whole store is one JSON document:
//!
//! ```json
//! { "version": 1, "installations": { "<id>": { ...record... } } }
//! ```
//!
//! Each mutation writes the next document to `<file>.tmp`, syncs it and
//! renames it over the original, so a reader (or a restart) only ever sees a
//! complete document. The in-memory copy is replaced only after the rename
//! succeeds.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{Installation, StateStore};
use crate::error::{StorageError, StorageResult};

/// On-disk format version
const STATE_VERSION: u32 = 1;

#[derive(Deserialize)]
struct StateDocument {
    version: u32,
    #[serde(default)]
    installations: BTreeMap<String, Installation>,
}

#[derive(Serialize)]
struct StateDocumentRef<'a> {
    version: u32,
    installations: &'a BTreeMap<String, Installation>,
}

/// Installation store persisted to a single JSON file.
///
/// Writes hold the lock across the disk write, so they are serialized and
/// memory never runs ahead of disk. Each mutation runs on its own task: a
/// caller that drops the future does not stop the write, and the in-memory
/// map is still updated once the file is replaced.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    installations: RwLock<BTreeMap<String, Installation>>,
}

impl FileStateStore {
    /// Open the store, loading existing state.
    ///
    /// A missing or empty file yields an empty store. Any other read or parse
    /// failure is returned; callers must not continue with a fresh store.
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let load_path = path.clone();
        let installations = tokio::task::spawn_blocking(move || load_document(&load_path))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))??;

        info!(
            path = %path.display(),
            installations = installations.len(),
            "Loaded installation state"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                installations: RwLock::new(installations),
            }),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Inner {
    async fn persist(&self, next: &BTreeMap<String, Installation>) -> StorageResult<()> {
        let content = serde_json::to_vec_pretty(&StateDocumentRef {
            version: STATE_VERSION,
            installations: next,
        })
        .map_err(|e| StorageError::Serialize(e.to_string()))?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &content))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    async fn put(&self, installation: Installation) -> StorageResult<()> {
        let mut current = self.installations.write().await;
        let mut next = current.clone();
        let id = installation.id.clone();
        next.insert(id.clone(), installation);

        self.persist(&next).await?;
        *current = next;

        debug!(installation_id = %id, "Installation persisted");
        Ok(())
    }

    async fn delete(&self, id: &str) -> StorageResult<Option<Installation>> {
        let mut current = self.installations.write().await;
        if !current.contains_key(id) {
            return Ok(None);
        }

        let mut next = current.clone();
        let removed = next.remove(id);

        self.persist(&next).await?;
        *current = next;

        debug!(installation_id = %id, "Installation removed from state file");
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, id: &str) -> StorageResult<Option<Installation>> {
        Ok(self.inner.installations.read().await.get(id).cloned())
    }

    async fn put(&self, installation: Installation) -> StorageResult<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.put(installation).await })
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    async fn delete(&self, id: &str) -> StorageResult<Option<Installation>> {
        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        tokio::spawn(async move { inner.delete(&id).await })
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    async fn list(&self) -> StorageResult<Vec<Installation>> {
        Ok(self.inner.installations.read().await.values().cloned().collect())
    }
}

fn load_document(path: &Path) -> StorageResult<BTreeMap<String, Installation>> {
    let display = path.display().to_string();

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(StorageError::Io {
                path: display,
                source,
            })
        }
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }

    let document: StateDocument =
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
            path: display.clone(),
            reason: e.to_string(),
        })?;

    if document.version != STATE_VERSION {
        return Err(StorageError::Corrupt {
            path: display,
            reason: format!(
                "unsupported state version {} (expected {STATE_VERSION})",
                document.version
            ),
        });
    }

    if let Some((key, record)) = document
        .installations
        .iter()
        .find(|(key, record)| **key != record.id)
    {
        return Err(StorageError::Corrupt {
            path: display,
            reason: format!("record keyed {key} carries id {}", record.id),
        });
    }

    Ok(document.installations)
}

fn write_atomic(path: &Path, content: &[u8]) -> StorageResult<()> {
    let io_err = |source: std::io::Error| StorageError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let mut file = File::create(&temp_path).map_err(io_err)?;
    file.write_all(content).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&temp_path, path).map_err(io_err)?;

    // Make the rename itself durable
    #[cfg(unix)]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(io_err)?;
    }

    Ok(())
}
