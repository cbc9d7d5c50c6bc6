//! Durable node store adapters.
//!
//! The store is the system of record across process restarts: loaded once
//! at startup, rewritten as a full snapshot after registration, eviction,
//! and every monitor pass. No cross-instance locking is assumed — node
//! health is self-healing via periodic probes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use slipstream_core::domain::node::NodeSnapshot;
use slipstream_core::{Error, Result};

/// Persistence contract for node status snapshots, keyed by URL.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Loads every persisted node snapshot.
    async fn load_all(&self) -> Result<HashMap<String, NodeSnapshot>>;

    /// Replaces the persisted set with `nodes`.
    async fn save_all(&self, nodes: &HashMap<String, NodeSnapshot>) -> Result<()>;

    /// Deletes the snapshot stored under `url`, if any.
    async fn remove_one(&self, url: &str) -> Result<()>;
}

/// In-memory store used by tests and single-shot tooling.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, NodeSnapshot>>,
}

impl MemoryStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn load_all(&self) -> Result<HashMap<String, NodeSnapshot>> {
        Ok(self.lock().clone())
    }

    async fn save_all(&self, nodes: &HashMap<String, NodeSnapshot>) -> Result<()> {
        *self.lock() = nodes.clone();
        Ok(())
    }

    async fn remove_one(&self, url: &str) -> Result<()> {
        self.lock().remove(url);
        Ok(())
    }
}

impl MemoryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, NodeSnapshot>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Store backed by a single JSON document on disk.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-save never truncates the document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Creates a store persisting to `path`. The file may not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The document path this store persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NodeStore for JsonFileStore {
    async fn load_all(&self) -> Result<HashMap<String, NodeSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(err) => return Err(Error::store(err)),
        };

        serde_json::from_slice(&bytes).map_err(Error::store)
    }

    async fn save_all(&self, nodes: &HashMap<String, NodeSnapshot>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(nodes).map_err(Error::store)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(Error::store)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(Error::store)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(Error::store)
    }

    async fn remove_one(&self, url: &str) -> Result<()> {
        let mut nodes = self.load_all().await?;
        if nodes.remove(url).is_some() {
            self.save_all(&nodes).await?;
        }
        Ok(())
    }
}
