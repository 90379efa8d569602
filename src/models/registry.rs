//! Registry of discovered model files.
//!
//! One [`DirectoryWatcher`] per root feeds full path lists into
//! [`ModelRegistry::sync_root`], which opens handles for new files and
//! disposes handles whose files are gone. Before any weights are loaded the
//! registry checks accelerator memory and evicts resident models if needed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handle::ModelHandle;
use super::watcher::{DirectoryWatcher, WatchError, WatchEvent};
use crate::accelerator::MemoryProbe;
use crate::engine::{InferenceBackend, InferenceError, ModelWeights};
use crate::error::GatewayError;
use crate::sync;

struct RootWatch {
    watcher: DirectoryWatcher,
    task: JoinHandle<()>,
}

/// Owned set of model handles, keyed by absolute path.
pub struct ModelRegistry {
    backend: Arc<dyn InferenceBackend>,
    probe: Arc<dyn MemoryProbe>,
    extension: String,
    handles: RwLock<BTreeMap<PathBuf, ModelHandle>>,
    /// Serializes the memory check with the weight load that follows it.
    allocation: sync::Mutex,
    watches: Mutex<Vec<RootWatch>>,
}

impl ModelRegistry {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        probe: Arc<dyn MemoryProbe>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            probe,
            extension: extension.into(),
            handles: RwLock::new(BTreeMap::new()),
            allocation: sync::Mutex::new(),
            watches: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    pub fn probe(&self) -> &Arc<dyn MemoryProbe> {
        &self.probe
    }

    /// Start tracking `root`. Returns once the initial scan is applied.
    ///
    /// Later list changes are applied by a background task that holds only a
    /// weak reference, so dropping the registry ends it.
    pub async fn watch(self: &Arc<Self>, root: impl AsRef<Path>) -> Result<PathBuf, WatchError> {
        let (watcher, mut events) = DirectoryWatcher::start(root, &self.extension).await?;
        let root = watcher.root().to_path_buf();
        if self.watched_roots().contains(&root) {
            return Ok(root);
        }

        // The first event is always the seeded list.
        if let Some(WatchEvent::ListChanged(paths)) = events.recv().await {
            self.sync_root(&root, &paths).await;
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        let task_root = root.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let WatchEvent::ListChanged(paths) = event else {
                    continue;
                };
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sync_root(&task_root, &paths).await;
            }
        });

        self.watches.lock().push(RootWatch { watcher, task });
        Ok(root)
    }

    pub fn watched_roots(&self) -> Vec<PathBuf> {
        self.watches
            .lock()
            .iter()
            .map(|w| w.watcher.root().to_path_buf())
            .collect()
    }

    /// Apply the full current path list for `root`.
    ///
    /// Handles under `root` whose path is absent are disposed before they are
    /// dropped. New paths get a handle; a path whose file cannot be opened is
    /// skipped and retried on the next list. Present handles without
    /// metadata read it again.
    pub async fn sync_root(&self, root: &Path, paths: &[PathBuf]) {
        let present: BTreeSet<&Path> = paths.iter().map(PathBuf::as_path).collect();
        let (missing, stale, unresolved) = {
            let handles = self.handles.read().await;
            let missing: Vec<PathBuf> = paths
                .iter()
                .filter(|path| !handles.contains_key(*path))
                .cloned()
                .collect();
            let stale: Vec<ModelHandle> = handles
                .values()
                .filter(|h| h.root() == root && !present.contains(h.path()))
                .cloned()
                .collect();
            let unresolved: Vec<ModelHandle> = handles
                .values()
                .filter(|h| h.root() == root && present.contains(h.path()) && !h.has_metadata())
                .cloned()
                .collect();
            (missing, stale, unresolved)
        };

        for handle in stale {
            if let Err(error) = handle.dispose().await {
                warn!(model_id = %handle.id(), %error, "dispose failed for removed model");
            }
            self.handles.write().await.remove(handle.path());
            info!(model_id = %handle.id(), "model removed");
        }

        for handle in unresolved {
            handle.retry_metadata().await;
        }

        for path in missing {
            match ModelHandle::open(root, &path, self.backend.clone()).await {
                Ok(handle) => {
                    let mut handles = self.handles.write().await;
                    if handles.contains_key(&path) {
                        continue;
                    }
                    info!(
                        model_id = %handle.id(),
                        bytes = handle.size_bytes(),
                        metadata = handle.has_metadata(),
                        "model added"
                    );
                    handles.insert(path, handle);
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping model file");
                }
            }
        }
    }

    /// Exact match on the registry id.
    pub async fn get(&self, id: &str) -> Result<ModelHandle, GatewayError> {
        self.handles
            .read()
            .await
            .values()
            .find(|h| h.id() == id)
            .cloned()
            .ok_or_else(|| GatewayError::ModelNotFound(id.to_string()))
    }

    /// Every tracked handle, sorted by id.
    pub async fn list(&self) -> Vec<ModelHandle> {
        let mut handles: Vec<ModelHandle> = self.handles.read().await.values().cloned().collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    pub async fn count(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn resident_count(&self) -> usize {
        self.handles.read().await.values().filter(|h| h.is_loaded()).count()
    }

    /// Bytes of weights currently resident across all handles.
    pub async fn resident_bytes(&self) -> u64 {
        self.handles
            .read()
            .await
            .values()
            .map(ModelHandle::resident_bytes)
            .sum()
    }

    /// Make room for `handle`'s weights.
    ///
    /// Nothing happens if the weights are already resident. A model larger
    /// than the whole device fails without evicting anything. Otherwise,
    /// when free memory is short or cannot be queried, every resident model
    /// is unloaded.
    pub async fn prepare_load(&self, handle: &ModelHandle) -> Result<(), GatewayError> {
        if handle.is_loaded() {
            return Ok(());
        }
        let required = handle.size_bytes();
        let resident = self.resident_bytes().await;

        match self.probe.memory_usage(resident).await {
            Err(error) => {
                warn!(model_id = %handle.id(), %error, "memory query failed, evicting all models");
                self.free_all().await;
            }
            Ok(usage) if usage.total < required => {
                return Err(GatewayError::InsufficientMemory {
                    model_id: handle.id().to_string(),
                    required,
                    total: usage.total,
                });
            }
            // TODO: evict least recently used handles until the target fits
            // instead of releasing everything.
            Ok(usage) if usage.free < required => {
                info!(
                    model_id = %handle.id(),
                    required,
                    free = usage.free,
                    total = usage.total,
                    "evicting resident models"
                );
                self.free_all().await;
            }
            Ok(_) => {}
        }
        Ok(())
    }

    /// Check memory and load `handle`'s weights under the allocation lock.
    ///
    /// Resident weights are returned without taking the lock, so a model in
    /// use never waits for another model's load.
    pub async fn ensure_loaded(
        &self,
        handle: &ModelHandle,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ModelWeights>, GatewayError> {
        if let Some(weights) = handle.resident_weights() {
            return Ok(weights);
        }
        let _allocation = tokio::select! {
            guard = self.allocation.acquire() => guard,
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        self.prepare_load(handle).await?;
        handle.load_weights().await.map_err(|error| match error {
            InferenceError::Cancelled => GatewayError::Cancelled,
            other => GatewayError::load_failure(handle.id(), other),
        })
    }

    /// Unload every handle concurrently. Failures are logged, not returned.
    pub async fn free_all(&self) {
        let handles: Vec<ModelHandle> = self.handles.read().await.values().cloned().collect();
        let results = join_all(handles.iter().map(|handle| handle.unload())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(error) = result {
                error!(model_id = %handle.id(), %error, "unload failed");
            }
        }
    }

    /// Stop every directory watcher. Tracked handles stay.
    pub fn stop_watching(&self) {
        let watches = std::mem::take(&mut *self.watches.lock());
        for mut watch in watches {
            watch.watcher.stop();
            watch.task.abort();
        }
    }

    /// Stop watching, unload every model and release its metadata.
    pub async fn dispose(&self) {
        self.stop_watching();
        let handles: Vec<ModelHandle> = std::mem::take(&mut *self.handles.write().await)
            .into_values()
            .collect();
        let results = join_all(handles.iter().map(|handle| handle.dispose())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(error) = result {
                error!(model_id = %handle.id(), %error, "dispose failed");
            }
        }
        info!(models = handles.len(), "registry disposed");
    }
}

impl Drop for ModelRegistry {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
