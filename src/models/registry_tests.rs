//! Tests for discovery syncing and memory-driven eviction.

use super::*;
use crate::accelerator::{BudgetMemoryProbe, StaticMemoryProbe, UnavailableProbe};
use crate::engine::scripted::ScriptedBackend;
use std::time::Duration;
use tempfile::TempDir;

fn model_file(dir: &TempDir, relative: &str, bytes: usize) -> PathBuf {
    let path = dir.path().join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, vec![0u8; bytes]).unwrap();
    path
}

fn registry(backend: &ScriptedBackend, probe: impl MemoryProbe + 'static) -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::new(
        Arc::new(backend.clone()),
        Arc::new(probe),
        "gguf",
    ))
}

async fn wait_for_count(registry: &ModelRegistry, expected: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while registry.count().await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("registry never reached the expected size");
}

#[tokio::test]
async fn watch_applies_initial_scan_before_returning() {
    let dir = TempDir::new().unwrap();
    model_file(&dir, "b/second.gguf", 8);
    model_file(&dir, "a.gguf", 8);
    model_file(&dir, "readme.md", 8);
    let registry = registry(&ScriptedBackend::new(), UnavailableProbe);

    registry.watch(dir.path()).await.unwrap();

    let ids: Vec<String> = registry.list().await.iter().map(|h| h.id().to_string()).collect();
    assert_eq!(ids, vec!["a.gguf", "b/second.gguf"]);
    assert_eq!(registry.get("b/second.gguf").await.unwrap().size_bytes(), 8);
    assert!(matches!(
        registry.get("missing.gguf").await,
        Err(GatewayError::ModelNotFound(_))
    ));
}

#[tokio::test]
async fn watched_files_are_added_and_removed() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::new();
    let registry = registry(&backend, UnavailableProbe);
    let root = registry.watch(dir.path()).await.unwrap();
    assert_eq!(registry.count().await, 0);

    let path = root.join("late.gguf");
    std::fs::write(&path, b"weights").unwrap();
    wait_for_count(&registry, 1).await;

    let handle = registry.get("late.gguf").await.unwrap();
    handle.load_weights().await.unwrap();
    std::fs::remove_file(&path).unwrap();
    wait_for_count(&registry, 0).await;

    assert!(!handle.is_loaded());
    assert!(!handle.has_metadata());
    assert_eq!(backend.stats().weights_disposed, 1);
}

#[tokio::test]
async fn sync_only_removes_handles_of_the_same_root() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let a = model_file(&first, "a.gguf", 8);
    let b = model_file(&second, "b.gguf", 8);
    let registry = registry(&ScriptedBackend::new(), UnavailableProbe);

    registry.sync_root(first.path(), &[a]).await;
    registry.sync_root(second.path(), &[b]).await;
    assert_eq!(registry.count().await, 2);

    registry.sync_root(first.path(), &[]).await;
    assert_eq!(registry.count().await, 1);
    assert!(registry.get("b.gguf").await.is_ok());
}

#[tokio::test]
async fn unreadable_metadata_is_still_tracked() {
    let dir = TempDir::new().unwrap();
    let path = model_file(&dir, "broken.gguf", 8);
    let backend = ScriptedBackend::new().failing_metadata_for("broken.gguf");
    let registry = registry(&backend, UnavailableProbe);

    registry.sync_root(dir.path(), &[path]).await;
    let handle = registry.get("broken.gguf").await.unwrap();
    assert!(!handle.has_metadata());
}

#[tokio::test]
async fn metadata_is_retried_on_next_list() {
    let dir = TempDir::new().unwrap();
    let path = model_file(&dir, "broken.gguf", 8);
    let backend = ScriptedBackend::new().failing_metadata_for("broken.gguf");
    let registry = registry(&backend, UnavailableProbe);

    registry.sync_root(dir.path(), &[path.clone()]).await;
    registry.sync_root(dir.path(), &[path.clone()]).await;
    let handle = registry.get("broken.gguf").await.unwrap();
    assert!(!handle.has_metadata());
    assert_eq!(backend.stats().metadata_loads, 2);

    backend.repair_metadata("broken.gguf");
    registry.sync_root(dir.path(), &[path.clone()]).await;
    assert!(handle.has_metadata());
    assert_eq!(handle.info().unwrap().metadata.name.as_deref(), Some("broken"));

    registry.sync_root(dir.path(), &[path]).await;
    assert_eq!(backend.stats().metadata_loads, 3);
}

#[tokio::test]
async fn vanished_path_is_skipped() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&ScriptedBackend::new(), UnavailableProbe);

    registry.sync_root(dir.path(), &[dir.path().join("gone.gguf")]).await;
    assert_eq!(registry.count().await, 0);
}

#[tokio::test]
async fn model_larger_than_device_fails_without_eviction() {
    let dir = TempDir::new().unwrap();
    let small = model_file(&dir, "small.gguf", 100);
    let huge = model_file(&dir, "huge.gguf", 5_000);
    let registry = registry(&ScriptedBackend::new(), StaticMemoryProbe::new(1_000, 0));
    registry.sync_root(dir.path(), &[small, huge]).await;

    let small = registry.get("small.gguf").await.unwrap();
    small.load_weights().await.unwrap();

    let huge = registry.get("huge.gguf").await.unwrap();
    let result = registry.ensure_loaded(&huge, &CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(GatewayError::InsufficientMemory { required: 5_000, total: 1_000, .. })
    ));
    assert!(small.is_loaded());
    assert!(!huge.is_loaded());
}

#[tokio::test]
async fn short_free_memory_evicts_every_resident_model() {
    let dir = TempDir::new().unwrap();
    let a = model_file(&dir, "a.gguf", 100);
    let b = model_file(&dir, "b.gguf", 100);
    let target = model_file(&dir, "target.gguf", 100);
    let registry = registry(&ScriptedBackend::new(), StaticMemoryProbe::new(1_000, 50));
    registry.sync_root(dir.path(), &[a, b, target]).await;

    for id in ["a.gguf", "b.gguf"] {
        registry.get(id).await.unwrap().load_weights().await.unwrap();
    }
    assert_eq!(registry.resident_count().await, 2);

    let target = registry.get("target.gguf").await.unwrap();
    registry.ensure_loaded(&target, &CancellationToken::new()).await.unwrap();

    assert_eq!(registry.resident_count().await, 1);
    assert!(target.is_loaded());
}

#[tokio::test]
async fn failed_memory_query_evicts_everything() {
    let dir = TempDir::new().unwrap();
    let a = model_file(&dir, "a.gguf", 10);
    let b = model_file(&dir, "b.gguf", 10);
    let registry = registry(&ScriptedBackend::new(), UnavailableProbe);
    registry.sync_root(dir.path(), &[a, b]).await;

    let a = registry.get("a.gguf").await.unwrap();
    a.load_weights().await.unwrap();
    let b = registry.get("b.gguf").await.unwrap();
    registry.prepare_load(&b).await.unwrap();

    assert!(!a.is_loaded());
}

#[tokio::test]
async fn resident_model_skips_the_memory_check() {
    let dir = TempDir::new().unwrap();
    let path = model_file(&dir, "a.gguf", 10);
    let registry = registry(&ScriptedBackend::new(), UnavailableProbe);
    registry.sync_root(dir.path(), &[path]).await;

    let a = registry.get("a.gguf").await.unwrap();
    a.load_weights().await.unwrap();
    registry.prepare_load(&a).await.unwrap();
    assert!(a.is_loaded());
}

#[tokio::test]
async fn budget_allows_one_resident_model_at_a_time() {
    let dir = TempDir::new().unwrap();
    let a = model_file(&dir, "a.gguf", 600);
    let b = model_file(&dir, "b.gguf", 600);
    let backend = ScriptedBackend::new().with_load_delay(Duration::from_millis(20));
    let registry = registry(&backend, BudgetMemoryProbe::new(1_000));
    registry.sync_root(dir.path(), &[a, b]).await;

    let cancel = CancellationToken::new();
    let a = registry.get("a.gguf").await.unwrap();
    let b = registry.get("b.gguf").await.unwrap();
    let (first, second) = tokio::join!(
        registry.ensure_loaded(&a, &cancel),
        registry.ensure_loaded(&b, &cancel)
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(registry.resident_count().await, 1);
    assert!(b.is_loaded());
    assert!(registry.resident_bytes().await <= 1_000);
}

#[tokio::test]
async fn weight_failure_is_a_load_failure() {
    let dir = TempDir::new().unwrap();
    let path = model_file(&dir, "bad.gguf", 10);
    let backend = ScriptedBackend::new().failing_weights_for("bad.gguf");
    let registry = registry(&backend, StaticMemoryProbe::new(1_000, 1_000));
    registry.sync_root(dir.path(), &[path]).await;

    let handle = registry.get("bad.gguf").await.unwrap();
    let result = registry.ensure_loaded(&handle, &CancellationToken::new()).await;
    assert!(matches!(result, Err(GatewayError::LoadFailure { .. })));
    assert!(!handle.is_loaded());
}

#[tokio::test]
async fn dispose_releases_every_handle_and_watcher() {
    let dir = TempDir::new().unwrap();
    model_file(&dir, "a.gguf", 10);
    let backend = ScriptedBackend::new();
    let registry = registry(&backend, UnavailableProbe);
    registry.watch(dir.path()).await.unwrap();
    let handle = registry.get("a.gguf").await.unwrap();
    handle.load_weights().await.unwrap();

    registry.dispose().await;

    assert!(registry.watched_roots().is_empty());
    assert_eq!(registry.count().await, 0);
    assert!(!handle.has_metadata());
    assert_eq!(backend.stats().weights_disposed, 1);
}

#[tokio::test]
async fn resident_model_does_not_wait_for_another_load() {
    let dir = TempDir::new().unwrap();
    model_file(&dir, "a.gguf", 8);
    model_file(&dir, "b.gguf", 8);
    let backend = ScriptedBackend::new().with_load_delay(Duration::from_millis(500));
    let registry = registry(&backend, StaticMemoryProbe::new(1 << 30, 1 << 30));
    registry.watch(dir.path()).await.unwrap();
    let a = registry.get("a.gguf").await.unwrap();
    let b = registry.get("b.gguf").await.unwrap();
    let cancel = CancellationToken::new();
    registry.ensure_loaded(&b, &cancel).await.unwrap();

    let loading = {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { registry.ensure_loaded(&a, &cancel).await.map(|_| ()) })
    };
    while !registry.allocation.is_locked() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let started = std::time::Instant::now();
    registry.ensure_loaded(&b, &cancel).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(250));
    assert!(registry.allocation.is_locked());

    loading.await.unwrap().unwrap();
    assert_eq!(backend.stats().weight_loads, 2);
}
