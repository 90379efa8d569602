//! Residency decisions driven by accelerator memory.

mod common;

use std::sync::Arc;

use common::{chat_request, gateway_with_probe, model_dir};
use llm_gateway::accelerator::{BudgetMemoryProbe, StaticMemoryProbe, UnavailableProbe};
use llm_gateway::engine::scripted::ScriptedBackend;
use llm_gateway::GatewayError;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_model_larger_than_device_fails_without_eviction() {
    let dir = model_dir(&[("small.gguf", 100), ("huge.gguf", 5_000)]);
    let backend = ScriptedBackend::new();
    let gw = gateway_with_probe(&dir, backend.clone(), Arc::new(StaticMemoryProbe::new(1_000, 900))).await;
    let cancel = CancellationToken::new();

    gw.handler().chat(chat_request("small.gguf", "hi"), &cancel).await.unwrap();
    let small = gw.registry().get("small.gguf").await.unwrap();
    assert!(small.is_loaded());

    let error = gw
        .handler()
        .chat(chat_request("huge.gguf", "hi"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(error, GatewayError::InsufficientMemory { required: 5_000, total: 1_000, .. }));
    assert_eq!(error.status_code(), 507);
    assert!(small.is_loaded());
    assert_eq!(backend.stats().weights_disposed, 0);
}

#[tokio::test]
async fn test_budget_keeps_one_resident_model() {
    let dir = model_dir(&[("a.gguf", 600), ("b.gguf", 600)]);
    let backend = ScriptedBackend::new();
    let gw = gateway_with_probe(&dir, backend.clone(), Arc::new(BudgetMemoryProbe::new(1_000))).await;
    let cancel = CancellationToken::new();

    gw.handler().chat(chat_request("a.gguf", "hi"), &cancel).await.unwrap();
    gw.handler().chat(chat_request("b.gguf", "hi"), &cancel).await.unwrap();

    let a = gw.registry().get("a.gguf").await.unwrap();
    let b = gw.registry().get("b.gguf").await.unwrap();
    assert!(!a.is_loaded());
    assert!(b.is_loaded());
    assert_eq!(gw.registry().resident_count().await, 1);
    assert_eq!(backend.stats().weights_disposed, 1);

    // Evicted weights come back on the next request.
    gw.handler().chat(chat_request("a.gguf", "again"), &cancel).await.unwrap();
    assert!(a.is_loaded());
    assert_eq!(backend.stats().weight_loads, 3);
}

#[tokio::test]
async fn test_unknown_memory_evicts_everything_first() {
    let dir = model_dir(&[("a.gguf", 10), ("b.gguf", 10)]);
    let gw = gateway_with_probe(&dir, ScriptedBackend::new(), Arc::new(UnavailableProbe)).await;
    let cancel = CancellationToken::new();

    gw.handler().chat(chat_request("a.gguf", "hi"), &cancel).await.unwrap();
    gw.handler().chat(chat_request("b.gguf", "hi"), &cancel).await.unwrap();

    assert!(!gw.registry().get("a.gguf").await.unwrap().is_loaded());
    assert!(gw.registry().get("b.gguf").await.unwrap().is_loaded());
}

#[tokio::test]
async fn test_repeat_requests_reuse_resident_weights() {
    let dir = model_dir(&[("a.gguf", 10)]);
    let backend = ScriptedBackend::new();
    let gw = gateway_with_probe(&dir, backend.clone(), Arc::new(UnavailableProbe)).await;
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        gw.handler().chat(chat_request("a.gguf", "hi"), &cancel).await.unwrap();
    }
    let stats = backend.stats();
    assert_eq!(stats.weight_loads, 1);
    assert_eq!(stats.contexts_created, 1);
    assert_eq!(stats.sequences_created, 1);
}
