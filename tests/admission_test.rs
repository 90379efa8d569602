//! Admission gates and per-model sequence locks.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{chat_request, gateway, model_dir};
use llm_gateway::api::protocol::{CompletionRequest, Prompt};
use llm_gateway::engine::scripted::ScriptedBackend;
use llm_gateway::session::{ChatCompletion, PlaceholderAnnotator};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Endpoint gates
// =============================================================================

#[tokio::test]
async fn test_chat_requests_finish_in_arrival_order() {
    let dir = model_dir(&[("a.gguf", 16), ("b.gguf", 16)]);
    let backend = ScriptedBackend::new()
        .with_echo()
        .with_fragment_delay(Duration::from_millis(5));
    let gw = gateway(&dir, backend.clone()).await;
    let handler = gw.handler().clone();
    let finished = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    // Alternate models so only the chat gate orders them.
    for (i, model) in ["a.gguf", "b.gguf", "a.gguf", "b.gguf"].into_iter().enumerate() {
        let handler = handler.clone();
        let finished = finished.clone();
        tasks.push(tokio::spawn(async move {
            let response = handler
                .chat(chat_request(model, &format!("req {i}")), &CancellationToken::new())
                .await
                .unwrap();
            finished.lock().push(response.choices[0].message.content.clone());
        }));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    for task in tasks {
        task.await.unwrap();
    }

    let finished = finished.lock().clone();
    assert_eq!(finished, vec!["echo: req 0", "echo: req 1", "echo: req 2", "echo: req 3"]);
    assert_eq!(backend.stats().peak_concurrent_generations, 1);
}

#[tokio::test]
async fn test_endpoint_classes_run_concurrently() {
    let dir = model_dir(&[("a.gguf", 16), ("b.gguf", 16)]);
    let backend = ScriptedBackend::new()
        .with_reply("one two three four five six")
        .with_fragment_delay(Duration::from_millis(10));
    let gw = gateway(&dir, backend.clone()).await;
    let handler = gw.handler();
    let cancel = CancellationToken::new();

    let chat = handler.chat(chat_request("a.gguf", "hi"), &cancel);
    let completion = handler.completion(
        CompletionRequest::new("b.gguf", Prompt::One("hi".into())),
        &cancel,
    );
    let (chat, completion) = tokio::join!(chat, completion);
    chat.unwrap();
    completion.unwrap();

    assert_eq!(backend.stats().peak_concurrent_generations, 2);
}

#[tokio::test]
async fn test_cancel_while_queued_at_gate() {
    let dir = model_dir(&[("a.gguf", 16)]);
    let gw = gateway(&dir, ScriptedBackend::new()).await;
    let handler = gw.handler();

    let held = handler.gates().chat.acquire().await;
    let cancel = CancellationToken::new();
    let queued = handler.chat(chat_request("a.gguf", "hi"), &cancel);
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(queued, canceller);

    assert!(result.unwrap_err().is_cancelled());
    held.release();
    assert!(!handler.gates().chat.is_locked());
    assert_eq!(handler.shutdown().in_flight_count(), 0);
}

// =============================================================================
// Sequence lock
// =============================================================================

#[tokio::test]
async fn test_second_session_locks_after_first_disposes() {
    let dir = model_dir(&[("a.gguf", 16)]);
    let gw = gateway(&dir, ScriptedBackend::new()).await;
    let registry = gw.registry().clone();
    let cancel = CancellationToken::new();

    let first = ChatCompletion::open(&registry, &PlaceholderAnnotator, chat_request("a.gguf", "1"), &cancel)
        .await
        .unwrap();

    let second = {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            ChatCompletion::open(&registry, &PlaceholderAnnotator, chat_request("a.gguf", "2"), &cancel)
                .await
                .map(|session| session.lock_acquired_at())
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!second.is_finished());

    let released_at = Instant::now();
    first.dispose();
    let acquired_at = second.await.unwrap().unwrap();
    assert!(acquired_at >= released_at);
}

#[tokio::test]
async fn test_dropped_session_releases_sequence_lock() {
    let dir = model_dir(&[("a.gguf", 16)]);
    let gw = gateway(&dir, ScriptedBackend::new()).await;
    let registry = gw.registry().clone();

    let session = ChatCompletion::open(
        &registry,
        &PlaceholderAnnotator,
        chat_request("a.gguf", "hi"),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    let handle = session.handle().clone();
    assert!(handle.sequence_lock().is_locked());

    drop(session);
    assert!(!handle.sequence_lock().is_locked());
}
