//! Streamed responses end to end: framing, usage, cancellation.

mod common;

use std::time::Duration;

use common::{chat_request, gateway, model_dir, sse_payloads, BrokenPipe};
use llm_gateway::api::protocol::{CompletionRequest, Prompt, StreamOptions};
use llm_gateway::api::{StreamOutcome, DONE_SENTINEL};
use llm_gateway::engine::scripted::ScriptedBackend;
use llm_gateway::GatewayError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_chat_stream_frames_and_sentinel() {
    let dir = model_dir(&[("a.gguf", 16)]);
    let gw = gateway(&dir, ScriptedBackend::new().with_reply("one two three")).await;

    let mut out = Vec::new();
    let outcome = gw
        .handler()
        .chat_stream(chat_request("a.gguf", "hi"), &mut out, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);

    let payloads = sse_payloads(&out);
    assert_eq!(payloads.last().map(String::as_str), Some(DONE_SENTINEL));

    let chunks: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "one two three");

    let last = chunks.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert!(chunks[..chunks.len() - 1]
        .iter()
        .all(|c| c["choices"][0]["finish_reason"].is_null()));
    // Usage only when asked for.
    assert!(chunks.iter().all(|c| c.get("usage").is_none()));
}

#[tokio::test]
async fn test_include_usage_counts_completion_tokens() {
    let dir = model_dir(&[("a.gguf", 16)]);
    let gw = gateway(&dir, ScriptedBackend::new().with_reply("abc def")).await;
    let mut request = chat_request("a.gguf", "hi");
    request.stream_options = Some(StreamOptions { include_usage: true });

    let mut out = Vec::new();
    gw.handler()
        .chat_stream(request, &mut out, &CancellationToken::new())
        .await
        .unwrap();

    let payloads = sse_payloads(&out);
    let last: Value = serde_json::from_str(&payloads[payloads.len() - 2]).unwrap();
    assert_eq!(last["usage"]["completion_tokens"], 7);
    let total = last["usage"]["total_tokens"].as_u64().unwrap();
    let prompt = last["usage"]["prompt_tokens"].as_u64().unwrap();
    assert_eq!(total, prompt + 7);
}

#[tokio::test]
async fn test_cancel_mid_stream_aborts_without_sentinel() {
    let dir = model_dir(&[("a.gguf", 16)]);
    let backend = ScriptedBackend::new()
        .with_reply("a b c d e f g h i j k l m n o p")
        .with_fragment_delay(Duration::from_millis(10));
    let gw = gateway(&dir, backend).await;
    let cancel = CancellationToken::new();

    let mut out = Vec::new();
    let streaming = gw
        .handler()
        .chat_stream(chat_request("a.gguf", "hi"), &mut out, &cancel);
    let disconnect = async {
        tokio::time::sleep(Duration::from_millis(45)).await;
        cancel.cancel();
    };
    let (outcome, ()) = tokio::join!(streaming, disconnect);
    assert_eq!(outcome.unwrap(), StreamOutcome::Aborted);

    let payloads = sse_payloads(&out);
    assert!(!payloads.is_empty());
    assert!(!payloads.iter().any(|p| p == DONE_SENTINEL));

    let handle = gw.registry().get("a.gguf").await.unwrap();
    assert!(!handle.sequence_lock().is_locked());
    assert!(!gw.handler().gates().chat.is_locked());
}

#[tokio::test]
async fn test_peer_gone_cancels_generation() {
    let dir = model_dir(&[("a.gguf", 16)]);
    let backend = ScriptedBackend::new()
        .with_reply("a b c d e f g h")
        .with_fragment_delay(Duration::from_millis(5));
    let gw = gateway(&dir, backend.clone()).await;

    let outcome = gw
        .handler()
        .chat_stream(chat_request("a.gguf", "hi"), BrokenPipe, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, StreamOutcome::Aborted);
    assert_eq!(backend.stats().generations, 1);

    // The model is free for the next caller.
    let response = gw
        .handler()
        .chat(chat_request("a.gguf", "again"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.choices[0].message.content, "a b c d e f g h");
}

#[tokio::test]
async fn test_completion_stream_single_prompt() {
    let dir = model_dir(&[("a.gguf", 16)]);
    let gw = gateway(&dir, ScriptedBackend::new().with_reply("x y")).await;

    let mut out = Vec::new();
    let outcome = gw
        .handler()
        .completion_stream(
            CompletionRequest::new("a.gguf", Prompt::One("go".into())),
            &mut out,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);

    let payloads = sse_payloads(&out);
    let first: Value = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(first["object"], "text.completion.chunk");
    assert!(first["id"].as_str().unwrap().starts_with("cmpl-"));
    assert_eq!(payloads.last().map(String::as_str), Some(DONE_SENTINEL));
}

#[tokio::test]
async fn test_stream_with_many_prompts_fails_before_generation() {
    let dir = model_dir(&[("a.gguf", 16)]);
    let backend = ScriptedBackend::new();
    let gw = gateway(&dir, backend.clone()).await;

    let mut request = CompletionRequest::new(
        "a.gguf",
        Prompt::Many(vec!["a".into(), "b".into(), "c".into()]),
    );
    request.stream = true;

    let mut out = Vec::new();
    let error = gw
        .handler()
        .completion_stream(request.clone(), &mut out, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, GatewayError::UnsupportedInput(_)));
    assert!(error.to_string().contains("multiple prompts"));
    assert!(out.is_empty());

    // Same answer when the non-streamed driver sees the flag.
    let error = gw
        .handler()
        .completion(request, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(error.status_code(), 400);
    assert_eq!(backend.stats().generations, 0);
    assert_eq!(backend.stats().weight_loads, 0);
}

#[tokio::test]
async fn test_invalid_options_fail_before_first_frame() {
    let dir = model_dir(&[("a.gguf", 16)]);
    let gw = gateway(&dir, ScriptedBackend::new().with_reply("fine")).await;
    let mut request = chat_request("a.gguf", "hi");
    request.sampling.temperature = Some(-1.0);

    let mut out = Vec::new();
    let error = gw
        .handler()
        .chat_stream(request, &mut out, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(error.status_code(), 400);
    assert!(out.is_empty());
}
