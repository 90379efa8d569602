//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use llm_gateway::accelerator::{MemoryProbe, StaticMemoryProbe};
use llm_gateway::api::protocol::{ChatCompletionRequest, ChatMessage, Role};
use llm_gateway::engine::scripted::ScriptedBackend;
use llm_gateway::session::PlaceholderAnnotator;
use llm_gateway::{Gateway, GatewayConfig};
use tempfile::TempDir;
use tokio::io::AsyncWrite;

/// Plenty of memory, so no test evicts by accident.
pub const ROOMY: u64 = 1 << 30;

/// Directory with one model file per `(relative path, size)`.
pub fn model_dir(files: &[(&str, usize)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, size) in files {
        write_model(dir.path(), name, *size);
    }
    dir
}

pub fn write_model(root: &Path, name: &str, size: usize) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, vec![0u8; size]).unwrap();
}

pub fn config_for(dir: &TempDir) -> GatewayConfig {
    GatewayConfig {
        model_dirs: vec![dir.path().to_path_buf()],
        shutdown_timeout_secs: 1,
        ..GatewayConfig::default()
    }
}

pub async fn gateway_with_probe(
    dir: &TempDir,
    backend: ScriptedBackend,
    probe: Arc<dyn MemoryProbe>,
) -> Gateway {
    Gateway::start_with(
        config_for(dir),
        Arc::new(backend),
        probe,
        Arc::new(PlaceholderAnnotator),
    )
    .await
    .unwrap()
}

pub async fn gateway(dir: &TempDir, backend: ScriptedBackend) -> Gateway {
    gateway_with_probe(dir, backend, Arc::new(StaticMemoryProbe::new(ROOMY, ROOMY))).await
}

pub fn chat_request(model: &str, text: &str) -> ChatCompletionRequest {
    ChatCompletionRequest::new(model, vec![ChatMessage::new(Role::User, text)])
}

/// Payloads of every `data:` frame, in order.
pub fn sse_payloads(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| {
            frame
                .lines()
                .filter_map(|line| line.strip_prefix("data: "))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// A peer that has already hung up.
pub struct BrokenPipe;

impl AsyncWrite for BrokenPipe {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed")))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
