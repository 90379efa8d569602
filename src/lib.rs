//! LLM Gateway
//!
//! Core of a local inference gateway that serves an OpenAI-compatible API in
//! front of a directory of model files. The crate decides which weights are
//! resident within the accelerator memory budget, serializes access to each
//! model's single execution sequence, accounts token usage and encodes
//! streamed responses as server-sent events.
//!
//! # Layers
//!
//! - [`models`]: directory discovery, per-file handles with memoized load
//!   stages, and the registry that evicts weights to make room.
//! - [`session`]: one request against one model, holding that model's
//!   sequence lock for its whole lifetime.
//! - [`api`]: wire types, endpoint drivers with per-class admission gates,
//!   and the SSE encoder.
//! - [`engine`]: the boundary to the backend that actually samples tokens.
//!
//! # Lifecycle
//!
//! [`Gateway::start`] builds everything from a [`GatewayConfig`] and begins
//! watching the model directories. [`Gateway::shutdown`] is the single
//! teardown path: stop admitting, drain, stop watchers, unload.

pub mod accelerator;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod session;
pub mod shutdown;
pub mod sync;
pub mod telemetry;

use std::sync::Arc;

use tracing::{info, warn};

use accelerator::{BudgetMemoryProbe, MemoryProbe, UnavailableProbe};
use api::ApiHandler;
use engine::InferenceBackend;
use models::ModelRegistry;
use session::{MediaAnnotator, PlaceholderAnnotator};
use shutdown::{DrainResult, ShutdownCoordinator};

pub use config::GatewayConfig;
pub use error::GatewayError;

/// Pick the memory probe for this machine and configuration.
///
/// A CUDA device wins when compiled in, then a configured budget. Without
/// either, the registry cannot see memory and evicts everything before
/// each load.
pub fn select_probe(config: &GatewayConfig) -> Arc<dyn MemoryProbe> {
    #[cfg(feature = "cuda")]
    match accelerator::CudaMemoryProbe::new() {
        Ok(probe) => return Arc::new(probe),
        Err(error) => warn!(%error, "CUDA probe unavailable"),
    }

    match config.memory.budget_bytes {
        Some(budget) => Arc::new(BudgetMemoryProbe::new(budget)),
        None => {
            warn!("no accelerator memory information, every load evicts all resident models");
            Arc::new(UnavailableProbe)
        }
    }
}

/// The running gateway. Owns the registry and everything serving requests.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ModelRegistry>,
    handler: Arc<ApiHandler>,
    shutdown: ShutdownCoordinator,
}

impl Gateway {
    /// Build the gateway and start watching every configured model directory.
    pub async fn start(
        config: GatewayConfig,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, GatewayError> {
        let probe = select_probe(&config);
        Self::start_with(config, backend, probe, Arc::new(PlaceholderAnnotator)).await
    }

    /// [`Gateway::start`] with an explicit probe and media annotator.
    pub async fn start_with(
        config: GatewayConfig,
        backend: Arc<dyn InferenceBackend>,
        probe: Arc<dyn MemoryProbe>,
        annotator: Arc<dyn MediaAnnotator>,
    ) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

        let registry = Arc::new(ModelRegistry::new(
            backend,
            probe,
            config.model_extension.clone(),
        ));
        for dir in &config.model_dirs {
            if let Err(error) = registry.watch(dir).await {
                registry.stop_watching();
                return Err(error.into());
            }
        }

        let shutdown = ShutdownCoordinator::new();
        let handler = Arc::new(ApiHandler::new(registry.clone(), annotator, shutdown.clone()));
        info!(
            backend = registry.backend().name(),
            accelerator = %registry.probe().backend(),
            roots = config.model_dirs.len(),
            models = registry.count().await,
            "gateway started"
        );

        Ok(Self {
            config,
            registry,
            handler,
            shutdown,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn handler(&self) -> &Arc<ApiHandler> {
        &self.handler
    }

    pub fn is_accepting(&self) -> bool {
        self.shutdown.is_accepting()
    }

    /// Stop admitting, drain in-flight requests up to the configured
    /// timeout, stop watchers and unload every model.
    pub async fn shutdown(&self) -> DrainResult {
        let drained = self.shutdown.drain(self.config.shutdown_timeout()).await;
        if let DrainResult::Timeout { remaining } = &drained {
            warn!(remaining, "shutdown timeout with requests still in flight");
        }
        self.registry.dispose().await;
        self.shutdown.mark_stopped();
        info!("gateway stopped");
        drained
    }
}
