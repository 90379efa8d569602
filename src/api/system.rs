//! Read-only runtime snapshot for diagnostics.

use std::time::Instant;

use serde::Serialize;

use crate::accelerator::{AcceleratorBackend, AcceleratorDevice, MemoryUsage};
use crate::engine::BackendCapabilities;
use crate::models::ModelRegistry;
use crate::shutdown::{ShutdownCoordinator, ShutdownState};

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// Accepting requests, but no model is tracked.
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceleratorSnapshot {
    pub backend: AcceleratorBackend,
    pub devices: Vec<AcceleratorDevice>,
    /// `None` when the probe cannot report.
    pub memory: Option<MemoryUsage>,
    pub utilization_percent: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub state: HealthState,
    pub shutdown: ShutdownState,
    pub accepting_requests: bool,
    pub backend: String,
    pub capabilities: BackendCapabilities,
    pub accelerator: AcceleratorSnapshot,
    pub cpu_math_cores: usize,
    pub models_tracked: usize,
    pub models_resident: usize,
    pub resident_bytes: u64,
    pub in_flight: u32,
    pub uptime_secs: u64,
}

impl SystemSnapshot {
    pub async fn collect(
        registry: &ModelRegistry,
        shutdown: &ShutdownCoordinator,
        started_at: Instant,
    ) -> Self {
        let resident_bytes = registry.resident_bytes().await;
        let probe = registry.probe();
        let memory = probe.memory_usage(resident_bytes).await.ok();
        let models_tracked = registry.count().await;
        let shutdown_state = shutdown.state();
        let accepting = shutdown_state == ShutdownState::Running;

        Self {
            state: health_state(shutdown_state, models_tracked),
            shutdown: shutdown_state,
            accepting_requests: accepting,
            backend: registry.backend().name().to_string(),
            capabilities: registry.backend().capabilities(),
            accelerator: AcceleratorSnapshot {
                backend: probe.backend(),
                devices: probe.devices().await,
                utilization_percent: memory.map(|m| m.utilization()),
                memory,
            },
            cpu_math_cores: num_cpus::get_physical(),
            models_tracked,
            models_resident: registry.resident_count().await,
            resident_bytes,
            in_flight: shutdown.in_flight_count(),
            uptime_secs: started_at.elapsed().as_secs(),
        }
    }
}

fn health_state(shutdown: ShutdownState, models: usize) -> HealthState {
    if shutdown != ShutdownState::Running {
        return HealthState::Unhealthy;
    }
    if models == 0 {
        return HealthState::Degraded;
    }
    HealthState::Healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::accelerator::{BudgetMemoryProbe, UnavailableProbe};
    use crate::engine::scripted::ScriptedBackend;

    #[test]
    fn health_follows_shutdown_and_models() {
        assert_eq!(health_state(ShutdownState::Running, 2), HealthState::Healthy);
        assert_eq!(health_state(ShutdownState::Running, 0), HealthState::Degraded);
        assert_eq!(health_state(ShutdownState::Draining, 2), HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn snapshot_without_probe_reports_null_memory() {
        let registry = ModelRegistry::new(
            Arc::new(ScriptedBackend::new()),
            Arc::new(UnavailableProbe),
            "gguf",
        );
        let shutdown = ShutdownCoordinator::new();
        let snapshot = SystemSnapshot::collect(&registry, &shutdown, Instant::now()).await;

        assert_eq!(snapshot.state, HealthState::Degraded);
        assert!(snapshot.accepting_requests);
        assert!(snapshot.accelerator.memory.is_none());
        assert!(snapshot.cpu_math_cores >= 1);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["accelerator"]["memory"].is_null());
        assert_eq!(json["shutdown"], "running");
    }

    #[tokio::test]
    async fn budget_probe_reports_memory() {
        let registry = ModelRegistry::new(
            Arc::new(ScriptedBackend::new()),
            Arc::new(BudgetMemoryProbe::new(1024)),
            "gguf",
        );
        let snapshot =
            SystemSnapshot::collect(&registry, &ShutdownCoordinator::new(), Instant::now()).await;
        let memory = snapshot.accelerator.memory.unwrap();
        assert_eq!(memory.total, 1024);
        assert_eq!(memory.free, 1024);
    }
}
