// Copyright 2024-2026 llm-gateway Contributors
// Licensed under the Apache License, Version 2.0

//! Accelerator memory probes
//!
//! The registry asks a [`MemoryProbe`] how much device memory exists and how
//! much is free before it loads weights. Probes that cannot see a device fail
//! with [`AcceleratorError`], and the registry then evicts everything.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Accelerator Backend Types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorBackend {
    /// NVIDIA CUDA backend
    Cuda,
    /// Memory budget from configuration, no device query
    Budget,
    /// CPU fallback (no accelerator)
    #[default]
    Cpu,
}

impl fmt::Display for AcceleratorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => write!(f, "CUDA"),
            Self::Budget => write!(f, "budget"),
            Self::Cpu => write!(f, "CPU"),
        }
    }
}

/// Accelerator Device Information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceleratorDevice {
    pub backend: AcceleratorBackend,
    /// Device index (for multi-GPU systems)
    pub index: usize,
    pub name: String,
    /// Total memory in bytes
    pub total_memory: u64,
    /// Available memory in bytes
    pub available_memory: u64,
}

/// Device memory in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub free: u64,
}

impl MemoryUsage {
    /// Get memory utilization percentage
    pub fn utilization(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        let used = self.total.saturating_sub(self.free);
        (used as f64 / self.total as f64 * 100.0) as f32
    }
}

/// Accelerator Errors
#[derive(Debug, Error)]
pub enum AcceleratorError {
    #[error("no accelerator memory information available")]
    Unavailable,

    #[error("device query failed: {0}")]
    Query(String),
}

/// Source of accelerator memory figures.
#[async_trait]
pub trait MemoryProbe: Send + Sync {
    /// Current usage. `resident_bytes` is the size of all weights the caller
    /// currently holds, for probes that track a budget instead of a device.
    async fn memory_usage(&self, resident_bytes: u64) -> Result<MemoryUsage, AcceleratorError>;

    /// Devices this probe reports on.
    async fn devices(&self) -> Vec<AcceleratorDevice>;

    fn backend(&self) -> AcceleratorBackend;
}

/// Fixed figures, for pinned deployments and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticMemoryProbe {
    usage: MemoryUsage,
}

impl StaticMemoryProbe {
    pub fn new(total: u64, free: u64) -> Self {
        Self {
            usage: MemoryUsage {
                total,
                free: free.min(total),
            },
        }
    }
}

#[async_trait]
impl MemoryProbe for StaticMemoryProbe {
    async fn memory_usage(&self, _resident_bytes: u64) -> Result<MemoryUsage, AcceleratorError> {
        Ok(self.usage)
    }

    async fn devices(&self) -> Vec<AcceleratorDevice> {
        vec![AcceleratorDevice {
            backend: AcceleratorBackend::Budget,
            index: 0,
            name: "static".to_string(),
            total_memory: self.usage.total,
            available_memory: self.usage.free,
        }]
    }

    fn backend(&self) -> AcceleratorBackend {
        AcceleratorBackend::Budget
    }
}

/// A configured byte budget. Free memory is whatever resident weights leave.
#[derive(Debug, Clone, Copy)]
pub struct BudgetMemoryProbe {
    budget: u64,
}

impl BudgetMemoryProbe {
    pub fn new(budget: u64) -> Self {
        Self { budget }
    }
}

#[async_trait]
impl MemoryProbe for BudgetMemoryProbe {
    async fn memory_usage(&self, resident_bytes: u64) -> Result<MemoryUsage, AcceleratorError> {
        Ok(MemoryUsage {
            total: self.budget,
            free: self.budget.saturating_sub(resident_bytes),
        })
    }

    async fn devices(&self) -> Vec<AcceleratorDevice> {
        vec![AcceleratorDevice {
            backend: AcceleratorBackend::Budget,
            index: 0,
            name: "configured budget".to_string(),
            total_memory: self.budget,
            available_memory: self.budget,
        }]
    }

    fn backend(&self) -> AcceleratorBackend {
        AcceleratorBackend::Budget
    }
}

/// No device information. Every query fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableProbe;

#[async_trait]
impl MemoryProbe for UnavailableProbe {
    async fn memory_usage(&self, _resident_bytes: u64) -> Result<MemoryUsage, AcceleratorError> {
        Err(AcceleratorError::Unavailable)
    }

    async fn devices(&self) -> Vec<AcceleratorDevice> {
        Vec::new()
    }

    fn backend(&self) -> AcceleratorBackend {
        AcceleratorBackend::Cpu
    }
}

#[cfg(feature = "cuda")]
pub use cuda::CudaMemoryProbe;

#[cfg(feature = "cuda")]
mod cuda {
    use std::sync::Arc;

    use async_trait::async_trait;
    use cudarc::driver::CudaDevice;

    use super::{AcceleratorBackend, AcceleratorDevice, AcceleratorError, MemoryProbe, MemoryUsage};

    /// Queries the CUDA driver for device 0.
    pub struct CudaMemoryProbe {
        device: Arc<CudaDevice>,
    }

    impl CudaMemoryProbe {
        /// Open device 0. Fails if no CUDA device is present.
        pub fn new() -> Result<Self, AcceleratorError> {
            let device = CudaDevice::new(0).map_err(|e| AcceleratorError::Query(e.to_string()))?;
            Ok(Self { device })
        }

        fn query(device: &CudaDevice) -> Result<MemoryUsage, AcceleratorError> {
            device
                .bind_to_thread()
                .map_err(|e| AcceleratorError::Query(e.to_string()))?;
            let (free, total) = cudarc::driver::result::mem_get_info()
                .map_err(|e| AcceleratorError::Query(e.to_string()))?;
            Ok(MemoryUsage {
                total: total as u64,
                free: free as u64,
            })
        }
    }

    #[async_trait]
    impl MemoryProbe for CudaMemoryProbe {
        async fn memory_usage(&self, _resident_bytes: u64) -> Result<MemoryUsage, AcceleratorError> {
            let device = self.device.clone();
            tokio::task::spawn_blocking(move || Self::query(&device))
                .await
                .map_err(|e| AcceleratorError::Query(e.to_string()))?
        }

        async fn devices(&self) -> Vec<AcceleratorDevice> {
            let usage = self.memory_usage(0).await.unwrap_or_default();
            vec![AcceleratorDevice {
                backend: AcceleratorBackend::Cuda,
                index: 0,
                name: self.device.name().unwrap_or_else(|_| "CUDA device".to_string()),
                total_memory: usage.total,
                available_memory: usage.free,
            }]
        }

        fn backend(&self) -> AcceleratorBackend {
            AcceleratorBackend::Cuda
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn budget_probe_subtracts_resident_weights() {
        let probe = BudgetMemoryProbe::new(1_000);
        let usage = probe.memory_usage(400).await.unwrap();
        assert_eq!(usage, MemoryUsage { total: 1_000, free: 600 });

        let usage = probe.memory_usage(5_000).await.unwrap();
        assert_eq!(usage.free, 0);
    }

    #[tokio::test]
    async fn static_probe_clamps_free_to_total() {
        let probe = StaticMemoryProbe::new(100, 250);
        assert_eq!(probe.memory_usage(0).await.unwrap().free, 100);
    }

    #[tokio::test]
    async fn unavailable_probe_always_fails() {
        assert!(UnavailableProbe.memory_usage(0).await.is_err());
        assert!(UnavailableProbe.devices().await.is_empty());
    }

    #[test]
    fn utilization_percentage() {
        let usage = MemoryUsage { total: 200, free: 50 };
        assert!((usage.utilization() - 75.0).abs() < f32::EPSILON);
        assert_eq!(MemoryUsage::default().utilization(), 0.0);
    }
}
