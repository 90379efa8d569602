//! Graceful shutdown: stop admitting, drain in-flight requests, tear down.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: u32 },
}

/// Tracks in-flight requests and gates admission of new ones.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    in_flight: Arc<AtomicU32>,
    drained: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            in_flight: Arc::new(AtomicU32::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.read()
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Admit one request. The guard counts it until dropped.
    pub fn track(&self) -> Result<FlightGuard, GatewayError> {
        let state = self.state.read();
        if *state != ShutdownState::Running {
            return Err(GatewayError::ShuttingDown);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(FlightGuard {
            counter: self.in_flight.clone(),
            drained: self.drained.clone(),
        })
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop admitting and wait up to `timeout` for in-flight requests.
    pub async fn drain(&self, timeout: Duration) -> DrainResult {
        {
            let mut state = self.state.write();
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            let count = self.in_flight_count();
            if count == 0 {
                return DrainResult::Complete;
            }
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    return match self.in_flight_count() {
                        0 => DrainResult::Complete,
                        remaining => DrainResult::Timeout { remaining },
                    };
                }
            }
        }
    }

    pub fn mark_stopped(&self) {
        *self.state.write() = ShutdownState::Stopped;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// One admitted request.
pub struct FlightGuard {
    counter: Arc<AtomicU32>,
    drained: Arc<Notify>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.track().unwrap();
        assert_eq!(coordinator.in_flight_count(), 1);

        let draining = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.drain(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.state(), ShutdownState::Draining);
        assert!(matches!(coordinator.track(), Err(GatewayError::ShuttingDown)));

        drop(guard);
        assert_eq!(draining.await.unwrap(), DrainResult::Complete);
    }

    #[tokio::test]
    async fn drain_times_out_with_remaining_count() {
        let coordinator = ShutdownCoordinator::new();
        let _guard = coordinator.track().unwrap();
        let result = coordinator.drain(Duration::from_millis(30)).await;
        assert_eq!(result, DrainResult::Timeout { remaining: 1 });
    }

    #[tokio::test]
    async fn idle_drain_completes_immediately() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.drain(Duration::ZERO).await, DrainResult::Complete);
        coordinator.mark_stopped();
        assert!(!coordinator.is_accepting());
    }
}
