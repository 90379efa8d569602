//! FIFO async mutex.
//!
//! Serves as the per-model sequence lock and as the per-endpoint admission
//! gate. On release, ownership passes directly to the oldest queued waiter,
//! so a fresh acquirer can never overtake one that is already waiting.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex as StateLock;
use tokio::sync::oneshot;

#[derive(Default)]
struct State {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Fair async mutex with no payload.
///
/// Cloning yields another handle to the same lock.
#[derive(Clone, Default)]
pub struct Mutex {
    state: Arc<StateLock<State>>,
}

impl Mutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, waiting behind every earlier acquirer.
    ///
    /// Cancel-safe: dropping the returned future while queued removes the
    /// waiter, and if ownership was already handed over it is passed on.
    pub async fn acquire(&self) -> MutexGuard {
        loop {
            let receiver = {
                let mut state = self.state.lock();
                if !state.locked {
                    state.locked = true;
                    return MutexGuard::new(self.state.clone());
                }
                let (sender, receiver) = oneshot::channel();
                state.waiters.push_back(sender);
                receiver
            };

            let mut waiter = Waiter {
                receiver: Some(receiver),
                state: self.state.clone(),
            };
            if waiter.granted().await {
                return MutexGuard::new(self.state.clone());
            }
        }
    }

    /// Acquire without waiting. Fails while held or while anyone is queued.
    pub fn try_acquire(&self) -> Option<MutexGuard> {
        let mut state = self.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(MutexGuard::new(self.state.clone()))
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Number of queued acquirers (including ones whose future was dropped
    /// but not yet skipped by a release).
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mutex")
            .field("locked", &state.locked)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

fn release(state: &StateLock<State>) {
    let mut state = state.lock();
    while let Some(waiter) = state.waiters.pop_front() {
        // A failed send means that waiter gave up; try the next one.
        if waiter.send(()).is_ok() {
            return;
        }
    }
    state.locked = false;
}

/// Queued acquirer. Returns ownership if dropped after being granted it.
struct Waiter {
    receiver: Option<oneshot::Receiver<()>>,
    state: Arc<StateLock<State>>,
}

impl Waiter {
    async fn granted(&mut self) -> bool {
        let Some(receiver) = self.receiver.as_mut() else {
            return false;
        };
        let granted = receiver.await.is_ok();
        self.receiver = None;
        granted
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if receiver.try_recv().is_ok() {
                release(&self.state);
            }
        }
    }
}

/// Ownership of a [`Mutex`]. Released exactly once, on [`release`](Self::release)
/// or drop, whichever comes first.
pub struct MutexGuard {
    state: Option<Arc<StateLock<State>>>,
}

impl MutexGuard {
    fn new(state: Arc<StateLock<State>>) -> Self {
        Self { state: Some(state) }
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(state) = self.state.take() {
            release(&state);
        }
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for MutexGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard")
            .field("held", &self.state.is_some())
            .finish()
    }
}
