//! Counts active sessions and lets shutdown wait for them to finish.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

#[derive(Debug, Default)]
struct DrainState {
    active: usize,
    draining: bool,
}

/// Session counter with a one-way switch into draining mode.
///
/// Once [`complete`](Self::complete) has been called no new session is
/// admitted, and [`wait`](Self::wait) resolves as soon as the count is zero.
#[derive(Debug)]
pub struct DrainCoordinator {
    state: Mutex<DrainState>,
    drained: watch::Sender<bool>,
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainCoordinator {
    #[must_use]
    pub fn new() -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            state: Mutex::new(DrainState::default()),
            drained,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DrainState> {
        // Every critical section leaves the state consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts one more session, returning the new total, unless draining.
    pub fn try_increment(&self) -> Option<usize> {
        let mut state = self.lock();
        if state.draining {
            return None;
        }
        state.active += 1;
        let active = state.active;
        drop(state);
        Some(active)
    }

    /// Removes one session and returns how many remain.
    pub fn decrement(&self) -> usize {
        let mut state = self.lock();
        debug_assert!(state.active > 0, "decrement without matching increment");
        state.active = state.active.saturating_sub(1);
        self.signal_if_drained(&state);
        let remaining = state.active;
        drop(state);
        remaining
    }

    /// Stops admitting sessions.
    pub fn complete(&self) {
        let mut state = self.lock();
        state.draining = true;
        self.signal_if_drained(&state);
    }

    /// Resolves once draining has started and no session is left.
    pub async fn wait(&self) {
        let mut drained = self.drained.subscribe();
        // The sender lives in `self`, so the channel cannot close under us
        let _ = drained.wait_for(|done| *done).await;
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.lock().active
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    /// Like [`try_increment`](Self::try_increment), but hands back a guard
    /// that decrements when released or dropped.
    #[must_use]
    pub fn try_enter(self: &Arc<Self>) -> Option<SessionGuard> {
        let active = self.try_increment()?;
        Some(SessionGuard {
            coordinator: Arc::clone(self),
            active_at_entry: active,
            released: false,
        })
    }

    fn signal_if_drained(&self, state: &DrainState) {
        if state.draining && state.active == 0 {
            self.drained
                .send_if_modified(|done| !std::mem::replace(done, true));
        }
    }
}

/// Keeps one session counted for as long as it is alive.
#[derive(Debug)]
pub struct SessionGuard {
    coordinator: Arc<DrainCoordinator>,
    active_at_entry: usize,
    released: bool,
}

impl SessionGuard {
    /// Total active sessions right after this one was admitted.
    #[must_use]
    pub fn active_at_entry(&self) -> usize {
        self.active_at_entry
    }

    /// Uncounts the session and returns how many remain.
    pub fn release(mut self) -> usize {
        self.released = true;
        self.coordinator.decrement()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.released {
            self.coordinator.decrement();
        }
    }
}
