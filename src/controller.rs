//! Connection state machine and reconnect budget
//!
//! Shared by the trace collector and the health poller of one device. The
//! state is only ever changed through [`ReconnectController::transition`],
//! which enforces the permitted edges, or [`ReconnectController::halt`] for
//! explicit stops and a spent budget.

use crate::events::{ConnectionState, Timestamp};
use chrono::Utc;
use log::{debug, error, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Most recent failure reported by the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: String,
    pub at: Timestamp,
}

#[derive(Debug)]
struct ControllerState {
    state: ConnectionState,
    /// Set by the poller when the device stops answering
    lost: bool,
    /// Consecutive failed connect attempts
    attempts: u32,
    /// Set once the first session has been opened
    monitoring_started: bool,
    last_failure: Option<Failure>,
}

/// Connection state plus retry budget for one device monitor
#[derive(Debug)]
pub struct ReconnectController {
    max_attempts: u32,
    state: Mutex<ControllerState>,
}

impl ReconnectController {
    /// Create a controller at rest in `Disconnected`
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            state: Mutex::new(ControllerState {
                state: ConnectionState::Disconnected,
                lost: false,
                attempts: 0,
                monitoring_started: false,
                last_failure: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Move to `next` if the state machine permits it
    ///
    /// Returns whether the state is now `next`.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut guard = self.lock();
        let current = guard.state;
        if !current.can_transition_to(next) {
            warn!("Rejected connection state change {} -> {}", current, next);
            return false;
        }
        if current != next {
            debug!("Connection state {} -> {}", current, next);
            guard.state = next;
        }
        true
    }

    /// Force `Disconnected`, for explicit stops and a spent budget
    pub fn halt(&self) {
        let mut guard = self.lock();
        if guard.state != ConnectionState::Disconnected {
            debug!("Connection state {} -> {} (halt)", guard.state, ConnectionState::Disconnected);
        }
        guard.state = ConnectionState::Disconnected;
    }

    /// Count one failed connect attempt
    ///
    /// Returns `false` once the budget is spent; the caller must then halt.
    pub fn record_failure(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut guard = self.lock();
        guard.attempts = guard.attempts.saturating_add(1);
        let attempts = guard.attempts;
        guard.last_failure = Some(Failure {
            reason: reason.clone(),
            at: Utc::now(),
        });

        if attempts >= self.max_attempts {
            error!(
                "Giving up after {} failed connect attempts: {}",
                attempts, reason
            );
            false
        } else {
            warn!(
                "Connect attempt {}/{} failed: {}",
                attempts, self.max_attempts, reason
            );
            true
        }
    }

    /// Failed attempts since the last successful read
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Reset the budget after a successful read
    pub fn reset_budget(&self) {
        let mut guard = self.lock();
        if guard.attempts > 0 {
            debug!("Reconnect budget reset after {} attempts", guard.attempts);
        }
        guard.attempts = 0;
    }

    pub fn last_failure(&self) -> Option<Failure> {
        self.lock().last_failure.clone()
    }

    pub fn mark_lost(&self) {
        self.lock().lost = true;
    }

    pub fn clear_lost(&self) {
        self.lock().lost = false;
    }

    pub fn is_lost(&self) -> bool {
        self.lock().lost
    }

    pub fn mark_monitoring_started(&self) {
        self.lock().monitoring_started = true;
    }

    /// Whether a session has ever been opened by this monitor
    pub fn is_monitoring_started(&self) -> bool {
        self.lock().monitoring_started
    }

    /// Back to the initial state, keeping the recorded failure
    pub fn reset(&self) {
        let mut guard = self.lock();
        guard.state = ConnectionState::Disconnected;
        guard.lost = false;
        guard.attempts = 0;
        guard.monitoring_started = false;
    }
}

/// Cooperative cancellation signal for background loops
///
/// Clones share the same signal. Sleeping through [`CancelToken::sleep`] is
/// interrupted as soon as the token is cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// Returns `true` if the full duration elapsed without cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut cancelled = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            cancelled = cvar
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        false
    }
}
