// Gate: shared reject/freeze state machine
//
// Every accepted connection (byte mode) and every inbound call (call-aware
// mode) passes through the gate before it is serviced. Byte mode also waits
// on the gate before each individual read and write so that a freeze stalls
// sessions mid-transfer.
//
// Key invariants:
// - `rejecting` wins over `frozen`: a rejecting gate fails fast, never blocks
// - thawing wakes *all* waiters (broadcast), never just one
// - flags are idempotent: setting a flag to its current value is a no-op

use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Snapshot of the gate flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateState {
    /// New sessions/calls fail immediately
    pub rejecting: bool,

    /// Gated I/O blocks until thawed
    pub frozen: bool,
}

/// Returned to callers that hit a rejecting gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("proxy unavailable")]
pub struct Rejected;

/// Mutex-protected gate flags plus a broadcast wake-up for waiters.
///
/// `Notify::notify_waiters` plays the role of a condition variable
/// broadcast: every task parked in [`Gate::await_thaw`] or
/// [`Gate::await_permitted`] re-checks the flags after a state change.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Notify,
}

impl Gate {
    /// Create an open gate (accepting, thawed)
    pub fn new() -> Self {
        Self::default()
    }

    /// Current flags
    pub fn state(&self) -> GateState {
        *self.lock()
    }

    pub fn is_rejecting(&self) -> bool {
        self.lock().rejecting
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    /// Fail fast if the gate is rejecting
    pub fn check_rejecting(&self) -> Result<(), Rejected> {
        if self.lock().rejecting {
            Err(Rejected)
        } else {
            Ok(())
        }
    }

    /// Set the rejecting flag.
    ///
    /// Returns `true` if the flag changed. Turning rejection on also wakes
    /// frozen waiters in [`Gate::await_permitted`] so they fail fast.
    pub fn set_rejecting(&self, rejecting: bool) -> bool {
        let changed = {
            let mut state = self.lock();
            let changed = state.rejecting != rejecting;
            state.rejecting = rejecting;
            changed
        };
        if changed && rejecting {
            self.changed.notify_waiters();
        }
        changed
    }

    /// Set the frozen flag.
    ///
    /// Returns `true` if the flag changed. Thawing broadcasts to all waiters.
    pub fn set_frozen(&self, frozen: bool) -> bool {
        let changed = {
            let mut state = self.lock();
            let changed = state.frozen != frozen;
            state.frozen = frozen;
            changed
        };
        if changed && !frozen {
            self.changed.notify_waiters();
        }
        changed
    }

    /// Block while the gate is frozen
    pub async fn await_thaw(&self) {
        loop {
            // Register interest before checking the flag so a thaw between
            // the check and the await cannot be missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let frozen = self.lock().frozen;
            if !frozen {
                return;
            }
            notified.await;
        }
    }

    /// Check-rejecting then await-thaw, as done for every accept and call.
    ///
    /// A waiter that is woken while the gate has started rejecting fails
    /// fast instead of continuing to wait.
    pub async fn await_permitted(&self) -> Result<(), Rejected> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock();
                if state.rejecting {
                    return Err(Rejected);
                }
                if !state.frozen {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
