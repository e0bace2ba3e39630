//! Two-phase admission control for agent spawns.
//!
//! The [`AdmissionController`] gates how many agents may be concurrently
//! active: `running + pending` against one hard cap. `pending` counts
//! spawns that have been accepted but not yet durably registered; it exists
//! purely to close the race window between "check current load" and
//! "commit a new task". The check and the increment happen under one lock
//! acquisition with no suspension point in between, so a burst of
//! simultaneous requests can never collectively exceed the cap.
//!
//! An [`AdmissionPermit`] decrements `pending` exactly once when dropped,
//! covering every exit path: background spawns drop it right after the
//! task record is registered (the registry's running count covers the task
//! from then on), foreground runs hold it for their whole duration, and
//! any failure before registration releases it on unwind.

use std::sync::{Arc, Mutex, PoisonError};

/// Rejection naming the observed load against the cap.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("Concurrent agent limit reached ({current}/{cap})")]
pub struct AdmissionRejected {
    /// Agents active at the time of the check (running + pending).
    pub current: usize,
    pub cap: usize,
}

/// A granted admission slot. Dropping it releases the pending count.
#[derive(Debug)]
pub struct AdmissionPermit {
    pending: Arc<Mutex<usize>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *pending = pending.saturating_sub(1);
    }
}

/// Concurrency gate for agent spawns.
pub struct AdmissionController {
    cap: usize,
    pending: Arc<Mutex<usize>>,
}

impl AdmissionController {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            pending: Arc::new(Mutex::new(0)),
        }
    }

    /// Try to admit one spawn given the registry's current running count.
    ///
    /// On acceptance the pending count is incremented synchronously, before
    /// control returns to the caller.
    pub fn try_admit(&self, running: usize) -> Result<AdmissionPermit, AdmissionRejected> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let current = running + *pending;
        if current >= self.cap {
            return Err(AdmissionRejected {
                current,
                cap: self.cap,
            });
        }

        *pending += 1;
        Ok(AdmissionPermit {
            pending: Arc::clone(&self.pending),
        })
    }

    /// Spawns admitted but not yet registered.
    pub fn pending(&self) -> usize {
        *self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub const fn cap(&self) -> usize {
        self.cap
    }
}
