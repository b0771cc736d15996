//! Session epochs.
//!
//! An epoch starts when `login` or `initialize` begins and ends at the first
//! logout trigger. Work started in one epoch (requests, refreshes) carries its
//! epoch id, so failures that arrive late cannot end a newer session.

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Epoch {
    id: u64,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct EpochGuard {
    state: Mutex<Epoch>,
}

impl EpochGuard {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(Epoch { id: 0, closed: false }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Epoch> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new epoch and return its id
    pub(crate) fn begin(&self) -> u64 {
        let mut epoch = self.lock();
        epoch.id += 1;
        epoch.closed = false;
        epoch.id
    }

    pub(crate) fn current(&self) -> u64 {
        self.lock().id
    }

    /// Close `epoch` if it is current and still open. Returns true for
    /// exactly one caller per epoch.
    pub(crate) fn try_close(&self, epoch: u64) -> bool {
        let mut state = self.lock();
        if state.id != epoch || state.closed {
            return false;
        }
        state.closed = true;
        true
    }

    /// Close the current epoch (explicit logout)
    pub(crate) fn close(&self) {
        self.lock().closed = true;
    }

    pub(crate) fn is_open(&self, epoch: u64) -> bool {
        let state = self.lock();
        state.id == epoch && !state.closed
    }
}
