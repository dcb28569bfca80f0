//! One-shot exit signal: resolved exactly once, awaited by any number of threads.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub(crate) struct ExitSignal {
    code: Mutex<Option<i32>>,
    resolved: Condvar,
}

impl ExitSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store `code` and wake every waiter. Returns `false` if already resolved.
    pub(crate) fn resolve(&self, code: i32) -> bool {
        let mut slot = self.code.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(code);
        self.resolved.notify_all();
        true
    }

    pub(crate) fn code(&self) -> Option<i32> {
        *self.code.lock()
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.code.lock().is_some()
    }

    pub(crate) fn wait(&self) -> i32 {
        let mut slot = self.code.lock();
        loop {
            if let Some(code) = *slot {
                return code;
            }
            self.resolved.wait(&mut slot);
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.code.lock();
        while slot.is_none() {
            if self.resolved.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        *slot
    }
}
