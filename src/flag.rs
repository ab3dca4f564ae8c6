//! Atomic boolean used for the client's opt-out / shutdown gate.

use std::sync::atomic::{AtomicBool, Ordering};

/// A boolean flag shared between threads without locking.
#[derive(Debug, Default)]
pub struct AtomicFlag {
    value: AtomicBool,
}

impl AtomicFlag {
    /// Create a flag with the given initial value.
    pub fn new(value: bool) -> Self {
        Self {
            value: AtomicBool::new(value),
        }
    }

    /// Returns `true` if the flag is currently set.
    pub fn is_set(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    /// Set the flag. Returns `true` if this call changed it.
    pub fn set(&self) -> bool {
        !self.value.swap(true, Ordering::AcqRel)
    }

    /// Clear the flag.
    pub fn unset(&self) {
        self.value.store(false, Ordering::Release);
    }
}
