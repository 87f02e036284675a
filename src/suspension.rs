//! Single-use continuation handoff cell.

use std::hint;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::thread;

use crate::context::Continuation;

/// A single-writer/single-reader cell through which one thread parks a
/// continuation for another thread to adopt. Each deposit is consumed by
/// exactly one take; the release store pairs with the acquire load so the
/// adopter observes everything the parking side wrote first.
#[derive(Debug)]
pub(crate) struct SuspensionSlot {
    continuation: AtomicPtr<()>,
}

impl SuspensionSlot {
    pub(crate) fn new() -> Self {
        SuspensionSlot {
            continuation: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Publishes a continuation. Spins if a previous deposit has not been
    /// consumed yet; in every protocol using the slot that window is a few
    /// instructions wide.
    pub(crate) fn deposit(&self, continuation: Continuation) {
        let raw = continuation.into_raw();
        let mut spins = 0u32;
        loop {
            match self.continuation.compare_exchange(
                std::ptr::null_mut(),
                raw,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(_) => backoff(&mut spins),
            }
        }
    }

    /// Consumes a pending deposit, if any.
    pub(crate) fn try_take(&self) -> Option<Continuation> {
        // Fast path: a single load, almost always null.
        if self.continuation.load(Ordering::Relaxed).is_null() {
            return None;
        }
        let raw = self
            .continuation
            .swap(std::ptr::null_mut(), Ordering::Acquire);
        Continuation::from_raw(raw).into_option()
    }

    /// Consumes the next deposit, waiting for one to arrive.
    pub(crate) fn take(&self) -> Continuation {
        let mut spins = 0u32;
        loop {
            if let Some(continuation) = self.try_take() {
                return continuation;
            }
            backoff(&mut spins);
        }
    }
}

fn backoff(spins: &mut u32) {
    *spins += 1;
    if *spins < 64 {
        hint::spin_loop();
    } else {
        thread::yield_now();
    }
}
