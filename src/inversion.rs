//! Moving logical flows between physical threads.
//!
//! Every participating OS thread owns a [`ThreadInfo`] with one incoming
//! [`SuspensionSlot`]. A flow that wants to run on a particular thread
//! deposits its continuation there; the thread adopts it either at an
//! explicit [`inversion_checkpoint`] or, while vacating itself, by waiting
//! on its own slot for a replacement. Pairwise swaps through these slots
//! resolve any permutation of flows to threads.

use std::sync::Arc;

use crate::context::{self, MmapStackAllocator};
use crate::suspension::SuspensionSlot;

#[derive(Debug)]
pub(crate) struct ThreadInfo {
    incoming: SuspensionSlot,
}

thread_local! {
    static CURRENT: Arc<ThreadInfo> = Arc::new(ThreadInfo {
        incoming: SuspensionSlot::new(),
    });
}

/// Identity of the physical thread this flow is currently running on.
pub(crate) fn current_thread() -> Arc<ThreadInfo> {
    CURRENT.with(|info| info.clone())
}

/// Honors a pending inversion request against the current physical thread.
///
/// If some flow has deposited a continuation for this thread, control
/// transfers to it and does not return until a later transfer delivers this
/// flow a thread to run on again; the caller may then be executing on a
/// different physical thread. With no request pending this is a single
/// relaxed load.
pub fn inversion_checkpoint() {
    let info = current_thread();
    if let Some(incoming) = info.incoming.try_take() {
        tracing::trace!("adopting deposited flow at checkpoint");
        // Our own continuation is delivered to the adopted flow, which
        // re-homes it (see `ThreadSnapshot::revert`).
        let _ = context::resume(incoming);
    }
}

/// Records the physical thread a flow started on so it can end there.
#[derive(Debug)]
pub(crate) struct ThreadSnapshot {
    original: Arc<ThreadInfo>,
}

impl ThreadSnapshot {
    pub(crate) fn new() -> Self {
        ThreadSnapshot {
            original: current_thread(),
        }
    }

    /// Forces the calling flow back onto the thread it was captured on.
    ///
    /// The flow parks itself in the original thread's slot; the thread being
    /// vacated waits on its own slot and adopts whichever flow wants it
    /// next. When we are let in by a running flow (via its checkpoint), that
    /// flow's continuation arrives with the transfer and is deposited onto
    /// the thread we came from, completing the swap.
    pub(crate) fn revert(&self) {
        let host = current_thread();
        if Arc::ptr_eq(&host, &self.original) {
            return;
        }
        tracing::trace!("reverting flow to its original thread");

        let original = self.original.clone();
        let vacated = host.clone();
        let displaced = context::callcc(MmapStackAllocator::default(), move |ours| {
            original.incoming.deposit(ours);
            vacated.incoming.take()
        })
        .expect("failed to allocate stack for thread handoff");

        // Running on the original thread from here on.
        if let Some(continuation) = displaced {
            host.incoming.deposit(continuation);
        }
    }
}


#[cfg(test)]
impl ThreadSnapshot {
    fn original_info(&self) -> &Arc<ThreadInfo> {
        &self.original
    }
}
