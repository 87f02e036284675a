//! Profiling hooks.
//!
//! The call sites mark the runtime's hot paths; the default implementation
//! is empty so the hooks compile to nothing. A real profiler backend can be
//! wired in here without touching the rest of the crate.

#[inline(always)]
pub(crate) fn zone(_name: &str) {}

#[inline(always)]
pub(crate) fn zone_instant(_name: &str) {}

#[inline(always)]
pub(crate) fn define_counter_track(_name: &str) {}

#[inline(always)]
pub(crate) fn emit_thread_name_and_stack(_name: &str) {}
