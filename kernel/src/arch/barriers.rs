//! Memory barrier abstractions.
//!
//! Centralizes fence operations in one place so non-arch code never writes
//! inline assembly directly.

/// Full memory fence: all reads/writes issued before this barrier are
/// globally visible before any reads/writes issued after it. x86's strongly
/// ordered model makes this equivalent to an atomic `SeqCst` fence.
#[inline(always)]
pub fn memory_fence() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Data synchronization barrier. On x86 this is the same as
/// [`memory_fence`]; kept as a distinct name because callers (e.g. the
/// fixmap and TLB shootdown paths) document intent in terms of "make this
/// store visible before the next instruction fetch/IPI".
#[inline(always)]
pub fn data_sync_barrier() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Instruction synchronization barrier. No-op on x86: the strongly ordered
/// model and unified instruction/data view make an explicit ISB
/// unnecessary.
#[inline(always)]
pub fn instruction_sync_barrier() {}
