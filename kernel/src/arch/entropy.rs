//! Hardware entropy/timestamp abstractions.
//!
//! Used by the futex and scheduler code paths that want jitter for the
//! "which CPU" and timeout bookkeeping; not a cryptographic RNG.

/// Read the Time Stamp Counter. Always available on i386+ with TSC support;
/// falls back to the timer tick counter on CPUs that lack RDTSC (pre-Pentium,
/// not a realistic QEMU target but kept defensive).
#[inline]
pub fn read_timestamp() -> u64 {
    // SAFETY: RDTSC is an unprivileged, side-effect-free instruction reading
    // the cycle counter into EDX:EAX.
    unsafe { core::arch::x86::_rdtsc() }
}
