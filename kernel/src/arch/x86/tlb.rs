//! TLB shootdown.
//!
//! A single global holder lock serializes shootdown requests across CPUs:
//! the initiator fills in the pending address and a bitmask of CPUs that
//! must acknowledge, broadcasts the shootdown IPI, then spins until every
//! bit clears. Each CPU's shootdown-vector handler invalidates the given
//! address (or the whole TLB, for a zero address meaning "flush all")
//! and clears its own bit.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use spin::Mutex;

static HOLDER: Mutex<()> = Mutex::new(());
static REQUEST: ShootdownRequestCell = ShootdownRequestCell::new();
static ONLINE_CPU_MASK: AtomicU32 = AtomicU32::new(1);
static CPU_COUNT: AtomicU8 = AtomicU8::new(1);

struct ShootdownRequestCell {
    addr: AtomicU32,
    pending_mask: AtomicU32,
}

impl ShootdownRequestCell {
    const fn new() -> Self {
        ShootdownRequestCell {
            addr: AtomicU32::new(0),
            pending_mask: AtomicU32::new(0),
        }
    }
}

/// Register that `cpu_id` has come online and must be included in future
/// shootdown broadcasts.
pub fn register_cpu(cpu_id: u8) {
    ONLINE_CPU_MASK.fetch_or(1 << cpu_id, Ordering::AcqRel);
    CPU_COUNT.fetch_add(1, Ordering::AcqRel);
}

/// Invalidate `addr` on every other CPU and wait for all of them to
/// acknowledge. `addr = 0` requests a full TLB flush rather than a single
/// page invalidation, mirroring `invlpg`'s granularity limits.
pub fn shootdown(addr: u32, this_cpu: u8) {
    let others = ONLINE_CPU_MASK.load(Ordering::Acquire) & !(1 << this_cpu);
    if others == 0 {
        local_invalidate(addr);
        return;
    }

    let _holder = HOLDER.lock();
    REQUEST.addr.store(addr, Ordering::Release);
    REQUEST.pending_mask.store(others, Ordering::Release);

    let _ = super::apic::send_tlb_shootdown_ipi();

    while REQUEST.pending_mask.load(Ordering::Acquire) != 0 {
        core::hint::spin_loop();
    }

    local_invalidate(addr);
}

/// Handler for the fixed TLB-shootdown IPI vector.
pub fn handle_shootdown_ipi(this_cpu: u8) {
    let addr = REQUEST.addr.load(Ordering::Acquire);
    local_invalidate(addr);
    REQUEST.pending_mask.fetch_and(!(1 << this_cpu), Ordering::AcqRel);
    super::apic::send_eoi();
}

fn local_invalidate(addr: u32) {
    if addr == 0 {
        super::flush_all_tlb();
    } else {
        // SAFETY: invlpg on an arbitrary address is always safe; it is a
        // no-op if the address was never mapped.
        unsafe {
            core::arch::asm!("invlpg [{0}]", in(reg) addr, options(nostack, preserves_flags));
        }
    }
}
