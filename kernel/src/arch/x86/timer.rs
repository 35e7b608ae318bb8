//! Timekeeping: LAPIC periodic timer plus a legacy-PIT busy-wait used only
//! during boot (SMP bring-up delays, LAPIC timer calibration) before the
//! LAPIC timer itself is running.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86::apic;

/// LAPIC timer divide-by-16 (DCR encoding `0x03`).
const DIVIDE_BY_16: u8 = 0x03;
/// Vector the IDT routes the LAPIC timer interrupt to.
const TIMER_VECTOR: u8 = 32;

/// Ticks since boot, incremented only on the bootstrap processor -- each
/// AP runs its own LAPIC timer for local preemption but does not
/// contribute to wall-clock bookkeeping.
static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the vector-32 interrupt handler.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::timer_tick();
}

/// Start the calling CPU's LAPIC timer in periodic mode with the given
/// initial count. Every CPU calls this once during its own bring-up; the
/// count is chosen so the period matches the scheduler's target tick rate
/// (nominally ~100 Hz against a typical QEMU LAPIC bus clock).
pub fn init(initial_count: u32) {
    let _ = apic::setup_timer(TIMER_VECTOR, DIVIDE_BY_16, initial_count);
}

/// Legacy PIT channel 2 busy-wait, used only before the LAPIC timer is
/// running (SMP trampoline INIT/SIPI spacing). Configures the PIT as a
/// one-shot counter and polls the OUT2 status bit on the keyboard
/// controller port.
pub fn busy_wait_us(us: u32) {
    const PIT_FREQUENCY_HZ: u32 = 1_193_182;
    let count = ((PIT_FREQUENCY_HZ as u64 * us as u64) / 1_000_000).max(1) as u16;

    // SAFETY: ports 0x61, 0x43, 0x42 are the legacy PIT/speaker-gate I/O
    // ports, universally present on PC-compatible hardware including QEMU.
    unsafe {
        use x86::io::{inb, outb};

        let gate = inb(0x61) & 0xFD | 0x01; // disable speaker, enable gate
        outb(0x61, gate);
        outb(0x43, 0b10110010); // channel 2, lobyte/hibyte, mode 0, binary
        outb(0x42, (count & 0xFF) as u8);
        outb(0x42, (count >> 8) as u8);

        // Restart counting.
        let gate = inb(0x61) & 0xFE;
        outb(0x61, gate);
        outb(0x61, gate | 0x01);

        while inb(0x61) & 0x20 == 0 {
            core::hint::spin_loop();
        }
    }
}
