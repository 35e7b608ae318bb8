//! Application-processor bring-up.
//!
//! Each AP starts in real mode at `CS:IP = trampoline_page:0000`
//! (INIT-SIPI-SIPI, see [`super::apic::start_application_processor`]), so
//! a small 16-bit trampoline has to live at a fixed, low physical address
//! before any AP is started. The trampoline switches the AP into
//! protected mode with the same GDT the BSP uses, loads the current page
//! directory, and jumps into Rust at [`ap_entry`].

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Physical page (`* 0x1000`) the real-mode trampoline is copied to.
/// `0x8` (physical `0x8000`) is conventional: below 1 MiB, above the BIOS
/// data area, unused by this kernel's own early boot layout.
pub const TRAMPOLINE_PAGE: u8 = 0x08;
const TRAMPOLINE_PHYS: usize = (TRAMPOLINE_PAGE as usize) * 0x1000;

/// Number of CPUs that have completed [`ap_entry`] and are ready to take
/// scheduler work. The BSP counts itself too, so this starts at 1.
pub static CPUS_ONLINE: AtomicUsize = AtomicUsize::new(1);

/// Stack top handed to the next AP to start, read by the trampoline
/// before it jumps to `ap_entry`.
static NEXT_AP_STACK: AtomicU32 = AtomicU32::new(0);
/// Page directory physical address handed to the next AP, read by the
/// trampoline.
static NEXT_AP_PAGE_DIR: AtomicU32 = AtomicU32::new(0);

core::arch::global_asm!(
    r#"
.section .trampoline, "awx"
.code16
.global ap_trampoline_start
.global ap_trampoline_end
ap_trampoline_start:
    cli
    xor ax, ax
    mov ds, ax
    lgdt [gdt_ptr_16 - ap_trampoline_start + 0x8000]
    mov eax, cr0
    or eax, 1
    mov cr0, eax
    ljmp 0x08, 0x8000 + (protected_mode_entry - ap_trampoline_start)

.code32
protected_mode_entry:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax
    mov esp, 0x7000
    call {ap_entry}
    hlt
    jmp protected_mode_entry

.align 8
gdt_ptr_16:
    .word 0
    .long 0

ap_trampoline_end:
"#,
    ap_entry = sym ap_entry_trampoline,
);

extern "C" fn ap_entry_trampoline() -> ! {
    ap_entry()
}

/// Copy the trampoline blob to its fixed physical address. Must run once,
/// before the first [`super::apic::start_application_processor`] call.
///
/// # Safety
///
/// `TRAMPOLINE_PHYS` must be identity-mapped, writable, low memory not
/// otherwise in use.
pub unsafe fn install_trampoline() {
    extern "C" {
        static ap_trampoline_start: u8;
        static ap_trampoline_end: u8;
    }
    // SAFETY: these symbols bound the .trampoline section emitted above;
    // the destination is reserved low memory per this function's contract.
    unsafe {
        let start = &ap_trampoline_start as *const u8;
        let end = &ap_trampoline_end as *const u8;
        let len = end as usize - start as usize;
        core::ptr::copy_nonoverlapping(start, TRAMPOLINE_PHYS as *mut u8, len);
    }
}

/// Set the stack and page directory the next-started AP should use, then
/// return once [`CPUS_ONLINE`] reflects it having come up (or a timeout
/// elapses).
pub fn start_one(apic_id: u8, stack_top: u32, page_dir_phys: u32) -> bool {
    NEXT_AP_STACK.store(stack_top, Ordering::Release);
    NEXT_AP_PAGE_DIR.store(page_dir_phys, Ordering::Release);
    let before = CPUS_ONLINE.load(Ordering::Acquire);

    let _ = super::apic::start_application_processor(apic_id, TRAMPOLINE_PAGE);

    for _ in 0..1000 {
        if CPUS_ONLINE.load(Ordering::Acquire) > before {
            return true;
        }
        super::timer::busy_wait_us(1000);
    }
    false
}

/// Entry point for every AP once it reaches protected mode. Runs the
/// per-CPU half of kernel init (local GDT/IDT reload, LAPIC timer,
/// per-CPU scheduler runqueue registration) and then falls into the
/// idle loop, waiting for the scheduler to hand it work.
fn ap_entry() -> ! {
    // SAFETY: each AP runs this exactly once, before interrupts are
    // enabled on that CPU.
    unsafe {
        super::gdt::init();
        super::idt::init();
    }
    CPUS_ONLINE.fetch_add(1, Ordering::AcqRel);
    crate::sched::register_this_cpu();
    loop {
        super::halt();
    }
}
