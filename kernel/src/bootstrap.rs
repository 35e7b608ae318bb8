//! Kernel entry: brings up every subsystem in dependency order, then
//! hands off to the scheduler.
//!
//! Called exactly once, from [`crate::arch::x86::multiboot::multiboot_main`],
//! with the boot processor still running on the one-shot boot stack the
//! linker script reserves. Nothing here ever returns -- the final
//! `sched::yield_now()` dispatches onto the idle task (or a spawned init
//! process) and this stack is never revisited.

use crate::arch::x86::multiboot::BootInfo;
use crate::{config, drivers, fb, fs, log_service, mm, process, sched};

// Provided by `arch/x86/link.ld`; marks the end of the kernel's loaded
// image (after `.bss`), so the physical frame allocator knows not to
// hand out frames the kernel itself occupies.
unsafe extern "C" {
    static kernel_end: u8;
}

/// The kernel's fixed load address, set by `arch/x86/link.ld`'s `. = 1M;`.
const KERNEL_START: u32 = 0x0010_0000;

/// Brings up the boot CPU's full subsystem stack and starts scheduling.
///
/// # Safety
/// Must be called exactly once, by the multiboot2 entry trampoline, with
/// interrupts still disabled and no other code having touched `mm`,
/// `arch::x86`, or the scheduler yet.
pub fn kernel_main(boot_info: BootInfo) -> ! {
    // SAFETY: first thing to touch COM1; runs before anything else can
    // log a panic.
    unsafe { crate::serial::init() };
    crate::serial_println!("[boot] corvid-kernel starting");

    config::init(boot_info.cmdline_str());
    let cfg = config::get();

    // SAFETY: kernel_main's sole caller (multiboot_main) runs this exactly
    // once, with interrupts disabled and before any other subsystem call.
    unsafe { crate::arch::x86::init() };

    let kernel_end_addr = &raw const kernel_end as u32;
    // SAFETY: runs once, right after arch::x86::init, before any
    // allocation; boot_info's memory map is still valid.
    unsafe { mm::init(&boot_info, KERNEL_START, kernel_end_addr, cfg.mem_limit) };

    log_service::log_init();
    log_service::klog(cfg.log_level, "boot", "subsystems coming up");

    fs::init();
    fb::init(boot_info.framebuffer);
    drivers::init();

    sched::init();

    crate::println!("[BOOTSTRAP] kernel_main: subsystems initialized, handing off to scheduler");

    match process::creation::spawn_elf("/sbin/init", &[]) {
        Ok(task) => {
            crate::println!("[BOOTSTRAP] spawned init as pid {}", task.pid);
        }
        Err(e) => {
            crate::println!(
                "[BOOTSTRAP] no /sbin/init to spawn ({:?}); running idle-only",
                e
            );
        }
    }

    // IDT, LAPIC timer, and scheduler are all live at this point.
    crate::arch::x86::enable_interrupts();

    // Dispatches onto the idle task (or init, if it was spawned above)
    // via a one-way `switch_to`; this boot stack is never resumed.
    sched::yield_now();

    // Unreachable in practice -- kept only to satisfy `-> !`, in case a
    // future scheduler change ever made the first yield_now return.
    crate::arch::x86::halt();
}
