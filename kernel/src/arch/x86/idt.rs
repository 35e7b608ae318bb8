//! Interrupt Descriptor Table.
//!
//! Hand-encoded the same way [`gdt`](super::gdt) is: the 32-bit `x86` crate
//! has no typed IDT builder equivalent to `x86_64::structures::idt`, so
//! gate descriptors are built from raw bytes. Exception handlers use the
//! `extern "x86-interrupt"` ABI (stable for `x86` targets), which produces
//! an interrupt-correct prologue/epilogue without hand-written `naked_asm!`
//! for everything except the syscall gate, which needs to read general
//! purpose registers (see [`super::syscall`]).

use core::arch::asm;

const IDT_ENTRIES: usize = 256;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn new(handler: u32, selector: u16, type_attr: u8) -> Self {
        IdtEntry {
            offset_low: (handler & 0xFFFF) as u16,
            selector,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

static mut IDT: [IdtEntry; IDT_ENTRIES] = [IdtEntry::missing(); IDT_ENTRIES];

/// Gate type: 32-bit interrupt gate, present, DPL 0.
const GATE_INTERRUPT_RING0: u8 = 0x8E;
/// Gate type: 32-bit trap gate, present, DPL 3 -- reachable from user mode
/// via `int 0x80`.
const GATE_TRAP_RING3: u8 = 0xEF;

#[repr(C)]
pub struct InterruptStackFrame {
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// Install exception and IRQ handlers and load the IDT.
///
/// # Safety
///
/// Must run once, early in boot, after [`super::gdt::init`], with
/// interrupts disabled.
pub unsafe fn init() {
    // SAFETY: single-threaded boot context, table not yet loaded.
    unsafe {
        set_handler(3, breakpoint_handler as u32, GATE_INTERRUPT_RING0);
        set_handler(8, double_fault_handler as u32, GATE_INTERRUPT_RING0);
        set_handler(13, general_protection_fault_handler as u32, GATE_INTERRUPT_RING0);
        set_handler(14, page_fault_handler as u32, GATE_INTERRUPT_RING0);
        set_handler(32, timer_interrupt_handler as u32, GATE_INTERRUPT_RING0);
        set_handler(0x80, super::syscall::syscall_entry as u32, GATE_TRAP_RING3);

        let ptr = IdtPointer {
            limit: (core::mem::size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
            base: IDT.as_ptr() as u32,
        };
        asm!("lidt [{0}]", in(reg) &ptr);
    }
}

/// # Safety
/// Caller must hold exclusive access to the static IDT (boot-time only).
unsafe fn set_handler(vector: usize, handler: u32, type_attr: u8) {
    // SAFETY: delegated to caller.
    unsafe {
        IDT[vector] = IdtEntry::new(handler, super::gdt::KERNEL_CS, type_attr);
    }
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    crate::println!("breakpoint at eip={:#x}", { frame.eip });
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame) -> ! {
    panic!("double fault: eip={:#x} esp={:#x}", { frame.eip }, { frame.esp });
}

extern "x86-interrupt" fn general_protection_fault_handler(frame: InterruptStackFrame, error_code: u32) {
    panic!(
        "general protection fault: error={:#x} eip={:#x}",
        error_code, { frame.eip }
    );
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, error_code: u32) {
    let fault_addr: u32;
    // SAFETY: reading CR2 is side-effect free.
    unsafe {
        asm!("mov {0}, cr2", out(reg) fault_addr);
    }
    crate::mm::page_fault::handle(fault_addr, error_code, frame.eip);
}

extern "x86-interrupt" fn timer_interrupt_handler(_frame: InterruptStackFrame) {
    super::apic::send_eoi();
    crate::sched::timer_tick();
}
