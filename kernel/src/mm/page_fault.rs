//! `#PF` (vector 14) handling: CR2/error-code triage, then dispatch to
//! the appropriate resolution path.
//!
//! This module owns only the architecture-facing decode and the one case
//! that is purely a paging concern (the kernel higher-half lazy-PDE
//! clone). Stack growth, mmap demand-faults, and heap growth need the
//! owning task's address-space bookkeeping and, for file-backed mmap
//! areas, the VFS -- that policy lives in [`crate::process`], which this
//! module delegates to for any user-mode fault.

#![allow(dead_code)]

use super::paging::{self, PageFlags};
use super::vmm;
use crate::arch::x86;

const PF_PRESENT: u32 = 1 << 0;
const PF_WRITE: u32 = 1 << 1;
const PF_USER: u32 = 1 << 2;

/// Entry point called from the IDT's page-fault handler with CR2, the
/// error code pushed by the CPU, and the faulting EIP.
pub fn handle(fault_addr: u32, error_code: u32, eip: u32) {
    let present = error_code & PF_PRESENT != 0;
    let user = error_code & PF_USER != 0;
    let write = error_code & PF_WRITE != 0;

    if fault_addr >= vmm::ARENA_BASE && !present && clone_kernel_pde(fault_addr) {
        return;
    }

    if user {
        if crate::process::handle_user_fault(fault_addr, write) {
            return;
        }
        crate::process::deliver_fault_signal(crate::process::signal::SIGSEGV);
        return;
    }

    if present {
        // A stale TLB entry racing a shootdown; the PTE is already
        // correct, just re-walk.
        x86::flush_tlb_address(fault_addr);
        return;
    }

    panic!(
        "unhandled kernel-mode page fault at {:#x} (eip {:#x}, error {:#x})",
        fault_addr, eip, error_code
    );
}

/// Every task's page directory shares the kernel's upper PDEs by value at
/// creation time, but later kernel-arena growth (new `vmm::alloc_pages`
/// calls) only updates the master directory. A task directory that
/// hasn't observed a given kernel PDE yet faults here; copy it over and
/// retry rather than eagerly propagating every kernel mapping to every
/// directory on creation.
fn clone_kernel_pde(fault_addr: u32) -> bool {
    let kernel_dir = paging::kernel_directory_phys() as *mut paging::PageTable;
    let Some(phys) = paging::paging_get_phys(kernel_dir, fault_addr & !0xFFF) else {
        return false;
    };
    let current = x86::context::read_cr3() as *mut paging::PageTable;
    if current as u32 == paging::kernel_directory_phys() {
        return false;
    }
    // SAFETY: current is the live directory (it's what CR3 just named);
    // writing a PRESENT+WRITABLE mapping that mirrors the kernel's own
    // entry for this address is exactly what every other directory
    // already has for kernel-half addresses.
    let mapped = unsafe {
        paging::paging_map(
            current,
            fault_addr & !0xFFF,
            super::frame_allocator::FrameNumber::from_phys(phys & !0xFFF),
            PageFlags::PRESENT | PageFlags::WRITABLE,
        )
    };
    mapped.is_ok()
}
