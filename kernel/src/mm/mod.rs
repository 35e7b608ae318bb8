//! Memory management: physical frames, paging, the kernel virtual arena,
//! the SLUB-style slab allocator, and page-fault/user-pointer validation.

#![allow(dead_code)]

pub mod frame_allocator;
pub mod page_fault;
pub mod paging;
pub mod slab;
pub mod user_validation;
pub mod vmm;

pub use frame_allocator::{FrameNumber, MemoryRegion, FRAME_SIZE};
pub use paging::{PageFlags, PageTable, Pte};

use crate::arch::x86::multiboot::BootInfo;

/// Bring up every mm subsystem, in dependency order:
/// 1. The PMM bitmap, from the bootloader's memory map.
/// 2. Paging bookkeeping (records the directory the bootstrap assembly
///    already loaded into CR3).
/// 3. The kernel virtual arena, which leans on both of the above.
///
/// # Safety
/// Must run once, early in `kernel_main`, after `arch::x86::init` and
/// before any code allocates.
pub unsafe fn init(boot_info: &BootInfo, kernel_start: u32, kernel_end: u32, mem_limit_override: Option<u64>) {
    // SAFETY: runs once, before any other mm call.
    unsafe { frame_allocator::init(boot_info, kernel_start, kernel_end, mem_limit_override) };
    // SAFETY: CR3 already holds a valid directory by the time kernel_main
    // calls this.
    unsafe { paging::init() };
    // SAFETY: paging is initialized; the arena is empty of mappings.
    unsafe { vmm::init() };
}

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: slab::KernelAllocator = slab::KernelAllocator;
