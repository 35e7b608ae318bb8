//! Two-level i386 paging: page directory / page table management,
//! TLB invalidation, and the fixmap window used to edit foreign
//! directories.

#![allow(dead_code)]

use spin::Mutex;

use super::frame_allocator::{self, FrameNumber};
use crate::error::{KernelError, KernelResult};

pub const ENTRIES_PER_TABLE: usize = 1024;
pub const PAGE_SIZE: u32 = 4096;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT    = 1 << 0;
        const WRITABLE   = 1 << 1;
        const USER       = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE   = 1 << 4;
        const ACCESSED   = 1 << 5;
        const DIRTY      = 1 << 6;
        const PAT        = 1 << 7;
        /// Software-defined: "do not free backing frame on teardown"
        /// (shared memory, direct MMIO mappings).
        const NO_FREE    = 1 << 9;
    }
}

#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Pte(u32);

impl Pte {
    pub const fn empty() -> Self {
        Pte(0)
    }

    pub fn new(frame: FrameNumber, flags: PageFlags) -> Self {
        Pte((frame.to_phys() & !0xFFF) | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn frame(self) -> FrameNumber {
        FrameNumber::from_phys(self.0 & !0xFFF)
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & 0xFFF)
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [Pte; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub const fn empty() -> Self {
        PageTable {
            entries: [Pte::empty(); ENTRIES_PER_TABLE],
        }
    }
}

fn pd_index(virt: u32) -> usize {
    (virt >> 22) as usize
}

fn pt_index(virt: u32) -> usize {
    ((virt >> 12) & 0x3FF) as usize
}

// ---------------------------------------------------------------------
// Fixmap
// ---------------------------------------------------------------------

/// Reserved kernel virtual window for temporarily mapping an arbitrary
/// physical frame -- used to edit a foreign page directory/table, or to
/// zero a freshly allocated frame while the kernel is not running on the
/// directory that owns it. One slot per CPU, capped at 16.
const FIXMAP_BASE: u32 = 0xFFFF_E000 - (16 * PAGE_SIZE);
const FIXMAP_SLOTS: usize = 16;

static FIXMAP_LOCKS: [Mutex<()>; FIXMAP_SLOTS] = [const { Mutex::new(()) }; FIXMAP_SLOTS];

/// A guard over one fixmap slot, unmapping it on drop.
pub struct FixmapGuard {
    slot: usize,
    vaddr: u32,
    _guard: spin::MutexGuard<'static, ()>,
}

impl FixmapGuard {
    pub fn vaddr(&self) -> u32 {
        self.vaddr
    }
}

impl Drop for FixmapGuard {
    fn drop(&mut self) {
        // SAFETY: this slot is exclusively owned by this guard for its
        // lifetime; unmapping it on drop is always sound.
        unsafe {
            unmap_in_kernel_directory(self.vaddr);
        }
        crate::arch::x86::flush_tlb_address(self.vaddr);
    }
}

/// Temporarily map `frame` into a fixmap slot for the calling CPU,
/// returning a guard that unmaps it on drop.
///
/// # Safety
/// Must not be called with interrupts disabled for longer than necessary
/// -- fixmap slots are a scarce, shared-by-convention resource (one per
/// CPU, but this kernel does not yet partition slots per-CPU-id, so
/// concurrent use serializes through the per-slot lock).
pub unsafe fn fixmap_frame(slot: usize, frame: FrameNumber) -> KernelResult<FixmapGuard> {
    if slot >= FIXMAP_SLOTS {
        return Err(KernelError::InvalidArgument {
            reason: "fixmap slot out of range",
        });
    }
    let guard = FIXMAP_LOCKS[slot].lock();
    let vaddr = FIXMAP_BASE + (slot as u32) * PAGE_SIZE;
    // SAFETY: vaddr is a reserved kernel-only fixmap slot, exclusively
    // held by `guard` for the duration of this mapping.
    unsafe {
        map_in_kernel_directory(vaddr, frame, PageFlags::PRESENT | PageFlags::WRITABLE)?;
    }
    crate::arch::x86::flush_tlb_address(vaddr);
    Ok(FixmapGuard {
        slot,
        vaddr,
        _guard: guard,
    })
}

// ---------------------------------------------------------------------
// Kernel directory access
// ---------------------------------------------------------------------

/// Physical address of the kernel's own page directory, set once by
/// `init`.
static KERNEL_PD_PHYS: Mutex<u32> = Mutex::new(0);

pub fn kernel_directory_phys() -> u32 {
    *KERNEL_PD_PHYS.lock()
}

/// # Safety
/// Must run once, with the kernel directory already loaded in CR3.
pub unsafe fn init() {
    let cr3 = crate::arch::x86::context::read_cr3();
    *KERNEL_PD_PHYS.lock() = cr3;
}

/// Map `virt -> phys` in the currently active page directory (assumed to
/// be the kernel directory -- call sites that need to edit a foreign
/// directory go through [`map_foreign`] instead).
///
/// # Safety
/// Caller must ensure `virt` is not already validly mapped to a
/// different frame without first unmapping it, and that CR3 currently
/// points at the directory they intend to edit.
pub unsafe fn map_in_kernel_directory(virt: u32, frame: FrameNumber, flags: PageFlags) -> KernelResult<()> {
    // SAFETY: delegated to caller; this directory is the active one.
    unsafe { paging_map(current_directory(), virt, frame, flags) }
}

/// # Safety
/// See [`map_in_kernel_directory`].
pub unsafe fn unmap_in_kernel_directory(virt: u32) {
    // SAFETY: delegated to caller.
    unsafe { paging_unmap(current_directory(), virt) }
}

fn current_directory() -> *mut PageTable {
    crate::arch::x86::context::read_cr3() as *mut PageTable
}

/// The directory currently loaded in CR3 -- the calling task's own
/// directory, not necessarily the kernel's. Used by call sites (user
/// pointer validation, page-fault handling) that want to inspect
/// whichever address space is presently active.
pub fn active_directory() -> *mut PageTable {
    current_directory()
}

/// Map a single page in an arbitrary (possibly not currently active)
/// directory, using the fixmap to reach its page tables when it isn't
/// the one CR3 currently holds.
///
/// Ensures a page table exists at the relevant PDE (allocating and
/// zeroing one through the PMM if not), writes the PTE, and either
/// broadcasts a TLB shootdown (kernel directory -- visible to every CPU)
/// or issues a local `invlpg` (a single process's own directory).
///
/// # Safety
/// `dir` must be a valid, currently-resident page directory physical
/// address cast to a pointer only for address arithmetic -- it is never
/// dereferenced directly except when it equals the active CR3.
pub unsafe fn paging_map(dir: *mut PageTable, virt: u32, frame: FrameNumber, flags: PageFlags) -> KernelResult<()> {
    let dir_phys = dir as u32;
    let is_current = dir_phys == crate::arch::x86::context::read_cr3();

    let pd_idx = pd_index(virt);
    let pt_idx = pt_index(virt);

    // SAFETY: when `is_current`, `dir` is the live, mapped directory.
    // When not, we reach it through the fixmap below instead.
    if is_current {
        unsafe {
            let directory = &mut *dir;
            ensure_page_table(directory, pd_idx)?;
            let pt_frame = directory.entries[pd_idx].frame();
            let pt = pt_frame.to_phys() as *mut PageTable;
            (*pt).entries[pt_idx] = Pte::new(frame, flags);
        }
    } else {
        // SAFETY: dir_phys names a valid directory frame per this
        // function's contract; the fixmap guard scopes the mapping.
        unsafe {
            let dir_guard = fixmap_frame(0, FrameNumber::from_phys(dir_phys))?;
            let directory = &mut *(dir_guard.vaddr() as *mut PageTable);
            ensure_page_table(directory, pd_idx)?;
            let pt_frame = directory.entries[pd_idx].frame();
            let pt_guard = fixmap_frame(1, pt_frame)?;
            let pt = &mut *(pt_guard.vaddr() as *mut PageTable);
            pt.entries[pt_idx] = Pte::new(frame, flags);
        }
    }

    if is_current && dir_phys == kernel_directory_phys() {
        crate::arch::x86::tlb::shootdown(virt, crate::sched::current_cpu_id());
    } else {
        crate::arch::x86::flush_tlb_address(virt);
    }
    Ok(())
}

/// # Safety
/// See [`paging_map`].
unsafe fn ensure_page_table(directory: &mut PageTable, pd_idx: usize) -> KernelResult<()> {
    if directory.entries[pd_idx].is_present() {
        return Ok(());
    }
    let frame = frame_allocator::alloc_block()?;
    // SAFETY: a freshly allocated frame is not yet referenced anywhere
    // else; zeroing it through its physical identity mapping is sound on
    // this identity-mapped kernel.
    unsafe {
        core::ptr::write_bytes(frame.to_phys() as *mut u8, 0, PAGE_SIZE as usize);
    }
    directory.entries[pd_idx] = Pte::new(frame, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER);
    Ok(())
}

/// # Safety
/// See [`paging_map`].
pub unsafe fn paging_unmap(dir: *mut PageTable, virt: u32) {
    let dir_phys = dir as u32;
    let is_current = dir_phys == crate::arch::x86::context::read_cr3();
    let pd_idx = pd_index(virt);
    let pt_idx = pt_index(virt);

    // SAFETY: same reasoning as paging_map.
    unsafe {
        if is_current {
            let directory = &mut *dir;
            if directory.entries[pd_idx].is_present() {
                let pt = directory.entries[pd_idx].frame().to_phys() as *mut PageTable;
                (*pt).entries[pt_idx] = Pte::empty();
            }
        } else if let Ok(dir_guard) = fixmap_frame(0, FrameNumber::from_phys(dir_phys)) {
            let directory = &mut *(dir_guard.vaddr() as *mut PageTable);
            if directory.entries[pd_idx].is_present() {
                if let Ok(pt_guard) = fixmap_frame(1, directory.entries[pd_idx].frame()) {
                    let pt = &mut *(pt_guard.vaddr() as *mut PageTable);
                    pt.entries[pt_idx] = Pte::empty();
                }
            }
        }
    }
    crate::arch::x86::flush_tlb_address(virt);
}

/// Translate `virt` to its backing physical address in `dir`, using the
/// fixmap when `dir` is not the active directory.
pub fn paging_get_phys(dir: *mut PageTable, virt: u32) -> Option<u32> {
    paging_get_present_pte(dir, virt).map(|pte| pte.frame().to_phys() | (virt & 0xFFF))
}

pub fn paging_is_user_accessible(dir: *mut PageTable, virt: u32) -> bool {
    paging_get_present_pte(dir, virt)
        .map(|pte| pte.flags().contains(PageFlags::USER))
        .unwrap_or(false)
}

/// Allocates a fresh page directory that shares every currently-present
/// kernel PDE by value with the master directory -- so a new task sees
/// every kernel mapping that exists *right now* without walking them
/// one at a time, at the cost of needing [`super::page_fault::handle`]'s
/// lazy-PDE-clone path to pick up any kernel mapping created later.
/// Returns the new directory's physical address.
pub fn new_user_directory() -> KernelResult<u32> {
    let dir_frame = frame_allocator::alloc_block()?;
    let dir_phys = dir_frame.to_phys();

    // SAFETY: a freshly allocated frame has no other mapping; the
    // fixmap guard scopes our exclusive access to it.
    unsafe {
        let guard = fixmap_frame(3, dir_frame)?;
        let new_dir = &mut *(guard.vaddr() as *mut PageTable);
        let kernel_dir_guard = fixmap_frame(4, FrameNumber::from_phys(kernel_directory_phys()))?;
        let kernel_dir = &*(kernel_dir_guard.vaddr() as *const PageTable);
        for i in 0..ENTRIES_PER_TABLE {
            if kernel_dir.entries[i].is_present() {
                new_dir.entries[i] = kernel_dir.entries[i];
            } else {
                new_dir.entries[i] = Pte::empty();
            }
        }
    }
    Ok(dir_phys)
}

/// Returns the frame backing the page table at directory index `pd_idx`,
/// if that PDE is present -- without touching any of its 1024 PTEs.
/// Lets a full-directory sweep (process teardown) skip straight over
/// whole unused page tables instead of probing every page in them.
pub fn pde_frame(dir: *mut PageTable, pd_idx: usize) -> Option<FrameNumber> {
    let dir_phys = dir as u32;
    let is_current = dir_phys == crate::arch::x86::context::read_cr3();
    // SAFETY: read-only; fixmap used when `dir` isn't the active directory.
    unsafe {
        if is_current {
            let directory = &*dir;
            directory.entries[pd_idx].is_present().then(|| directory.entries[pd_idx].frame())
        } else {
            let dir_guard = fixmap_frame(0, FrameNumber::from_phys(dir_phys)).ok()?;
            let directory = &*(dir_guard.vaddr() as *const PageTable);
            directory.entries[pd_idx].is_present().then(|| directory.entries[pd_idx].frame())
        }
    }
}

pub fn paging_get_present_pte(dir: *mut PageTable, virt: u32) -> Option<Pte> {
    let dir_phys = dir as u32;
    let is_current = dir_phys == crate::arch::x86::context::read_cr3();
    let pd_idx = pd_index(virt);
    let pt_idx = pt_index(virt);

    // SAFETY: read-only traversal of a directory the caller guarantees
    // is resident; fixmap used when foreign.
    unsafe {
        if is_current {
            let directory = &*dir;
            if !directory.entries[pd_idx].is_present() {
                return None;
            }
            let pt = directory.entries[pd_idx].frame().to_phys() as *const PageTable;
            let pte = (*pt).entries[pt_idx];
            pte.is_present().then_some(pte)
        } else {
            let dir_guard = fixmap_frame(0, FrameNumber::from_phys(dir_phys)).ok()?;
            let directory = &*(dir_guard.vaddr() as *const PageTable);
            if !directory.entries[pd_idx].is_present() {
                return None;
            }
            let pt_guard = fixmap_frame(1, directory.entries[pd_idx].frame()).ok()?;
            let pt = &*(pt_guard.vaddr() as *const PageTable);
            let pte = pt.entries[pt_idx];
            pte.is_present().then_some(pte)
        }
    }
}
