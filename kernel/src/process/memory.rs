//! Demand-paging resolution for a task's address space: stack growth,
//! mmap faults, and heap growth, plus the syscalls that grow or
//! establish those regions (`sbrk`, `mmap`).
//!
//! Populating a freshly allocated frame (zeroing it, and for
//! file-backed mmap areas, reading the backing file into it) goes
//! through the fixmap rather than switching CR3 to the kernel directory
//! and back -- the fixmap already reaches any frame from kernel context
//! regardless of which directory is currently active, so there is no
//! directory dance to get wrong.

#![allow(dead_code)]

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::error::KernelResult;
use crate::fs::VfsNode;
use crate::mm::frame_allocator::{self, FrameNumber};
use crate::mm::paging::{self, PageFlags, PageTable};

use super::pcb::{MapFlags, MmapArea, ProcMem, Task};
use super::table;

const PAGE_SIZE: u32 = paging::PAGE_SIZE;
const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// Entry point for every user-mode `#PF`: tries stack growth, then the
/// mmap list, then heap growth, in that order. Returns `false` if none
/// apply -- the caller delivers SIGSEGV.
pub fn handle_user_fault(fault_addr: u32, _write: bool) -> bool {
    let Some(task) = table::current() else {
        return false;
    };
    let page_addr = fault_addr & !PAGE_MASK;

    let stack_floor = task.stack_floor.load(Ordering::Acquire);
    let stack_ceiling = task.stack_ceiling.load(Ordering::Acquire);
    if stack_ceiling != 0 && fault_addr >= stack_floor && fault_addr < stack_ceiling {
        return map_anon_page(&task, page_addr).is_ok();
    }

    let mmap_hit = {
        let mem = task.mem.lock();
        mem.find_mmap(fault_addr).map(|area| {
            (area.vaddr_start, area.file_offset, area.file_size, area.map_flags, area.file.clone())
        })
    };
    if let Some((vaddr_start, file_offset, file_size, map_flags, file)) = mmap_hit {
        return populate_mmap_page(&task, page_addr, vaddr_start, file_offset, file_size, map_flags, file).is_ok();
    }

    let (heap_start, prog_break) = {
        let mem = task.mem.lock();
        (mem.heap_start, mem.prog_break)
    };
    if fault_addr >= heap_start && fault_addr < prog_break {
        return map_anon_page(&task, page_addr).is_ok();
    }

    false
}

fn task_dir(task: &Task) -> *mut PageTable {
    task.mem.lock().page_dir_phys as *mut PageTable
}

fn map_anon_page(task: &Task, page_addr: u32) -> KernelResult<()> {
    let frame = frame_allocator::alloc_block()?;
    zero_frame(frame)?;
    let dir = task_dir(task);
    // SAFETY: `dir` is this task's own directory; `page_addr` had no
    // present PTE (that's exactly why the fault fired).
    unsafe { paging::paging_map(dir, page_addr, frame, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER) }
}

fn zero_frame(frame: FrameNumber) -> KernelResult<()> {
    // SAFETY: a freshly allocated frame has no other mapping yet, so a
    // fixmap slot onto it is exclusive for the scope of this guard.
    unsafe {
        let guard = paging::fixmap_frame(2, frame)?;
        core::ptr::write_bytes(guard.vaddr() as *mut u8, 0, PAGE_SIZE as usize);
    }
    Ok(())
}

fn populate_mmap_page(
    task: &Task,
    page_addr: u32,
    vaddr_start: u32,
    file_offset: u32,
    file_size: u32,
    map_flags: MapFlags,
    file: Option<Arc<dyn VfsNode>>,
) -> KernelResult<()> {
    let offset_in_area = page_addr - vaddr_start;

    // SHARED regions (named shm) hand back the same physical frame to
    // every mapper; there is nothing to zero or read, the backing node
    // already owns and initialized the frame.
    if map_flags.contains(MapFlags::SHARED) {
        if let Some(frame) = file.as_ref().and_then(|n| n.shared_frame((file_offset + offset_in_area) as usize)) {
            let dir = task_dir(task);
            // SAFETY: `dir` is this task's own directory; `page_addr` lies
            // inside a registered mmap area with no present PTE yet.
            unsafe {
                return paging::paging_map(
                    dir,
                    page_addr,
                    frame,
                    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
                );
            }
        }
    }

    let frame = frame_allocator::alloc_block()?;

    // SAFETY: frame was just allocated and is not yet mapped anywhere.
    unsafe {
        let guard = paging::fixmap_frame(2, frame)?;
        let dst = guard.vaddr() as *mut u8;
        core::ptr::write_bytes(dst, 0, PAGE_SIZE as usize);

        if let Some(node) = file.as_ref() {
            if offset_in_area < file_size {
                let readable = core::cmp::min(PAGE_SIZE, file_size - offset_in_area) as usize;
                let buf = core::slice::from_raw_parts_mut(dst, readable);
                let _ = node.read((file_offset + offset_in_area) as usize, buf);
            }
        }
    }

    let dir = task_dir(task);
    // SAFETY: `dir` is this task's own directory; `page_addr` lies
    // inside a registered mmap area with no present PTE yet.
    unsafe { paging::paging_map(dir, page_addr, frame, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER) }
}

/// `sys_sbrk`: grows or shrinks the heap break. Never eagerly maps
/// pages -- the new range is filled in lazily by the heap-fault case
/// above, matching how stack and mmap growth both behave.
pub fn sbrk(incr: i32) -> i32 {
    let Some(task) = table::current() else {
        return -1;
    };
    let mut mem = task.mem.lock();
    let old_break = mem.prog_break as i32;
    if incr == 0 {
        return old_break;
    }
    let new_break = if incr > 0 {
        mem.prog_break.wrapping_add(incr as u32)
    } else {
        mem.prog_break.wrapping_sub((-incr) as u32)
    };
    if new_break < mem.heap_start || new_break >= mem.mmap_top {
        return -1;
    }
    mem.prog_break = new_break;
    old_break
}

/// `sys_mmap`: reserves `length` bytes (rounded up to a page) above the
/// task's mmap watermark and registers a demand-paged area for it.
/// Anonymous if `file` is `None`; file-backed reads are resolved lazily
/// on first touch by `populate_mmap_page`.
pub fn mmap(task: &Task, file: Option<Arc<dyn VfsNode>>, length: u32, file_size: u32, flags: MapFlags) -> Option<u32> {
    if length == 0 {
        return None;
    }
    let mut mem = task.mem.lock();
    let aligned_len = (length + PAGE_MASK) & !PAGE_MASK;
    let vaddr_start = mem.mmap_top;
    let vaddr_end = vaddr_start.checked_add(aligned_len)?;
    mem.mmap_top = vaddr_end;
    mem.mmap_list.push(MmapArea {
        vaddr_start,
        vaddr_end,
        file_offset: 0,
        length,
        file_size: file_size.min(aligned_len),
        map_flags: flags,
        file,
    });
    Some(vaddr_start)
}

/// `sys_munmap`: tears down the mapping covering `[addr, addr+len)`.
/// Only an exact match against a previously returned `mmap` base is
/// honored -- partial unmap of a single area is not supported, matching
/// the original ABI's all-or-nothing `munmap` for its fixed-size
/// regions. Frees the backing frames unless the area is `SHARED`
/// (the backing node, not this mapping, owns those).
pub fn munmap(task: &Task, addr: u32, len: u32) -> Result<(), &'static str> {
    let dir = task_dir(task);
    let mut mem = task.mem.lock();
    let idx = mem
        .mmap_list
        .iter()
        .position(|a| a.vaddr_start == addr && a.vaddr_end - a.vaddr_start == (len + PAGE_MASK) & !PAGE_MASK)
        .ok_or("no such mapping")?;
    let area = mem.mmap_list.remove(idx);

    let mut page = area.vaddr_start;
    while page < area.vaddr_end {
        if let Some(pte) = paging::paging_get_present_pte(dir, page) {
            if !area.map_flags.contains(MapFlags::SHARED) {
                frame_allocator::free_block(pte.frame());
            }
            // SAFETY: dir is this task's own directory; unmapping a page
            // this area itself registered is always sound.
            unsafe { paging::paging_unmap(dir, page) };
            mem.mem_pages = mem.mem_pages.saturating_sub(1);
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Registers one ELF `PT_LOAD` segment as a `MAP_PRIVATE` file-backed
/// mmap area, aligning vaddr/offset/size down to a page the same way a
/// raw `mmap(2)` would for a misaligned request.
pub fn install_exec_segment(
    mem: &mut ProcMem,
    node: Arc<dyn VfsNode>,
    vaddr: u32,
    mem_size: u32,
    file_size: u32,
    file_offset: u32,
) {
    let aligned_vaddr = vaddr & !PAGE_MASK;
    let diff = vaddr - aligned_vaddr;
    let aligned_offset = file_offset.saturating_sub(diff);
    let aligned_size = (mem_size + diff + PAGE_MASK) & !PAGE_MASK;
    let aligned_file_size = (file_size + diff).min(aligned_size);

    mem.mmap_list.push(MmapArea {
        vaddr_start: aligned_vaddr,
        vaddr_end: aligned_vaddr + aligned_size,
        file_offset: aligned_offset,
        length: mem_size,
        file_size: aligned_file_size,
        map_flags: MapFlags::PRIVATE,
        file: Some(node),
    });
}
