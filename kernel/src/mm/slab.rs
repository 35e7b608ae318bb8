//! SLUB-style slab allocator: nine power-of-two size-class caches backing
//! `kmalloc`/`kfree`, which in turn back the crate's `#[global_allocator]`.
//!
//! Each cache keeps a "current" CPU slab (one whole 4 KiB page, objects
//! consumed LIFO off an intrusive freelist) and a partial-slab list of
//! pages that are neither empty nor full. A fresh page comes from the
//! VMM arena; a page that empties out (and isn't the current slab) goes
//! back to it. Oversized requests (`size > 2048`) skip the caches
//! entirely and allocate whole pages directly, with the page count
//! stashed in the first page's descriptor so `kfree` can round-trip.

#![allow(dead_code)]

use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

use super::frame_allocator::{self, FrameNumber, PageDescriptor};
use super::paging;
use super::vmm;
use crate::error::{KernelError, KernelResult};

const SIZE_CLASSES: [u32; 9] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];
const PAGE_SIZE: u32 = 4096;

/// `bsr(size - 1) - 2`, clamped to the smallest class, mapping a
/// requested byte size to its cache index.
fn cache_index_for(size: usize) -> usize {
    let size = size.max(1) as u32;
    if size <= 8 {
        return 0;
    }
    let bsr = 31 - (size - 1).leading_zeros();
    bsr.saturating_sub(2).min(8) as usize
}

struct CacheState {
    /// `frame_number + 1` of the current CPU slab, 0 = none.
    cpu_slab: u32,
    /// `frame_number + 1` of the head of the partial-slab list, 0 = none.
    partial_head: u32,
}

struct SlabCache {
    object_size: u32,
    state: Mutex<CacheState>,
}

impl SlabCache {
    const fn new(object_size: u32) -> Self {
        SlabCache {
            object_size,
            state: Mutex::new(CacheState {
                cpu_slab: 0,
                partial_head: 0,
            }),
        }
    }

    fn objects_per_page(&self) -> u16 {
        (PAGE_SIZE / self.object_size) as u16
    }

    fn alloc(&self, idx: u8) -> KernelResult<u32> {
        loop {
            let mut state = self.state.lock();

            if state.cpu_slab != 0 {
                let frame = FrameNumber(state.cpu_slab - 1);
                let mut desc = frame_allocator::phys_to_page(frame);
                if desc.freelist != 0 {
                    let obj = desc.freelist;
                    // SAFETY: obj is a live free slot in a page this cache
                    // owns; its first 4 bytes hold the tagged next pointer.
                    let next = unsafe { core::ptr::read_volatile(obj as *const u32) };
                    desc.freelist = next;
                    desc.free_objects -= 1;
                    frame_allocator::set_page_descriptor(frame, desc);
                    return Ok(obj);
                }
                // Current slab exhausted; fall through to pull a
                // replacement from partial (or allocate fresh).
                state.cpu_slab = 0;
            }

            if state.partial_head != 0 {
                let frame = FrameNumber(state.partial_head - 1);
                let mut desc = frame_allocator::phys_to_page(frame);
                state.partial_head = desc.partial_next;
                if state.partial_head != 0 {
                    let head_frame = FrameNumber(state.partial_head - 1);
                    let mut head_desc = frame_allocator::phys_to_page(head_frame);
                    head_desc.partial_prev = 0;
                    frame_allocator::set_page_descriptor(head_frame, head_desc);
                }
                desc.partial_next = 0;
                desc.partial_prev = 0;
                frame_allocator::set_page_descriptor(frame, desc);
                state.cpu_slab = frame.0 + 1;
                continue;
            }

            drop(state);
            let virt = vmm::alloc_pages(1)?;
            let frame = virt_to_frame(virt)?;
            self.format_fresh_page(idx, frame, virt);

            let mut state = self.state.lock();
            state.cpu_slab = frame.0 + 1;
        }
    }

    fn format_fresh_page(&self, idx: u8, frame: FrameNumber, virt: u32) {
        let object_size = self.object_size;
        let count = self.objects_per_page();

        // Build the intrusive freelist: each free slot's first 4 bytes
        // hold the virtual address of the next free slot, 0 terminates.
        let mut next = 0u32;
        for i in (0..count).rev() {
            let slot = virt + (i as u32) * object_size;
            // SAFETY: slot lies inside the freshly mapped page.
            unsafe { core::ptr::write_volatile(slot as *mut u32, next) };
            next = slot;
        }

        frame_allocator::set_page_descriptor(
            frame,
            PageDescriptor {
                slab_cache: Some(idx),
                freelist: next,
                free_objects: count,
                partial_prev: 0,
                partial_next: 0,
                order_pages: 0,
                virt_base: virt,
            },
        );
    }

    /// Push `ptr` back onto its owning page's freelist; migrate the page
    /// between full / partial / current / empty-and-released as needed.
    fn free(&self, idx: u8, frame: FrameNumber, ptr: u32) {
        let mut state = self.state.lock();
        let mut desc = frame_allocator::phys_to_page(frame);
        let count = self.objects_per_page();

        // SAFETY: ptr is a slot inside a page this cache owns.
        unsafe { core::ptr::write_volatile(ptr as *mut u32, desc.freelist) };
        desc.freelist = ptr;
        let was_full = desc.free_objects == 0;
        desc.free_objects += 1;
        let now_empty = desc.free_objects == count;
        frame_allocator::set_page_descriptor(frame, desc);

        let is_current = state.cpu_slab == frame.0 + 1;

        if now_empty && !is_current {
            unlink_partial(&mut state, frame);
            frame_allocator::set_page_descriptor(frame, PageDescriptor::default());
            drop(state);
            // SAFETY: every slot on this page is free; the page carries
            // no live allocations.
            vmm::free_pages(desc.virt_base, 1);
            return;
        }

        if was_full && !is_current {
            // Page just became reclaimable; splice it onto the head of
            // the partial list.
            let mut desc = frame_allocator::phys_to_page(frame);
            desc.partial_next = state.partial_head;
            desc.partial_prev = 0;
            frame_allocator::set_page_descriptor(frame, desc);
            if state.partial_head != 0 {
                let old_head = FrameNumber(state.partial_head - 1);
                let mut old_desc = frame_allocator::phys_to_page(old_head);
                old_desc.partial_prev = frame.0 + 1;
                frame_allocator::set_page_descriptor(old_head, old_desc);
            }
            state.partial_head = frame.0 + 1;
        }
        let _ = idx;
    }
}

fn unlink_partial(state: &mut CacheState, frame: FrameNumber) {
    let desc = frame_allocator::phys_to_page(frame);
    if desc.partial_prev == 0 && desc.partial_next == 0 && state.partial_head != frame.0 + 1 {
        // Not on the partial list at all (was the current slab already
        // detached above, or never linked) -- nothing to do.
        return;
    }
    if desc.partial_prev != 0 {
        let prev = FrameNumber(desc.partial_prev - 1);
        let mut prev_desc = frame_allocator::phys_to_page(prev);
        prev_desc.partial_next = desc.partial_next;
        frame_allocator::set_page_descriptor(prev, prev_desc);
    } else if state.partial_head == frame.0 + 1 {
        state.partial_head = desc.partial_next;
    }
    if desc.partial_next != 0 {
        let next = FrameNumber(desc.partial_next - 1);
        let mut next_desc = frame_allocator::phys_to_page(next);
        next_desc.partial_prev = desc.partial_prev;
        frame_allocator::set_page_descriptor(next, next_desc);
    }
}

fn virt_to_frame(virt: u32) -> KernelResult<FrameNumber> {
    let dir = paging::kernel_directory_phys() as *mut paging::PageTable;
    paging::paging_get_phys(dir, virt)
        .map(FrameNumber::from_phys)
        .ok_or(KernelError::UnmappedMemory { addr: virt as usize })
}

static CACHES: [SlabCache; 9] = [
    SlabCache::new(SIZE_CLASSES[0]),
    SlabCache::new(SIZE_CLASSES[1]),
    SlabCache::new(SIZE_CLASSES[2]),
    SlabCache::new(SIZE_CLASSES[3]),
    SlabCache::new(SIZE_CLASSES[4]),
    SlabCache::new(SIZE_CLASSES[5]),
    SlabCache::new(SIZE_CLASSES[6]),
    SlabCache::new(SIZE_CLASSES[7]),
    SlabCache::new(SIZE_CLASSES[8]),
];

/// Allocate `size` bytes from the appropriate cache, or directly from the
/// VMM arena for oversized requests.
pub fn kmalloc(size: usize) -> KernelResult<u32> {
    if size == 0 {
        return Err(KernelError::InvalidArgument {
            reason: "zero-size allocation",
        });
    }
    if size > 2048 {
        let pages = ((size as u32) + PAGE_SIZE - 1) / PAGE_SIZE;
        let virt = vmm::alloc_pages(pages)?;
        let frame = virt_to_frame(virt)?;
        frame_allocator::set_page_descriptor(
            frame,
            PageDescriptor {
                order_pages: pages,
                virt_base: virt,
                ..Default::default()
            },
        );
        return Ok(virt);
    }
    let idx = cache_index_for(size);
    CACHES[idx].alloc(idx as u8)
}

/// Free a pointer previously returned by `kmalloc`.
///
/// # Safety
/// `ptr` must be a value previously returned by `kmalloc` and not yet
/// freed.
pub unsafe fn kfree(ptr: u32) {
    if ptr == 0 {
        return;
    }
    let page_virt = ptr & !0xFFF;
    let Ok(frame) = virt_to_frame(page_virt) else {
        return;
    };
    let desc = frame_allocator::phys_to_page(frame);
    match desc.slab_cache {
        Some(idx) => CACHES[idx as usize].free(idx, frame, ptr),
        None if desc.order_pages > 0 => {
            frame_allocator::set_page_descriptor(frame, PageDescriptor::default());
            vmm::free_pages(page_virt, desc.order_pages);
        }
        None => {}
    }
}

/// `GlobalAlloc` adapter over `kmalloc`/`kfree`, installed as the crate's
/// `#[global_allocator]`. Layout alignment beyond the cache's own
/// alignment (every size class is naturally aligned to itself, and every
/// class is a power of two) is satisfied by rounding the request up to
/// `layout.align()` before picking a cache.
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(layout.align());
        match kmalloc(size) {
            Ok(addr) => addr as *mut u8,
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: delegated to caller per GlobalAlloc's contract.
        unsafe { kfree(ptr as u32) };
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn cache_index_matches_size_classes() {
        assert_eq!(cache_index_for(1), 0);
        assert_eq!(cache_index_for(8), 0);
        assert_eq!(cache_index_for(9), 1);
        assert_eq!(cache_index_for(16), 1);
        assert_eq!(cache_index_for(17), 2);
        assert_eq!(cache_index_for(2048), 8);
    }
}
