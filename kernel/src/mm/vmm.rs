//! Kernel virtual-address arena: `[ARENA_BASE, ARENA_BASE + ARENA_LEN)`.
//!
//! Free regions are tracked in a statically sized pool of nodes (capacity
//! [`POOL_CAPACITY`]), linked in address order so neighbours can be found
//! for coalescing, with a linear best-fit scan over that same list -- the
//! allocator is itself allocation-free. `alloc_pages` best-fits a free
//! region, splits off any surplus, then page-by-page pulls frames from
//! the PMM and maps them; `free_pages` reverses that and coalesces the
//! freed range back into its neighbours.

#![allow(dead_code)]

use spin::Mutex;

use super::frame_allocator;
use super::paging::{self, PageFlags};
use crate::error::{KernelError, KernelResult};

pub const ARENA_BASE: u32 = 0xC000_0000;
pub const PAGE_SIZE: u32 = 4096;
/// Top of the 32-bit address space, expressed in pages -- the arena's
/// exclusive upper bound (`0x1_0000_0000` doesn't fit in a `u32`).
pub const ARENA_PAGES: u32 = (0u32.wrapping_sub(ARENA_BASE)) / PAGE_SIZE;

const POOL_CAPACITY: usize = 4096;
const NIL: u16 = u16::MAX;

#[derive(Clone, Copy)]
struct Node {
    start: u32,
    pages: u32,
    addr_prev: u16,
    addr_next: u16,
}

impl Node {
    const fn empty() -> Self {
        Node {
            start: 0,
            pages: 0,
            addr_prev: NIL,
            addr_next: NIL,
        }
    }
}

struct Arena {
    pool: [Node; POOL_CAPACITY],
    free_list_head: u16,
    free_pool_head: u16,
}

impl Arena {
    const fn new() -> Self {
        Arena {
            pool: [Node::empty(); POOL_CAPACITY],
            free_list_head: NIL,
            free_pool_head: NIL,
        }
    }

    fn init(&mut self) {
        for i in 0..POOL_CAPACITY - 1 {
            self.pool[i].addr_next = (i + 1) as u16;
        }
        self.pool[POOL_CAPACITY - 1].addr_next = NIL;
        self.free_pool_head = 0;

        let root = self.take_slot();
        self.pool[root as usize] = Node {
            start: ARENA_BASE,
            pages: ARENA_PAGES,
            addr_prev: NIL,
            addr_next: NIL,
        };
        self.free_list_head = root;
    }

    fn take_slot(&mut self) -> u16 {
        let slot = self.free_pool_head;
        debug_assert_ne!(slot, NIL, "vmm node pool exhausted");
        if slot != NIL {
            self.free_pool_head = self.pool[slot as usize].addr_next;
        }
        slot
    }

    fn release_slot(&mut self, slot: u16) {
        self.pool[slot as usize] = Node::empty();
        self.pool[slot as usize].addr_next = self.free_pool_head;
        self.free_pool_head = slot;
    }

    /// Linear best-fit scan over the free list.
    fn best_fit(&self, pages: u32) -> Option<u16> {
        let mut best: Option<u16> = None;
        let mut cur = self.free_list_head;
        while cur != NIL {
            let node = self.pool[cur as usize];
            if node.pages >= pages && (best.is_none() || node.pages < self.pool[best.unwrap() as usize].pages) {
                best = Some(cur);
            }
            cur = node.addr_next;
        }
        best
    }

    fn unlink(&mut self, slot: u16) {
        let (prev, next) = (self.pool[slot as usize].addr_prev, self.pool[slot as usize].addr_next);
        if prev != NIL {
            self.pool[prev as usize].addr_next = next;
        } else {
            self.free_list_head = next;
        }
        if next != NIL {
            self.pool[next as usize].addr_prev = prev;
        }
    }

    fn insert_sorted(&mut self, mut node: Node) -> u16 {
        let slot = self.take_slot();
        let mut cur = self.free_list_head;
        let mut prev = NIL;
        while cur != NIL && self.pool[cur as usize].start < node.start {
            prev = cur;
            cur = self.pool[cur as usize].addr_next;
        }
        node.addr_prev = prev;
        node.addr_next = cur;
        self.pool[slot as usize] = node;
        if prev != NIL {
            self.pool[prev as usize].addr_next = slot;
        } else {
            self.free_list_head = slot;
        }
        if cur != NIL {
            self.pool[cur as usize].addr_prev = slot;
        }
        slot
    }

    /// Insert a freed range, coalescing with adjacent left/right
    /// neighbours in the address-ordered list.
    fn free_and_coalesce(&mut self, start: u32, pages: u32) {
        let mut node = Node {
            start,
            pages,
            addr_prev: NIL,
            addr_next: NIL,
        };

        let mut cur = self.free_list_head;
        let mut prev = NIL;
        while cur != NIL && self.pool[cur as usize].start < node.start {
            prev = cur;
            cur = self.pool[cur as usize].addr_next;
        }

        if prev != NIL {
            let p = self.pool[prev as usize];
            if p.start + p.pages * PAGE_SIZE == node.start {
                node.start = p.start;
                node.pages += p.pages;
                self.unlink(prev);
                self.release_slot(prev);
            }
        }

        if cur != NIL {
            let n = self.pool[cur as usize];
            if node.start + node.pages * PAGE_SIZE == n.start {
                node.pages += n.pages;
                self.unlink(cur);
                self.release_slot(cur);
            }
        }

        self.insert_sorted(node);
    }
}

// SAFETY: Arena is a plain array of Copy nodes, always accessed through
// the enclosing Mutex.
unsafe impl Send for Arena {}

static ARENA: Mutex<Arena> = Mutex::new(Arena::new());

/// # Safety
/// Must run once, before any `alloc_pages` call, after paging is set up.
pub unsafe fn init() {
    ARENA.lock().init();
}

/// Allocate `pages` contiguous 4 KiB virtual pages from the kernel arena,
/// backing each with a freshly allocated physical frame mapped
/// present+writable.
pub fn alloc_pages(pages: u32) -> KernelResult<u32> {
    if pages == 0 {
        return Err(KernelError::InvalidArgument {
            reason: "zero-page allocation",
        });
    }

    let start = {
        let mut arena = ARENA.lock();
        let slot = arena.best_fit(pages).ok_or(KernelError::OutOfMemory {
            requested: (pages * PAGE_SIZE) as usize,
        })?;
        let node = arena.pool[slot as usize];
        arena.unlink(slot);
        let start = node.start;
        if node.pages > pages {
            arena.free_and_coalesce(start + pages * PAGE_SIZE, node.pages - pages);
        }
        arena.release_slot(slot);
        start
    };

    for i in 0..pages {
        let virt = start + i * PAGE_SIZE;
        match frame_allocator::alloc_block() {
            Ok(frame) => {
                // SAFETY: virt is freshly carved out of the arena and not
                // mapped anywhere else.
                let mapped = unsafe {
                    paging::map_in_kernel_directory(virt, frame, PageFlags::PRESENT | PageFlags::WRITABLE)
                };
                if let Err(e) = mapped {
                    frame_allocator::free_block(frame);
                    free_partial(start, i);
                    return Err(e);
                }
            }
            Err(e) => {
                free_partial(start, i);
                return Err(e);
            }
        }
    }

    Ok(start)
}

fn free_partial(start: u32, mapped_pages: u32) {
    for i in 0..mapped_pages {
        unmap_and_free_one(start + i * PAGE_SIZE);
    }
    ARENA.lock().free_and_coalesce(start, mapped_pages.max(1));
}

fn unmap_and_free_one(virt: u32) {
    let kernel_dir = paging::kernel_directory_phys() as *mut paging::PageTable;
    if let Some(pte) = paging::paging_get_present_pte(kernel_dir, virt) {
        // SAFETY: unmapping a page this allocator owns exclusively.
        unsafe { paging::unmap_in_kernel_directory(virt) };
        if !pte.flags().contains(PageFlags::NO_FREE) {
            frame_allocator::free_block(pte.frame());
        }
    }
}

/// Release `pages` pages starting at `ptr` back to the arena, unmapping
/// and freeing each backing frame first.
pub fn free_pages(ptr: u32, pages: u32) {
    for i in 0..pages {
        unmap_and_free_one(ptr + i * PAGE_SIZE);
    }
    ARENA.lock().free_and_coalesce(ptr, pages);
}
