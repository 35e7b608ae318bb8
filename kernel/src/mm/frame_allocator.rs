//! Physical frame allocator.
//!
//! A flat bitmap over 4 KiB frames. Deliberately dumb: one global lock,
//! first-fit scan, no zones, no buddy system. Allocation policy (which
//! caller gets which frame, and why) lives above this layer in the slab
//! allocator and the VMM/demand-paging paths, not here.

#![allow(dead_code)]

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::arch::x86::multiboot::BootInfo;
use crate::error::{KernelError, KernelResult};

pub const FRAME_SIZE: usize = 4096;

/// A physical frame number (physical address / `FRAME_SIZE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub u32);

impl FrameNumber {
    pub const fn new(n: u32) -> Self {
        FrameNumber(n)
    }

    pub fn to_phys(self) -> u32 {
        self.0 * FRAME_SIZE as u32
    }

    pub fn from_phys(phys: u32) -> Self {
        FrameNumber(phys / FRAME_SIZE as u32)
    }
}

/// A contiguous physical memory range, as reported by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: FrameNumber,
    pub count: u32,
}

/// Maximum frames this allocator can track: 4 GiB / 4 KiB = 2^20 frames,
/// needing a 128 KiB bitmap. Sized for the largest address space an i386
/// kernel can address.
const MAX_FRAMES: usize = 1 << 20;
const BITMAP_WORDS: usize = MAX_FRAMES / 64;

struct Bitmap {
    words: [u64; BITMAP_WORDS],
    total_frames: u32,
}

impl Bitmap {
    const fn new() -> Self {
        // All-ones: frames start out "reserved" until `init` marks usable
        // ranges free.
        Bitmap {
            words: [u64::MAX; BITMAP_WORDS],
            total_frames: 0,
        }
    }

    fn mark_free(&mut self, frame: FrameNumber) {
        let idx = frame.0 as usize;
        if idx >= MAX_FRAMES {
            return;
        }
        self.words[idx / 64] &= !(1u64 << (idx % 64));
    }

    fn mark_used(&mut self, frame: FrameNumber) {
        let idx = frame.0 as usize;
        if idx >= MAX_FRAMES {
            return;
        }
        self.words[idx / 64] |= 1u64 << (idx % 64);
    }

    fn is_free(&self, frame: FrameNumber) -> bool {
        let idx = frame.0 as usize;
        if idx >= MAX_FRAMES {
            return false;
        }
        self.words[idx / 64] & (1u64 << (idx % 64)) == 0
    }

    /// First-fit scan for a single free frame.
    fn find_free(&self) -> Option<FrameNumber> {
        for (i, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros();
                let frame = (i * 64) as u32 + bit;
                if frame < self.total_frames {
                    return Some(FrameNumber(frame));
                }
            }
        }
        None
    }
}

// SAFETY: Bitmap is a plain array of u64s, always accessed through the
// enclosing Mutex.
unsafe impl Send for Bitmap {}

static BITMAP: Mutex<Bitmap> = Mutex::new(Bitmap::new());
static FREE_FRAMES: AtomicUsize = AtomicUsize::new(0);
static TOTAL_FRAMES: AtomicUsize = AtomicUsize::new(0);

/// Low memory permanently reserved: real-mode IVT/BDA, the SMP trampoline
/// page, and the conventional ISA hole (0xA0000-0x100000, VGA/BIOS ROM).
fn is_permanently_reserved(frame: FrameNumber) -> bool {
    let phys = frame.to_phys();
    phys < 0x1000 || (phys >= 0xA0000 && phys < 0x100000)
}

/// Build the frame bitmap from the bootloader-reported memory map,
/// reserving low memory and everything occupied by the kernel image
/// itself.
///
/// # Safety
/// Must run once, early in boot, before any other PMM call.
pub unsafe fn init(boot_info: &BootInfo, kernel_start: u32, kernel_end: u32, mem_limit_override: Option<u64>) {
    let mut bitmap = BITMAP.lock();
    let mut total = 0u32;

    for region in &boot_info.regions[..boot_info.region_count] {
        let mut base = region.base;
        let mut length = region.length;
        if let Some(limit) = mem_limit_override {
            if base >= limit {
                continue;
            }
            length = length.min(limit - base);
        }

        base = (base + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1);
        let frame_count = (length / FRAME_SIZE as u64) as u32;
        let start_frame = FrameNumber::from_phys(base as u32);

        for i in 0..frame_count {
            let frame = FrameNumber(start_frame.0 + i);
            if frame.0 as usize >= MAX_FRAMES {
                break;
            }
            if is_permanently_reserved(frame) {
                continue;
            }
            if frame.to_phys() >= kernel_start && frame.to_phys() < kernel_end {
                continue;
            }
            bitmap.mark_free(frame);
            total = total.max(frame.0 + 1);
        }
    }

    bitmap.total_frames = total;
    drop(bitmap);
    TOTAL_FRAMES.store(total as usize, Ordering::Release);

    let bitmap = BITMAP.lock();
    let free = (0..total).filter(|&f| bitmap.is_free(FrameNumber(f))).count();
    FREE_FRAMES.store(free, Ordering::Release);
}

/// Allocate a single 4 KiB physical frame.
pub fn alloc_block() -> KernelResult<FrameNumber> {
    let mut bitmap = BITMAP.lock();
    match bitmap.find_free() {
        Some(frame) => {
            bitmap.mark_used(frame);
            FREE_FRAMES.fetch_sub(1, Ordering::AcqRel);
            Ok(frame)
        }
        None => {
            crate::log_service::log_warn(
                "pmm",
                "out of physical frames",
            );
            Err(KernelError::OutOfMemory { requested: FRAME_SIZE })
        }
    }
}

/// Release a previously allocated frame back to the pool.
pub fn free_block(frame: FrameNumber) {
    let mut bitmap = BITMAP.lock();
    if bitmap.is_free(frame) {
        crate::log_service::log_warn("pmm", "double free of physical frame");
        return;
    }
    bitmap.mark_free(frame);
    FREE_FRAMES.fetch_add(1, Ordering::AcqRel);
}

pub fn free_frame_count() -> usize {
    FREE_FRAMES.load(Ordering::Acquire)
}

pub fn total_frame_count() -> usize {
    TOTAL_FRAMES.load(Ordering::Acquire)
}

/// Per-frame bookkeeping used by the slab allocator: which cache (if any)
/// owns this page, its intrusive freelist head and free-object count, its
/// links into that cache's partial-slab list, and -- for an oversized
/// `kmalloc` that allocated whole pages directly rather than through a
/// cache -- the page count so `kfree` can round-trip.
///
/// `partial_prev`/`partial_next` store `frame_number + 1` (0 means "no
/// link"); frame 0 is permanently reserved low memory and so never a
/// valid slab page, making 0 a safe sentinel.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageDescriptor {
    pub slab_cache: Option<u8>,
    pub freelist: u32,
    pub free_objects: u16,
    pub partial_prev: u32,
    pub partial_next: u32,
    pub order_pages: u32,
    /// Kernel virtual address this page is mapped at (the slab/VMM arena
    /// address, not its physical one) -- needed to hand the page back to
    /// `vmm::free_pages` when it becomes fully free.
    pub virt_base: u32,
}

/// Descriptor table covers the first 128 MiB of physical memory (32768
/// frames) -- comfortably more than a QEMU test instance needs for slab
/// and VMM bookkeeping. Frames above this (rare, high-memory test
/// configurations) simply aren't tracked by the slab ownership map; the
/// PMM bitmap itself has no such limit.
const TRACKED_FRAMES: usize = 32768;

static PAGE_DESCRIPTORS: Mutex<PageDescriptorTable> = Mutex::new(PageDescriptorTable::new());

struct PageDescriptorTable {
    entries: [PageDescriptor; TRACKED_FRAMES],
}

impl PageDescriptorTable {
    const fn new() -> Self {
        PageDescriptorTable {
            entries: [PageDescriptor {
                slab_cache: None,
                freelist: 0,
                free_objects: 0,
                partial_prev: 0,
                partial_next: 0,
                order_pages: 0,
                virt_base: 0,
            }; TRACKED_FRAMES],
        }
    }
}

// SAFETY: plain array of Copy data, always accessed through the Mutex.
unsafe impl Send for PageDescriptorTable {}

fn descriptor_slot(frame: FrameNumber) -> Option<usize> {
    let idx = frame.0 as usize;
    (idx < TRACKED_FRAMES).then_some(idx)
}

pub fn set_page_descriptor(frame: FrameNumber, desc: PageDescriptor) {
    if let Some(slot) = descriptor_slot(frame) {
        PAGE_DESCRIPTORS.lock().entries[slot] = desc;
    }
}

pub fn phys_to_page(frame: FrameNumber) -> PageDescriptor {
    descriptor_slot(frame)
        .map(|slot| PAGE_DESCRIPTORS.lock().entries[slot])
        .unwrap_or_default()
}
