//! Framebuffer ownership and presentation.
//!
//! There is exactly one linear framebuffer, sourced from the bootloader's
//! multiboot2 framebuffer tag (`arch::x86::multiboot::FramebufferInfo`),
//! and exactly one owner at a time: `fb_acquire`/`fb_release` arbitrate
//! that, `fb_map` installs a fixed-vaddr user mapping of the physical
//! framebuffer for the current owner, and `fb_present` validates and
//! forwards a list of damage rectangles to whatever implements
//! [`FbBlitter`] -- the actual pixel copy (SIMD, non-temporal stores,
//! whatever the display driver wants) is someone else's problem; this
//! module only ever proves the request is safe to act on.
//!
//! Grounded on `syscall_fb_map`/`syscall_fb_acquire`/`syscall_fb_release`/
//! `syscall_fb_present` in `examples/original_source/src/kernel/syscall.c`.

#![allow(dead_code)]

extern crate alloc;

use alloc::boxed::Box;

use crate::arch::x86::multiboot::FramebufferInfo;
use crate::arch::x86::pat;
use crate::mm::frame_allocator::FrameNumber;
use crate::mm::paging::{self, PageFlags, PageTable};
use crate::mm::user_validation;
use crate::process::{table, Pid};
use crate::sync::spinlock::Spinlock;

const PAGE_SIZE: u32 = paging::PAGE_SIZE;

/// Fixed user-space address every task's framebuffer mapping lands at.
/// Fixed rather than allocated from the task's own mmap watermark because
/// the owning task's userland code is compiled expecting it at a known
/// address (matches the original ABI).
pub const FB_USER_VADDR_BASE: u32 = 0xB100_0000;

/// `fb_present` rejects requests naming more rects than this in one call.
const MAX_RECTS: usize = 4096;

static BOOT_FB: Spinlock<Option<FramebufferInfo>> = Spinlock::new(None);
static OWNER: Spinlock<Option<Pid>> = Spinlock::new(None);
static BLITTER: Spinlock<Option<Box<dyn FbBlitter>>> = Spinlock::new(None);

/// A caller-supplied damage rectangle in destination (screen) pixel
/// coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// The out-of-scope display-driver boundary: whatever actually moves
/// pixels into the physical framebuffer implements this, and registers
/// itself with [`set_blitter`]. `fb_present` has already proven every
/// source row is present and user-readable in the calling task's active
/// address space before calling in.
pub trait FbBlitter: Send + Sync {
    /// # Safety
    /// `src` is valid for `row_bytes` reads in the currently active page
    /// directory; `dst_row_offset` is a byte offset within `info`'s
    /// linear framebuffer, already clipped and 4-pixel aligned.
    unsafe fn blit_row(&self, info: &FramebufferInfo, dst_row_offset: u32, src: *const u8, row_bytes: u32);
}

/// Registers the display driver's blit implementation. `fb_present`
/// fails closed (no driver installed) until this is called.
pub fn set_blitter(blitter: Box<dyn FbBlitter>) {
    *BLITTER.lock() = Some(blitter);
}

/// Records the bootloader-reported framebuffer and reprograms PAT/MTRR
/// for write-combining over its physical range. Must run once, early in
/// boot, before any task calls `fb_map`.
pub fn init(info: Option<FramebufferInfo>) {
    pat::init();
    *BOOT_FB.lock() = info;

    let Some(info) = info else { return };
    let map_size = (info.pitch as u64) * (info.height as u64);
    let mtrr_size = map_size.next_power_of_two();
    if info.phys_addr & (mtrr_size - 1) == 0 {
        // SAFETY: runs once on the boot CPU during early init, before any
        // other CPU is started and before the framebuffer is mapped
        // anywhere.
        unsafe { pat::init_mtrr_wc(info.phys_addr, mtrr_size) };
    } else {
        crate::log_service::klog(
            crate::log_service::LogLevel::Warn,
            "fb",
            "framebuffer physical base not aligned for MTRR write-combining",
        );
    }
}

fn dst_bpp(info: &FramebufferInfo) -> u32 {
    (info.bpp as u32 / 8).max(1)
}

/// Takes ownership of the framebuffer for `pid`. Idempotent for the
/// current owner; fails if another task already holds it.
pub fn fb_acquire(pid: Pid) -> Result<(), &'static str> {
    let mut owner = OWNER.lock();
    match *owner {
        None => {
            *owner = Some(pid);
            Ok(())
        }
        Some(p) if p == pid => Ok(()),
        Some(_) => Err("framebuffer already owned by another task"),
    }
}

/// Releases ownership, tearing down any mapping `fb_map` installed for
/// `pid` first.
pub fn fb_release(pid: Pid) -> Result<(), &'static str> {
    {
        let owner = OWNER.lock();
        if *owner != Some(pid) {
            return Err("framebuffer not owned by caller");
        }
    }
    unmap_existing(pid);
    *OWNER.lock() = None;
    Ok(())
}

fn unmap_existing(pid: Pid) {
    let Some(task) = table::find(pid) else { return };
    let mut mem = task.mem.lock();
    if mem.fbmap_pages == 0 {
        return;
    }
    let dir = mem.page_dir_phys as *mut PageTable;
    for i in 0..mem.fbmap_pages {
        let vaddr = FB_USER_VADDR_BASE + i * PAGE_SIZE;
        // SAFETY: dir is this task's own directory; vaddr was mapped by
        // an earlier fb_map call in this same window and nothing else
        // ever maps there.
        unsafe { paging::paging_unmap(dir, vaddr) };
    }
    mem.mem_pages = mem.mem_pages.saturating_sub(mem.fbmap_pages);
    mem.fbmap_pages = 0;
    mem.fbmap_user_ptr = 0;
    mem.fbmap_size_bytes = 0;
    mem.fbmap_is_virtio = false;
}

/// Maps the physical framebuffer into `pid`'s address space at
/// [`FB_USER_VADDR_BASE`], replacing any prior mapping. Returns the user
/// vaddr the caller should treat as the framebuffer's first byte (the
/// physical base's page offset, if any, is folded in).
pub fn fb_map(pid: Pid) -> Result<u32, &'static str> {
    {
        let owner = OWNER.lock();
        if *owner != Some(pid) {
            return Err("framebuffer not owned by caller");
        }
    }
    let info: FramebufferInfo = (*BOOT_FB.lock()).ok_or("no framebuffer configured")?;
    let Some(task) = table::find(pid) else {
        return Err("task not found");
    };

    unmap_existing(pid);

    let map_size = (info.pitch as u64) * (info.height as u64);
    let page_offset = (info.phys_addr & (PAGE_SIZE as u64 - 1)) as u32;
    let aligned_base = (info.phys_addr & !(PAGE_SIZE as u64 - 1)) as u32;
    let pages = ((map_size + page_offset as u64 + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64) as u32;

    let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_FREE;
    if pat::cpu_has_pat() {
        flags |= PageFlags::PAT;
    }

    let mut mem = task.mem.lock();
    let dir = mem.page_dir_phys as *mut PageTable;
    for i in 0..pages {
        let frame = FrameNumber::from_phys(aligned_base + i * PAGE_SIZE);
        let vaddr = FB_USER_VADDR_BASE + i * PAGE_SIZE;
        // SAFETY: dir is this task's own directory; the fixed
        // framebuffer window is reserved for exactly this mapping.
        unsafe {
            paging::paging_map(dir, vaddr, frame, flags).map_err(|_| "out of memory mapping framebuffer")?;
        }
    }

    mem.fbmap_pages = pages;
    mem.fbmap_user_ptr = FB_USER_VADDR_BASE + page_offset;
    mem.fbmap_size_bytes = map_size as u32;
    mem.fbmap_is_virtio = false;
    mem.mem_pages += pages;

    Ok(mem.fbmap_user_ptr)
}

/// Clips `rect` to `[0, screen_w) x [0, screen_h)`, then aligns its
/// horizontal extent to a 4-pixel boundary and re-clips, matching the
/// original blit path's alignment requirement for its SIMD copy. Returns
/// `None` if nothing is left to draw.
fn clip_and_align(rect: &Rect, screen_w: u32, screen_h: u32) -> Option<Rect> {
    if rect.w == 0 || rect.h == 0 {
        return None;
    }
    if rect.x >= screen_w || rect.y >= screen_h {
        return None;
    }
    let x2 = rect.x.checked_add(rect.w)?.min(screen_w);
    let y2 = rect.y.checked_add(rect.h)?.min(screen_h);
    if x2 <= rect.x || y2 <= rect.y {
        return None;
    }

    let ax1 = rect.x & !3;
    let ax2 = ((x2 + 3) & !3).min(screen_w);
    if ax2 <= ax1 {
        return None;
    }

    Some(Rect { x: ax1, y: rect.y, w: ax2 - ax1, h: y2 - rect.y })
}

/// Validates every rect's source rows are present and user-readable in
/// the calling task's active address space, then hands each row to the
/// registered [`FbBlitter`]. Fails without touching the framebuffer if
/// any row fails validation or no blitter is registered -- partial
/// presents never happen.
pub fn fb_present(pid: Pid, src_ptr: u32, src_stride: u32, rects: &[Rect]) -> Result<u32, &'static str> {
    {
        let owner = OWNER.lock();
        if *owner != Some(pid) {
            return Err("framebuffer not owned by caller");
        }
    }
    if rects.len() > MAX_RECTS {
        return Err("too many rects in one present call");
    }
    let info: FramebufferInfo = (*BOOT_FB.lock()).ok_or("no framebuffer configured")?;
    let bpp = dst_bpp(&info);
    if src_stride < info.width * bpp {
        return Err("source stride smaller than a scanline");
    }

    let mut clipped_rects = alloc::vec::Vec::with_capacity(rects.len());
    for rect in rects {
        let Some(clipped) = clip_and_align(rect, info.width, info.height) else {
            continue;
        };
        let row_bytes = clipped.w * bpp;
        for row in 0..clipped.h {
            let row_addr = src_ptr
                .checked_add((clipped.y + row) * src_stride)
                .and_then(|a| a.checked_add(clipped.x * bpp))
                .ok_or("source row address overflow")?;
            if !user_validation::check_user_buffer_present(row_addr, row_bytes) {
                return Err("source row not mapped");
            }
        }
        clipped_rects.push(clipped);
    }

    let blitter = BLITTER.lock();
    let Some(blit) = blitter.as_ref() else {
        return Err("no display driver installed");
    };

    for clipped in &clipped_rects {
        let row_bytes = clipped.w * bpp;
        for row in 0..clipped.h {
            let src_row = (src_ptr + (clipped.y + row) * src_stride + clipped.x * bpp) as *const u8;
            let dst_offset = (clipped.y + row) * info.pitch + clipped.x * bpp;
            // SAFETY: src_row was validated present and readable above,
            // under the same active address space this still runs in
            // (no preemption point between validation and blit per rect
            // would still be sound even if one occurred, since the check
            // re-runs per row before this loop, not interleaved with it).
            unsafe { blit.blit_row(&info, dst_offset, src_row, row_bytes) };
        }
    }

    Ok(clipped_rects.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_rejects_offscreen_rect() {
        assert!(clip_and_align(&Rect { x: 2000, y: 0, w: 10, h: 10 }, 1920, 1080).is_none());
    }

    #[test]
    fn clip_aligns_x_to_four_pixels() {
        let r = clip_and_align(&Rect { x: 5, y: 5, w: 10, h: 10 }, 1920, 1080).unwrap();
        assert_eq!(r.x, 4);
        assert_eq!(r.x % 4, 0);
        assert_eq!(r.w % 4, 0);
    }

    #[test]
    fn clip_clamps_to_screen_bounds() {
        let r = clip_and_align(&Rect { x: 1910, y: 1070, w: 100, h: 100 }, 1920, 1080).unwrap();
        assert!(r.x + r.w <= 1920);
        assert!(r.y + r.h <= 1080);
    }

    #[test]
    fn clip_rejects_zero_size() {
        assert!(clip_and_align(&Rect { x: 0, y: 0, w: 0, h: 10 }, 1920, 1080).is_none());
    }
}
