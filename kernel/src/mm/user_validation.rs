//! Syscall-boundary user pointer validation.
//!
//! Every syscall handler that touches a user-supplied pointer runs it
//! through one of these checks first. None of them fault or allocate --
//! they only inspect the currently active page directory's PTEs.

#![allow(dead_code)]

use super::paging::{self, PageFlags};

/// Lower/upper bound of the user-mappable address range (below this is
/// the null-guard page and the ELF load window floor; at and above this
/// is the kernel arena).
pub const USER_ADDR_MIN: u32 = 0x0800_0000;
pub const USER_ADDR_MAX: u32 = 0xC000_0000;

/// `[p, p+len)` lies entirely within the user-addressable range, with no
/// wraparound. Does not check that the range is actually mapped.
pub fn check_user_buffer(p: u32, len: u32) -> bool {
    if len == 0 {
        return p >= USER_ADDR_MIN && p < USER_ADDR_MAX;
    }
    let Some(end) = p.checked_add(len) else {
        return false;
    };
    p >= USER_ADDR_MIN && end <= USER_ADDR_MAX
}

/// As [`check_user_buffer`], and every page in the range is present and
/// user-accessible in the active directory.
pub fn check_user_buffer_present(p: u32, len: u32) -> bool {
    if !check_user_buffer(p, len) {
        return false;
    }
    walk_pages(p, len, |pte| pte.flags().contains(PageFlags::USER))
}

/// As [`check_user_buffer_present`], additionally requiring every page be
/// writable -- used for handler output buffers.
pub fn check_user_buffer_writable_present(p: u32, len: u32) -> bool {
    if !check_user_buffer(p, len) {
        return false;
    }
    walk_pages(p, len, |pte| {
        pte.flags().contains(PageFlags::USER) && pte.flags().contains(PageFlags::WRITABLE)
    })
}

fn walk_pages(p: u32, len: u32, pred: impl Fn(paging::Pte) -> bool) -> bool {
    let dir = paging::active_directory();
    let start_page = p & !0xFFF;
    let end = p.saturating_add(len.max(1));
    let mut page = start_page;
    while page < end {
        match paging::paging_get_present_pte(dir, page) {
            Some(pte) if pred(pte) => {}
            _ => return false,
        }
        page = page.wrapping_add(paging::PAGE_SIZE);
    }
    true
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn rejects_ranges_outside_user_window() {
        assert!(!check_user_buffer(0, 16));
        assert!(!check_user_buffer(USER_ADDR_MAX - 4, 16));
        assert!(check_user_buffer(USER_ADDR_MIN, 16));
    }

    #[test]
    fn rejects_overflowing_length() {
        assert!(!check_user_buffer(USER_ADDR_MAX - 4, u32::MAX));
    }
}
