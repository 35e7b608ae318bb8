//! IRQ-safe spinlock.
//!
//! `acquire_safe` saves `EFLAGS.IF`, masks interrupts, then spins on a
//! test-and-set until the lock is won; `release_safe` clears the lock and
//! restores `IF` from the saved flags. This gives critical sections that
//! are safe to take from both task context and interrupt context without
//! a separate IRQ-level concept: nothing running with this lock held can
//! be interrupted, so there is no deadlock between a holder and an IRQ
//! handler that wants the same lock.

use core::arch::asm;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

const IF_BIT: u32 = 1 << 9;

/// Reads `EFLAGS`, clears `IF`, and returns the pre-cli flags.
#[inline(always)]
fn cli_save() -> u32 {
    let flags: u32;
    // SAFETY: pushfl/popfl/cli are always valid in ring 0.
    unsafe {
        asm!(
            "pushfd",
            "cli",
            "pop {0}",
            out(reg) flags,
            options(nostack, preserves_flags)
        );
    }
    flags
}

/// Restores `IF` from a value previously returned by [`cli_save`].
#[inline(always)]
fn restore(flags: u32) {
    if flags & IF_BIT != 0 {
        // SAFETY: re-enabling interrupts is always valid in ring 0.
        unsafe { asm!("sti", options(nostack, preserves_flags)) };
    }
}

/// Runs `f` with interrupts disabled on the current CPU, restoring the
/// prior `IF` state on return (including on panic unwinding through it,
/// since this kernel aborts rather than unwinds).
pub fn without_interrupts<F: FnOnce() -> R, R>(f: F) -> R {
    let flags = cli_save();
    let result = f();
    restore(flags);
    result
}

/// A mutual-exclusion lock that disables interrupts on the current CPU
/// for the duration the lock is held.
pub struct Spinlock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through a held guard,
// which the compare-exchange in `lock` serializes.
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Spinlock<T> {
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let flags = cli_save();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        SpinlockGuard { lock: self, flags }
    }

    /// Non-blocking variant; still masks interrupts on success so the
    /// caller's critical section runs under the same guarantee as
    /// [`lock`](Self::lock). Returns `None` without touching `IF` if the
    /// lock is already held.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        let flags = cli_save();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard { lock: self, flags })
        } else {
            restore(flags);
            None
        }
    }
}

pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
    flags: u32,
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard means the compare-exchange above
        // succeeded and no other guard for this lock can exist.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see Deref.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore(self.flags);
    }
}
