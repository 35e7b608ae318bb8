//! `futex_wait`/`futex_wake`, keyed by physical address.
//!
//! Grounded on `examples/original_source/src/kernel/futex.c`'s table,
//! which keys each wait queue on the user word's physical page rather
//! than its virtual address -- two tasks that `mmap` the same shared
//! page at different virtual addresses still contend on the same key.
//! [`key_for`] does the virtual-to-physical translation via the active
//! page directory's PTEs (reusing the same page walk
//! `mm::user_validation` uses at the syscall boundary); the table itself
//! is a flat `BTreeMap<key, PollWaitq>` under a spinlock, generalizing
//! the original's open-addressed hash table the way this tree's other
//! global registries do (see `fs::devfs`'s device map).

#![allow(dead_code)]

extern crate alloc;

use alloc::collections::BTreeMap;

use crate::mm::paging;
use crate::process::TaskState;
use crate::sync::{
    poll_waitq::{PollWaitq, PollWaiter},
    spinlock::Spinlock,
};

/// Physical byte address of the 4-byte-aligned futex word, used as the
/// table key.
type FutexKey = u32;

static TABLE: Spinlock<BTreeMap<FutexKey, PollWaitq>> = Spinlock::new(BTreeMap::new());

/// Resolves `uaddr` (already alignment-checked by the syscall handler)
/// to the physical address backing it in the currently active
/// directory. `None` if the page is not present -- the caller treats
/// that as "nothing waiting here yet", matching Linux's behavior of
/// faulting the page in before keying on it rather than failing outright
/// (this kernel's user pages are always resident by the time a futex
/// word is touched, since `check_user_buffer_present` already ran).
fn key_for(uaddr: u32) -> Option<FutexKey> {
    let page = uaddr & !(paging::PAGE_SIZE - 1);
    let offset = uaddr & (paging::PAGE_SIZE - 1);
    let dir = paging::active_directory();
    let pte = paging::paging_get_present_pte(dir, page)?;
    Some((pte.frame().to_phys() & !(paging::PAGE_SIZE - 1)) + offset)
}

/// `futex_wait(&u32, expected)`. Returns `Ok(0)` once woken, `Err(())`
/// if `uaddr` no longer holds `expected` (the caller never blocked).
pub fn wait(uaddr: u32, expected: u32) -> Result<(), ()> {
    let Some(key) = key_for(uaddr) else {
        return Err(());
    };

    // Re-read under the table lock so a concurrent `wake` racing this
    // check can't slip in between the read and the enqueue.
    let mut table = TABLE.lock();
    // SAFETY: `uaddr` was validated present and user-writable by the
    // syscall boundary before this function was called.
    let current = unsafe { core::ptr::read_volatile(uaddr as *const u32) };
    if current != expected {
        return Err(());
    }
    // Mark ourselves Waiting before registering in the waitq and
    // dropping the table lock -- the same state-before-enqueue ordering
    // `sched::sleep_ms` uses. Otherwise a `wake` that acquires `TABLE`
    // in the gap between registering here and `block_current` actually
    // setting Waiting would see a `Running` task, reject the wakeup via
    // `wake_task`'s state guard, and still drain us from the queue --
    // losing the wakeup for good.
    if let Some(task) = crate::process::table::current() {
        task.set_state(TaskState::Waiting);
    }
    let waitq = table.entry(key).or_insert_with(PollWaitq::new);
    let mut waiter = PollWaiter::default();
    waitq.register(&mut waiter, crate::sched::current_task_id());
    drop(table);

    crate::sched::block_current();

    let table = TABLE.lock();
    if let Some(waitq) = table.get(&key) {
        waitq.unregister(&mut waiter);
    }
    Ok(())
}

/// `futex_wake(&u32, n)`. Returns the number of tasks woken.
pub fn wake(uaddr: u32, n: u32) -> u32 {
    let Some(key) = key_for(uaddr) else {
        return 0;
    };
    let table = TABLE.lock();
    let Some(waitq) = table.get(&key) else {
        return 0;
    };
    waitq.wake_up_to(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_with_no_waiters_returns_zero() {
        assert_eq!(wake(0x1000, 1), 0);
    }
}
