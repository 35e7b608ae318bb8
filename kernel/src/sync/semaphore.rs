//! Counting semaphore with an explicit wait list.
//!
//! `wait` decrements and returns immediately if the count allows it;
//! otherwise the caller's task id is queued and the caller blocks.
//! `signal` increments and wakes the oldest waiter, if any; `signal_all`
//! drains the whole wait list, incrementing the count once per wake so it
//! never goes negative.

#![allow(dead_code)]

use alloc::collections::VecDeque;

use super::spinlock::Spinlock;

struct Inner {
    count: i32,
    wait_list: VecDeque<u32>,
}

pub struct Semaphore {
    inner: Spinlock<Inner>,
}

impl Semaphore {
    pub const fn new(initial: i32) -> Self {
        Semaphore {
            inner: Spinlock::new(Inner {
                count: initial,
                wait_list: VecDeque::new(),
            }),
        }
    }

    /// Blocks the calling task until a unit is available.
    ///
    /// Re-checks the count after every wake (rather than trusting the
    /// single wakeup that queued us) so a task woken early for an
    /// unrelated reason -- a signal delivery check in the scheduler, for
    /// instance -- can't steal a unit it wasn't granted.
    pub fn wait(&self) {
        loop {
            let mut inner = self.inner.lock();
            if inner.count > 0 {
                inner.count -= 1;
                return;
            }
            let tid = crate::sched::current_task_id();
            inner.wait_list.push_back(tid);
            drop(inner);
            crate::sched::block_current();
        }
    }

    /// Non-blocking `wait`: returns `true` and decrements iff a unit was
    /// immediately available.
    pub fn try_wait(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    pub fn signal(&self) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        let woken = inner.wait_list.pop_front();
        drop(inner);
        if let Some(tid) = woken {
            crate::sched::wake_task(tid);
        }
    }

    /// Wakes every waiter, granting each one a unit so the count is left
    /// non-negative. Used for broadcast-style events such as process exit.
    pub fn signal_all(&self) {
        self.signal_all_with(|| {})
    }

    /// `signal_all`, running `mark` while still holding the internal
    /// lock. Pairs with [`Semaphore::wait_while_not`] so a one-shot
    /// event like "this task is now a zombie" can be set and drained as
    /// a single atomic step with respect to a racing waiter's
    /// check-then-enqueue -- without this, a waiter could observe the
    /// old state, then find the wait list already drained by the time
    /// it enqueues itself, and block forever.
    pub fn signal_all_with(&self, mark: impl FnOnce()) {
        let mut inner = self.inner.lock();
        mark();
        let mut woken = VecDeque::new();
        core::mem::swap(&mut woken, &mut inner.wait_list);
        inner.count += woken.len() as i32;
        drop(inner);
        for tid in woken {
            crate::sched::wake_task(tid);
        }
    }

    /// Blocks until `ready` reports true, evaluating it under the same
    /// lock `signal_all_with` marks its event under -- see that
    /// function's doc comment for why this matters.
    pub fn wait_while_not(&self, ready: impl Fn() -> bool) {
        loop {
            let mut inner = self.inner.lock();
            if ready() {
                if inner.count > 0 {
                    inner.count -= 1;
                }
                return;
            }
            let tid = crate::sched::current_task_id();
            inner.wait_list.push_back(tid);
            drop(inner);
            crate::sched::block_current();
        }
    }
}
