//! `poll`/`select`-style wait queues.
//!
//! A queue a blocking syscall registers against (a pipe's read side, a
//! PTY's input buffer, a listener's backlog, ...) and a per-call waiter
//! handle. The caller is responsible for unregistering its waiter before
//! returning on every path, including when woken by a pending signal
//! rather than by the event itself -- there is no task-side registry
//! here to sweep up stale registrations on task exit, so a leaked waiter
//! would otherwise sit in the queue forever.
//!
//! Grounded on the original kernel's `poll_waitq`, generalized from its
//! intrusive doubly linked list (which threads nodes through the task
//! struct directly) to a plain queue of task ids, since a waiter only
//! ever needs to name *who* to wake, not a pointer back into a `Task`
//! this crate's sync layer has no business depending on.

#![allow(dead_code)]

use alloc::collections::VecDeque;

use super::spinlock::Spinlock;

pub struct PollWaitq {
    waiters: Spinlock<VecDeque<u32>>,
}

/// A single caller's registration token. Create one on the stack for the
/// duration of a blocking wait; `register` before checking readiness,
/// `unregister` once done (whether woken by the event or by a signal).
#[derive(Default)]
pub struct PollWaiter {
    task_id: Option<u32>,
}

impl PollWaitq {
    pub const fn new() -> Self {
        PollWaitq {
            waiters: Spinlock::new(VecDeque::new()),
        }
    }

    pub fn register(&self, waiter: &mut PollWaiter, task_id: u32) {
        if waiter.task_id.is_some() {
            return;
        }
        waiter.task_id = Some(task_id);
        self.waiters.lock().push_back(task_id);
    }

    pub fn unregister(&self, waiter: &mut PollWaiter) {
        let Some(task_id) = waiter.task_id.take() else {
            return;
        };
        let mut list = self.waiters.lock();
        if let Some(pos) = list.iter().position(|&t| t == task_id) {
            list.remove(pos);
        }
    }

    /// Wakes every registered waiter, leaving them registered -- matches
    /// the callers' poll loop, which re-checks the condition and
    /// unregisters itself once satisfied.
    pub fn wake_all(&self) {
        let list = self.waiters.lock();
        for &tid in list.iter() {
            crate::sched::wake_task(tid);
        }
    }

    /// Wakes and removes every waiter. Used when the underlying object is
    /// being torn down (pipe closed, listener dropped) so nothing is left
    /// blocked on an object that will never signal again.
    pub fn detach_all(&self) {
        let mut list = self.waiters.lock();
        let drained: VecDeque<u32> = list.drain(..).collect();
        drop(list);
        for tid in drained {
            crate::sched::wake_task(tid);
        }
    }

    /// Wakes and removes up to `n` waiters, FIFO. Returns the number
    /// actually woken. Used by `futex_wake`, which bounds how many
    /// blocked tasks a single wake call disturbs.
    pub fn wake_up_to(&self, n: u32) -> u32 {
        let mut list = self.waiters.lock();
        let count = (n as usize).min(list.len());
        let drained: alloc::vec::Vec<u32> = list.drain(..count).collect();
        drop(list);
        for &tid in &drained {
            crate::sched::wake_task(tid);
        }
        drained.len() as u32
    }
}

impl Default for PollWaitq {
    fn default() -> Self {
        Self::new()
    }
}
