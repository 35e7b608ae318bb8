//! `wait` / `waitpid`: blocking on a child task's exit.

#![allow(dead_code)]

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::pcb::{Pid, Task, TaskState};
use super::table;

/// Blocks the caller until `pid` becomes a zombie, returning its exit
/// status. `None` if no such task exists.
pub fn waitpid(pid: Pid) -> Option<i32> {
    let target = table::find(pid)?;
    target.exit_waiters.fetch_add(1, Ordering::AcqRel);

    target.exit_sem.wait_while_not(|| target.state() == TaskState::Zombie);

    let status = target.exit_status.load(Ordering::Acquire);
    target.exit_waiters.fetch_sub(1, Ordering::AcqRel);
    Some(status)
}

/// `wait()` with no specific pid: waits for the first child of the
/// caller to become a zombie. Returns `None` if the caller has no
/// children left at all (not even zombies).
pub fn wait_any() -> Option<(Pid, i32)> {
    let caller = table::current()?;
    loop {
        let mut zombie: Option<Arc<Task>> = None;
        let mut has_children = false;
        table::for_each(|t| {
            if t.parent_pid.load(Ordering::Acquire) == caller.pid && t.is_alive() {
                has_children = true;
                if zombie.is_none() && t.state() == TaskState::Zombie {
                    zombie = Some(t.clone());
                }
            }
        });
        let Some(child) = zombie else {
            if !has_children {
                return None;
            }
            crate::sched::yield_now();
            continue;
        };
        return waitpid(child.pid).map(|status| (child.pid, status));
    }
}
