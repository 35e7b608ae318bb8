//! Task termination: killing (with or without a signal), the zombie
//! transition, and reaping.
//!
//! Freeing a task's resources is left to `Arc`/`Drop`: once the last
//! `Arc<Task>` -- held by the scheduler run queue, the pid table, and
//! any in-flight `waitpid` caller -- goes away, `ProcMem`'s `Drop` tears
//! down the address space and the `FdTable`'s `Arc<FileDescriptor>`
//! slots close files the same way. `reap_pass` only has to drop the pid
//! table's reference once nothing else still needs the task alive.

#![allow(dead_code)]

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use super::pcb::{Task, TaskState};
use super::table;

/// Marks `task` a zombie with the given exit status, releasing its
/// children to the orphan parent (pid 1, or pid 0 if there is no init
/// yet) and waking every `waitpid` caller in one step.
pub fn kill(task: &Arc<Task>, status: i32) {
    let pid = task.pid;
    let orphan_parent = if pid == 1 { 0 } else { 1 };

    let mut children = Vec::new();
    table::for_each(|t| {
        if t.parent_pid.load(Ordering::Acquire) == pid {
            children.push(t.clone());
        }
    });
    for child in &children {
        child.parent_pid.store(orphan_parent, Ordering::Release);
    }

    crate::sched::remove(task);

    task.exit_status.store(status, Ordering::Release);
    task.exit_sem.signal_all_with(|| task.set_state(TaskState::Zombie));
}

/// Delivers `sig` as the cause of death: exit status follows the shell
/// convention `128 + sig`.
pub fn kill_with_signal(task: &Arc<Task>, sig: u32) {
    kill(task, 128 + sig as i32);
}

/// `sys_exit`: the current task terminates itself.
pub fn exit_current(status: i32) -> ! {
    let task = table::current().expect("exit_current with no current task");
    kill(&task, status);
    crate::sched::yield_now();
    unreachable!("a zombie task is never rescheduled");
}

/// Sweeps the task table for zombies nobody still references (not
/// running anywhere, no pending `waitpid`) and drops the pid table's
/// `Arc`, the last reference a fully reaped task needs to lose. Runs
/// from a dedicated low-priority kthread; see `process::creation::spawn_reaper`.
pub fn reap_pass() {
    let mut zombies = Vec::new();
    table::for_each(|t| {
        if t.state() == TaskState::Zombie && t.exit_waiters.load(Ordering::Acquire) == 0 {
            zombies.push(t.pid);
        }
    });
    for pid in zombies {
        table::remove(pid);
    }
}
