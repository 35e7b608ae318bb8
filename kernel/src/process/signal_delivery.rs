//! Signal numbers, per-task pending/handler bookkeeping, and the
//! dispatch handoff to the ring-3 return path.
//!
//! This module only decides *which* signal fires and *what* to do about
//! it (default-terminate, or hand back a dispatch for the caller to seed
//! onto the faulting task's stack). The actual frame surgery for a
//! caught signal is [`crate::syscall::maybe_deliver_signal`], run at the
//! one place this kernel's cooperative scheduling model returns to user
//! mode with a live register frame in hand: the tail of every syscall.

#![allow(dead_code)]

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::pcb::{Task, TaskState, NSIG};

pub mod signal {
    pub const SIGINT: u32 = 2;
    pub const SIGQUIT: u32 = 3;
    pub const SIGILL: u32 = 4;
    pub const SIGKILL: u32 = 9;
    pub const SIGSEGV: u32 = 11;
    pub const SIGTERM: u32 = 15;
    pub const SIGTSTP: u32 = 20;
    pub const SIGWINCH: u32 = 28;
}

/// Marks `sig` pending on `task`. Does not wake a task blocked in a
/// non-interruptible wait (the semaphores this kernel uses for `wait`,
/// pipe I/O, etc. are not signal-interruptible in this implementation).
pub fn raise(task: &Task, sig: u32) {
    if sig == 0 || sig as usize >= NSIG {
        return;
    }
    task.pending_signals.fetch_or(1 << sig, Ordering::AcqRel);
}

pub fn set_handler(task: &Task, sig: u32, handler: usize) -> bool {
    if sig == 0 || sig as usize >= NSIG {
        return false;
    }
    task.handlers.lock()[sig as usize] = handler;
    true
}

/// A signal ready to be seeded onto the current task's stack by the
/// return-to-user path.
pub struct SignalDispatch {
    pub signum: u32,
    pub handler: usize,
}

/// What happens to a signal that reaches a task with no handler
/// installed for it. Mirrors POSIX's default-disposition table, scoped
/// to the signals this kernel ever raises.
enum DefaultAction {
    Ignore,
    Stop,
    Terminate,
}

fn default_action(sig: u32) -> DefaultAction {
    match sig {
        signal::SIGWINCH => DefaultAction::Ignore,
        signal::SIGTSTP => DefaultAction::Stop,
        _ => DefaultAction::Terminate,
    }
}

/// Pops the lowest-numbered pending signal with a handler installed,
/// applying each intervening pending signal's default action along the
/// way. `SIGKILL` always terminates regardless of any installed handler.
/// Returns `None` once nothing pending has a handler.
pub fn take_dispatchable(task: &Arc<Task>) -> Option<SignalDispatch> {
    loop {
        let mask = task.pending_signals.load(Ordering::Acquire);
        if mask == 0 {
            return None;
        }
        let sig = mask.trailing_zeros();
        task.pending_signals.fetch_and(!(1 << sig), Ordering::AcqRel);

        if sig == signal::SIGKILL {
            super::exit::kill_with_signal(task, sig);
            continue;
        }

        let handler = task.handlers.lock()[sig as usize];
        if handler != 0 {
            return Some(SignalDispatch { signum: sig, handler });
        }

        match default_action(sig) {
            DefaultAction::Ignore => {}
            // No job-control resume path (SIGCONT) exists in this
            // kernel; parking the task is as far as "stop" goes.
            DefaultAction::Stop => task.set_state(TaskState::Waiting),
            DefaultAction::Terminate => super::exit::kill_with_signal(task, sig),
        }
    }
}

/// Delivers SIGSEGV to `task` via the default action: this kernel does
/// not attempt handler dispatch from inside the page-fault path itself
/// (there is no live register frame handy to redirect mid-fault), so a
/// fault that reaches here always terminates the task. A handler
/// installed for `SIGSEGV` only fires if the task raises it itself
/// through `kill()`.
pub fn deliver_fault_signal(task: &Arc<Task>, sig: u32) {
    super::exit::kill_with_signal(task, sig);
}
