//! Timed sleep: tasks parked until a target tick count, polled once per
//! timer interrupt.
//!
//! Grounded on `examples/original_source/src/kernel/proc.c`'s
//! `proc_sleep_add`/`proc_check_sleepers`/`proc_sleep_remove`, which keep
//! a list sorted by wake tick so the poll can stop at the first task not
//! yet due. A `BTreeMap<wake_tick, Vec<Pid>>` gives the same ordering
//! without an intrusive list.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::process::Pid;
use crate::sync::Spinlock;

static SLEEPERS: Spinlock<BTreeMap<u32, Vec<Pid>>> = Spinlock::new(BTreeMap::new());

pub fn add(pid: Pid, wake_tick: u32) {
    SLEEPERS.lock().entry(wake_tick).or_default().push(pid);
}

pub fn remove(pid: Pid) {
    let mut sleepers = SLEEPERS.lock();
    let mut empty_key = None;
    for (tick, pids) in sleepers.iter_mut() {
        if let Some(pos) = pids.iter().position(|&p| p == pid) {
            pids.remove(pos);
            if pids.is_empty() {
                empty_key = Some(*tick);
            }
            break;
        }
    }
    if let Some(tick) = empty_key {
        sleepers.remove(&tick);
    }
}

/// Pops every sleeper due by `current_tick` and wakes it. Called once per
/// timer tick; `try_lock` would be truer to the original's
/// `spinlock_try_acquire` (skip this tick rather than contend), but this
/// scheduler's tick handler already runs with interrupts disabled on a
/// single CPU at a time, so a plain lock is never contended here.
pub fn check_sleepers(current_tick: u32) {
    let due: Vec<Pid> = {
        let mut sleepers = SLEEPERS.lock();
        let mut due = Vec::new();
        let ready_ticks: Vec<u32> = sleepers.range(..=current_tick).map(|(&t, _)| t).collect();
        for tick in ready_ticks {
            if let Some(pids) = sleepers.remove(&tick) {
                due.extend(pids);
            }
        }
        due
    };
    for pid in due {
        super::wake_task(pid);
    }
}
