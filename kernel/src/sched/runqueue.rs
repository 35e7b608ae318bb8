//! A single CPU's ready queue: tasks ordered by `vruntime`, lowest first.
//!
//! Grounded on `examples/original_source/src/kernel/sched.c`'s red-black
//! tree (`enqueue_task`/`dequeue_task`/`pick_next_cfs`), generalized to a
//! `BTreeMap<vruntime, Vec<Arc<Task>>>` the same way this tree's other
//! vruntime-ordered queue already does it (`sched::queue::CfsRunQueue` in
//! the stale teacher tree) -- the map's first entry is always the
//! leftmost node, so no separate cached pointer is needed.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::process::Task;

pub struct RunQueue {
    tasks: BTreeMap<u64, Vec<Arc<Task>>>,
    count: u32,
}

impl RunQueue {
    pub const fn new() -> Self {
        RunQueue { tasks: BTreeMap::new(), count: 0 }
    }

    pub fn enqueue(&mut self, task: Arc<Task>) {
        let vruntime = task.vruntime.load(core::sync::atomic::Ordering::Acquire);
        self.tasks.entry(vruntime).or_default().push(task);
        self.count += 1;
    }

    /// Removes and returns the task with the lowest `vruntime`.
    pub fn pick_next(&mut self) -> Option<Arc<Task>> {
        let (&key, bucket) = self.tasks.iter_mut().next()?;
        let task = bucket.remove(0);
        if bucket.is_empty() {
            self.tasks.remove(&key);
        }
        self.count -= 1;
        Some(task)
    }

    /// Removes one task by pid, regardless of where it sits in the tree.
    pub fn remove(&mut self, pid: crate::process::Pid) -> bool {
        let mut empty_key = None;
        let mut found = false;
        for (key, bucket) in self.tasks.iter_mut() {
            if let Some(pos) = bucket.iter().position(|t| t.pid == pid) {
                bucket.remove(pos);
                found = true;
                if bucket.is_empty() {
                    empty_key = Some(*key);
                }
                break;
            }
        }
        if let Some(key) = empty_key {
            self.tasks.remove(&key);
        }
        if found {
            self.count -= 1;
        }
        found
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    /// The lowest `vruntime` currently queued, or `baseline` if empty --
    /// used to seed a newly runnable task so it doesn't jump the whole
    /// queue by starting at zero.
    pub fn min_vruntime(&self, baseline: u64) -> u64 {
        self.tasks.keys().next().copied().unwrap_or(baseline)
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}
