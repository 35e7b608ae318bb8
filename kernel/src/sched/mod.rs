//! The CFS-style scheduler: one ready queue per CPU, ordered by
//! `vruntime`, plus timed sleep and the idle fallback task.
//!
//! Grounded throughout on `examples/original_source/src/kernel/sched.c`:
//! `sched_add`/`sched_yield`/`sched_remove` map directly to [`add`],
//! [`yield_now`], and [`remove`] below, and the weight table and
//! `delta_vruntime` formula are carried over unchanged. The one
//! structural difference is the ready queue itself -- an intrusive
//! red-black tree there, a `BTreeMap` keyed by `vruntime` here (see
//! [`runqueue`]) -- which needs no separate "leftmost" pointer since a
//! `BTreeMap`'s first entry already is the leftmost node.

#![allow(dead_code)]

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

mod percpu;
mod runqueue;
mod sleepq;

use crate::process::table::MAX_CPUS;
use crate::process::{Pid, Priority, Task, TaskState};

/// CFS's NICE_0_LOAD: the weight a default-priority task is normalized
/// against when converting wall-clock ticks to vruntime.
const NICE_0_LOAD: u64 = 1024;

/// Global tick counter, bumped only by CPU 0 per SPEC_FULL's "BSP only
/// for timer_ticks" rule; everything that needs an absolute wake time
/// (sleep, the best-CPU cache) reads this rather than a per-CPU counter.
static TICKS: AtomicU32 = AtomicU32::new(0);

/// The quantum (in ticks) granted to GUI/USER priority tasks, overridable
/// for deterministic host-side tests; everything else always uses
/// [`Priority::default_quantum`].
static GUI_QUANTUM_OVERRIDE: AtomicU32 = AtomicU32::new(0);
static USER_QUANTUM_OVERRIDE: AtomicU32 = AtomicU32::new(0);

/// Ticks remaining in the current task's quantum, one counter per CPU.
static QUANTUM_LEFT: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

/// Weight table mirroring Linux's nice-value scale (6-bit log), indexed
/// by this kernel's six priority tiers rather than the original's full
/// 40-entry nice range -- values are the same table's entries at the
/// nice offsets each tier corresponds to.
fn weight_for(priority: Priority) -> u64 {
    match priority {
        Priority::Idle => 15,
        Priority::Low => 335,
        Priority::User => NICE_0_LOAD,
        Priority::High => 3121,
        Priority::Gui => 9548,
        Priority::Super => 29154,
    }
}

fn delta_vruntime(delta_exec: u64, weight: u64) -> u64 {
    if weight == 0 {
        return delta_exec;
    }
    (delta_exec * NICE_0_LOAD) / weight
}

fn quantum_for(priority: Priority) -> u32 {
    match priority {
        Priority::Gui => {
            let over = GUI_QUANTUM_OVERRIDE.load(Ordering::Relaxed);
            if over != 0 { over } else { priority.default_quantum() }
        }
        Priority::User => {
            let over = USER_QUANTUM_OVERRIDE.load(Ordering::Relaxed);
            if over != 0 { over } else { priority.default_quantum() }
        }
        _ => priority.default_quantum(),
    }
}

/// Lets a deterministic host-side test pin the GUI/USER quantum lengths.
/// Passing `0` restores [`Priority::default_quantum`].
pub fn set_quantum_overrides(gui: u32, user: u32) {
    GUI_QUANTUM_OVERRIDE.store(gui, Ordering::Relaxed);
    USER_QUANTUM_OVERRIDE.store(user, Ordering::Relaxed);
}

/// Brings up the scheduler for the boot CPU: registers it as CPU index
/// 0 and gives it an idle task. Call once, after `process::table::init`
/// and before the first task is spawned.
pub fn init() {
    let apic_id = crate::arch::x86::apic::read_id().unwrap_or(0);
    let idx = percpu::register(apic_id);
    spawn_idle_for(idx);
}

/// The per-AP half of bring-up: registers this core's CPU index and
/// gives it its own idle task. Called from [`crate::arch::x86::smp`]'s
/// `ap_entry` once that core's GDT/IDT are live.
pub fn register_this_cpu() {
    let apic_id = crate::arch::x86::apic::read_id().unwrap_or(0);
    let idx = percpu::register(apic_id);
    spawn_idle_for(idx);
    crate::arch::x86::fpu::init();
}

fn spawn_idle_for(cpu_idx: u8) {
    extern "C" fn idle_entry() -> ! {
        loop {
            crate::arch::x86::enable_interrupts();
            crate::arch::idle();
        }
    }
    let task = crate::process::creation::spawn_idle(idle_entry);
    *percpu::cpu(cpu_idx).idle_task.lock() = Some(task);
}

pub fn current_cpu_id() -> u8 {
    percpu::current_cpu_id()
}

pub fn current_task_id() -> Pid {
    crate::process::table::current().map(|t| t.pid).unwrap_or(0)
}

/// Adds `task` to its assigned CPU's ready queue, choosing a CPU for it
/// first if this is its first time being scheduled.
pub fn add(task: &Arc<Task>) {
    if task.assigned_cpu.load(Ordering::Acquire) < 0 {
        let chosen = percpu::best_cpu_for_new_task(TICKS.load(Ordering::Acquire));
        task.assigned_cpu.store(chosen as i32, Ordering::Release);
    }
    let idx = task.assigned_cpu.load(Ordering::Acquire) as u8;
    let cpu = percpu::cpu(idx);

    if task.vruntime.load(Ordering::Acquire) == 0 {
        let baseline = cpu.sched_ticks.load(Ordering::Acquire) * NICE_0_LOAD;
        let seeded = cpu.runq.lock().min_vruntime(baseline);
        task.vruntime.store(seeded, Ordering::Release);
    }

    cpu.total_priority_weight.fetch_add(task.priority as u32, Ordering::AcqRel);
    cpu.total_task_count.fetch_add(1, Ordering::AcqRel);
    cpu.runq.lock().enqueue(task.clone());
    percpu::invalidate_cache_for(idx);
}

/// Removes `task` from whichever CPU's ready queue it is on, e.g. because
/// it just exited. A no-op if it was not actually queued (it may be the
/// currently-running task, or already blocked).
pub fn remove(task: &Arc<Task>) {
    let idx = task.assigned_cpu.load(Ordering::Acquire);
    if idx < 0 || idx as usize >= MAX_CPUS {
        return;
    }
    let cpu = percpu::cpu(idx as u8);
    let weight = task.priority as u32;
    cpu.total_priority_weight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| Some(w.saturating_sub(weight))).ok();
    cpu.total_task_count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1))).ok();
    percpu::invalidate_cache_for(idx as u8);
    cpu.runq.lock().remove(task.pid);
}

/// Blocks the current task (marks it `Waiting` and switches away). The
/// caller is responsible for having already arranged a wakeup path
/// (enqueuing onto a wait list some other task will drain).
pub fn block_current() {
    if let Some(task) = crate::process::table::current() {
        task.set_state(TaskState::Waiting);
    }
    yield_now();
}

/// Makes `pid` runnable again and re-adds it to its CPU's ready queue.
/// A no-op if the task has already exited or is not actually blocked.
pub fn wake_task(pid: Pid) {
    let Some(task) = crate::process::table::find(pid) else {
        return;
    };
    if !matches!(task.state(), TaskState::Waiting | TaskState::Runnable) {
        return;
    }
    task.set_state(TaskState::Runnable);
    add(&task);
}

/// Parks the current task until at least `ms` milliseconds of scheduler
/// ticks have elapsed, per SPEC_FULL's `1/15000 s` tick period.
pub fn sleep_ms(ms: u32) {
    const TICKS_PER_MS: u32 = 15; // 15000 Hz / 1000
    let Some(task) = crate::process::table::current() else {
        return;
    };
    let wake_at = TICKS.load(Ordering::Acquire).wrapping_add(ms.saturating_mul(TICKS_PER_MS).max(1));
    task.wake_tick.store(wake_at, Ordering::Release);
    task.set_state(TaskState::Waiting);
    sleepq::add(task.pid, wake_at);
    yield_now();
}

/// Switches away from the current task: ages its `vruntime`, re-enqueues
/// it if it is still runnable, then dispatches the next task on this
/// CPU's ready queue (or the idle task if none is ready).
pub fn yield_now() {
    let _guard = crate::arch::x86::disable_interrupts();
    let cpu_idx = current_cpu_id();
    let cpu = percpu::cpu(cpu_idx);

    let prev = crate::process::table::current();
    if let Some(ref prev_task) = prev {
        age_vruntime(prev_task, cpu);
        if prev_task.state() == TaskState::Running {
            prev_task.set_state(TaskState::Runnable);
            add(prev_task);
        }
        save_fpu(prev_task);
    }

    loop {
        let next = cpu.runq.lock().pick_next();
        let next = match next {
            Some(n) => n,
            None => match cpu.idle_task.lock().clone() {
                Some(idle) => idle,
                None => return,
            },
        };

        let resuming_self = prev.as_ref().is_some_and(|p| Arc::ptr_eq(p, &next));

        next.set_state(TaskState::Running);
        next.exec_start.store(cpu.sched_ticks.load(Ordering::Acquire), Ordering::Release);
        QUANTUM_LEFT[cpu_idx as usize].store(quantum_for(next.priority), Ordering::Release);

        if resuming_self {
            // Only task runnable on this CPU: stays on its own stack, no
            // switch_to or CR3 reload needed.
            return;
        }

        crate::process::table::set_current(Some(next.clone()));
        restore_fpu(&next);

        let next_dir = next.mem.lock().page_dir_phys;
        // SAFETY: next_dir is a fully populated directory owned by
        // `next`, installed before it was ever linked into a run queue.
        unsafe { crate::arch::x86::context::write_cr3(next_dir) };

        let next_esp = next.esp.load(Ordering::Acquire);
        match prev {
            Some(ref prev_task) => {
                let prev_esp_slot = &prev_task.esp;
                // SAFETY: both stacks are live kernel stacks owned by
                // their tasks; interrupts are disabled by `_guard`.
                unsafe {
                    let mut saved: u32 = 0;
                    crate::arch::x86::context::switch_to(&mut saved, next_esp);
                    prev_esp_slot.store(saved, Ordering::Release);
                }
            }
            None => {
                let mut discard: u32 = 0;
                // SAFETY: no outgoing task exists yet (first dispatch
                // ever on this CPU); the discarded slot is never read.
                unsafe { crate::arch::x86::context::switch_to(&mut discard, next_esp) };
            }
        }
        return;
    }
}

fn age_vruntime(task: &Arc<Task>, cpu: &percpu::CpuData) {
    let exec_start = task.exec_start.load(Ordering::Acquire);
    if exec_start == 0 && task.pid == 0 {
        return;
    }
    let now = cpu.sched_ticks.load(Ordering::Acquire);
    let delta_exec = now.saturating_sub(exec_start);
    if delta_exec == 0 {
        return;
    }
    let weight = weight_for(task.priority);
    task.vruntime.fetch_add(delta_vruntime(delta_exec, weight), Ordering::AcqRel);
    task.exec_start.store(0, Ordering::Release);
}

fn save_fpu(task: &Arc<Task>) {
    let mut slot = task.fpu_state.lock();
    let buf = slot.get_or_insert_with(crate::arch::x86::fpu::new_area);
    let ptr = crate::arch::x86::fpu::aligned_ptr(buf);
    // SAFETY: `ptr` is a 16-byte-aligned pointer into `buf`, which is
    // large enough to hold a full fxsave region (see `new_area`).
    unsafe { crate::arch::x86::fpu::save(ptr) };
}

fn restore_fpu(task: &Arc<Task>) {
    let mut slot = task.fpu_state.lock();
    let buf = slot.get_or_insert_with(crate::arch::x86::fpu::new_area);
    let ptr = crate::arch::x86::fpu::aligned_ptr(buf);
    // SAFETY: same contract as `save_fpu`; a never-before-saved area is
    // all zero, which `fxrstor` accepts as a valid (reset) FPU state.
    unsafe { crate::arch::x86::fpu::restore(ptr) };
}

/// LAPIC vector 32 handler: advances the clock, services due sleepers,
/// updates this CPU's load figure, ages the running task, and yields
/// once its quantum is spent.
pub fn timer_tick() {
    let cpu_idx = current_cpu_id();
    let cpu = percpu::cpu(cpu_idx);
    cpu.sched_ticks.fetch_add(1, Ordering::AcqRel);

    if cpu_idx == 0 {
        let tick = TICKS.fetch_add(1, Ordering::AcqRel) + 1;
        sleepq::check_sleepers(tick);
    }

    let is_idle = crate::process::table::current()
        .map(|t| cpu.idle_task.lock().as_ref().map(|i| Arc::ptr_eq(i, &t)).unwrap_or(false))
        .unwrap_or(true);
    let load = cpu.load_percent.load(Ordering::Relaxed);
    let sample = if is_idle { 0 } else { 100 };
    cpu.load_percent.store((load * 7 + sample * 3) / 10, Ordering::Relaxed);

    let remaining = QUANTUM_LEFT[cpu_idx as usize].fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| Some(q.saturating_sub(1))).unwrap_or(0);
    if remaining <= 1 {
        yield_now();
    }
}
