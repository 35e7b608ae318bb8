//! Per-CPU scheduler state and the "best CPU to place a new task on"
//! cache.
//!
//! Grounded on `examples/original_source/src/kernel/cpu.c`'s `cpu_t`
//! array and `sched.c`'s `get_best_cpu`: a CPU index is assigned to each
//! core as it comes online (BSP always gets index 0), keyed by its LAPIC
//! ID, and a single cached "least loaded" guess is reused across task
//! creations until it goes stale.

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::process::table::MAX_CPUS;
use crate::sync::Spinlock;

use super::runqueue::RunQueue;

/// Ticks a cached best-CPU guess is trusted for before being recomputed,
/// per `sched.c`'s `CPU_CACHE_INVALIDATE_TICKS`.
const CPU_CACHE_INVALIDATE_TICKS: u32 = 100;

pub struct CpuData {
    pub runq: Spinlock<RunQueue>,
    pub idle_task: Spinlock<Option<alloc::sync::Arc<crate::process::Task>>>,
    pub sched_ticks: AtomicU64,
    pub total_priority_weight: AtomicU32,
    pub total_task_count: AtomicU32,
    pub load_percent: AtomicU32,
}

impl CpuData {
    const fn new() -> Self {
        CpuData {
            runq: Spinlock::new(RunQueue::new()),
            idle_task: Spinlock::new(None),
            sched_ticks: AtomicU64::new(0),
            total_priority_weight: AtomicU32::new(0),
            total_task_count: AtomicU32::new(0),
            load_percent: AtomicU32::new(0),
        }
    }
}

pub static CPUS: [CpuData; MAX_CPUS] = [const { CpuData::new() }; MAX_CPUS];

/// LAPIC ID registered for each CPU index; `-1` for a slot nobody has
/// claimed yet.
static APIC_IDS: [AtomicI32; MAX_CPUS] = [const { AtomicI32::new(-1) }; MAX_CPUS];
static CPU_COUNT: AtomicU32 = AtomicU32::new(0);

static CACHED_BEST: AtomicI32 = AtomicI32::new(-1);
static CACHE_TICK: AtomicU32 = AtomicU32::new(0);
static CACHE_LOCK: Spinlock<()> = Spinlock::new(());

/// Registers the calling core as a new CPU index (BSP calls this once
/// during boot; each AP calls it from [`super::register_this_cpu`]).
/// Also tells the TLB shootdown broadcaster about the new CPU.
pub fn register(apic_id: u8) -> u8 {
    let idx = CPU_COUNT.fetch_add(1, Ordering::AcqRel);
    let idx = idx.min(MAX_CPUS as u32 - 1) as u8;
    APIC_IDS[idx as usize].store(apic_id as i32, Ordering::Release);
    crate::arch::x86::tlb::register_cpu(idx);
    idx
}

/// Maps the calling core's LAPIC ID back to its assigned index. Falls
/// back to 0 for a single-CPU boot or a host test build with no APIC.
pub fn current_cpu_id() -> u8 {
    let apic_id = crate::arch::x86::apic::read_id().unwrap_or(0);
    let count = CPU_COUNT.load(Ordering::Acquire).min(MAX_CPUS as u32);
    for i in 0..count as usize {
        if APIC_IDS[i].load(Ordering::Acquire) == apic_id as i32 {
            return i as u8;
        }
    }
    0
}

pub fn cpu(idx: u8) -> &'static CpuData {
    &CPUS[idx as usize]
}

/// The CPU index with the lowest `load + runq_count * 20 + weight`
/// score, reusing a cached guess unless it has gone stale or a second
/// CPU has come online since it was computed.
pub fn best_cpu_for_new_task(current_tick: u32) -> u8 {
    let active = CPU_COUNT.load(Ordering::Acquire).max(1);

    {
        let _g = CACHE_LOCK.lock();
        let cached = CACHED_BEST.load(Ordering::Acquire);
        let tick = CACHE_TICK.load(Ordering::Acquire);
        if cached >= 0 && tick != 0 && current_tick.wrapping_sub(tick) < CPU_CACHE_INVALIDATE_TICKS && active <= 1 {
            return cached as u8;
        }
    }

    let mut best = 0u8;
    let mut min_score = u32::MAX;
    let start = current_cpu_id();
    for ofs in 1..=active {
        let i = ((start as u32 + ofs) % active) as u8;
        let c = cpu(i);
        let load = c.load_percent.load(Ordering::Relaxed);
        let runq = c.total_task_count.load(Ordering::Relaxed);
        let weight = c.total_priority_weight.load(Ordering::Relaxed);
        let mut score = load + runq * 20 + weight;
        if i == 0 && active > 1 {
            score += 25;
        }
        if score < min_score {
            min_score = score;
            best = i;
        }
    }

    let _g = CACHE_LOCK.lock();
    CACHED_BEST.store(best as i32, Ordering::Release);
    CACHE_TICK.store(current_tick.max(1), Ordering::Release);
    best
}

/// Invalidates the best-CPU cache if it currently points at `idx`. Called
/// whenever `idx`'s run queue composition changes materially (a task
/// added to or removed from it).
pub fn invalidate_cache_for(idx: u8) {
    let _g = CACHE_LOCK.lock();
    if CACHED_BEST.load(Ordering::Acquire) == idx as i32 {
        CACHE_TICK.store(0, Ordering::Release);
    }
}
