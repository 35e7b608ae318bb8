//! The task control block and the structures it owns or shares.
//!
//! This kernel has no separate process/thread split: a `Task` is the
//! schedulable unit, and what userspace calls a "process" is just the
//! group of tasks that share one [`ProcMem`] and one [`FdTable`] (the
//! group's leader is named by `ProcMem::leader_pid`).

#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::fs::VfsNode;
use crate::sync::{Semaphore, Spinlock};

pub type Pid = u32;

pub const KSTACK_SIZE: usize = 32 * 1024;
pub const NSIG: usize = 32;

/// Fixed user-space address of the one-page `sigreturn` trampoline stub
/// `spawn_elf` maps into every process. Lives just past the fixed user
/// stack's top (`0xB040_0000`), a page `spawn_elf` never otherwise maps.
pub const SIGRETURN_TRAMPOLINE_VADDR: u32 = 0xB040_0000;

/// A bit-for-bit copy of the register frame a syscall trap pushed, stashed
/// here when a signal handler gets redirected into in its place so
/// `sigreturn` can restore the interrupted context exactly. Mirrors
/// `arch::x86::syscall::TrapFrame`'s layout; kept arch-independent here so
/// `pcb.rs` does not need to depend on `arch::x86`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedFrame {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unused = 0,
    Runnable = 1,
    Running = 2,
    Zombie = 3,
    Waiting = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskState::Runnable,
            2 => TaskState::Running,
            3 => TaskState::Zombie,
            4 => TaskState::Waiting,
            _ => TaskState::Unused,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Idle = 0,
    Low = 5,
    User = 10,
    High = 15,
    Gui = 20,
    Super = 30,
}

impl Priority {
    /// Timer ticks granted per quantum; overridable by `BootConfig` for
    /// the GUI/USER tiers (see `sched::quantum_for`).
    pub fn default_quantum(self) -> u32 {
        match self {
            Priority::Gui => 8,
            Priority::User => 4,
            _ => 2,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED  = 1 << 0;
        const PRIVATE = 1 << 1;
        const STACK   = 1 << 2;
    }
}

/// One `mmap`-backed region of a task's address space.
pub struct MmapArea {
    pub vaddr_start: u32,
    pub vaddr_end: u32,
    pub file_offset: u32,
    pub length: u32,
    pub file_size: u32,
    pub map_flags: MapFlags,
    pub file: Option<Arc<dyn VfsNode>>,
}

impl MmapArea {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.vaddr_start && addr < self.vaddr_end
    }
}

/// Address space and break/mmap bookkeeping shared by every task in one
/// process group. Reference-counted through `Arc` rather than the
/// original's manual `refcount` field -- the last `Arc` drop is exactly
/// the original's "refcount reaches zero" teardown point.
pub struct ProcMem {
    pub page_dir_phys: u32,
    pub prog_break: u32,
    pub heap_start: u32,
    pub mmap_list: Vec<MmapArea>,
    pub mmap_top: u32,
    pub mem_pages: u32,
    pub fbmap_pages: u32,
    pub fbmap_user_ptr: u32,
    pub fbmap_size_bytes: u32,
    pub fbmap_is_virtio: bool,
    pub leader_pid: Pid,
}

impl ProcMem {
    pub fn find_mmap(&self, addr: u32) -> Option<&MmapArea> {
        self.mmap_list.iter().find(|a| a.contains(addr))
    }
}

impl Drop for ProcMem {
    fn drop(&mut self) {
        // SAFETY: a ProcMem only drops once every Task sharing it (every
        // Arc<Spinlock<ProcMem>> holder) has already gone, so nothing can
        // be running on this directory.
        unsafe { teardown_user_half(self.page_dir_phys) };
    }
}

/// Walks PDE indices `0..768` (the user half, `0x00000000..0xC0000000`)
/// and frees every present frame not flagged [`PageFlags::NO_FREE`].
/// Checks each PDE's presence once before touching any of its 1024 PTEs,
/// since almost all of a typical task's user half is entirely unmapped.
unsafe fn teardown_user_half(dir_phys: u32) {
    use crate::mm::frame_allocator;
    use crate::mm::paging::{self, PageFlags, PageTable};

    let dir = dir_phys as *mut PageTable;
    for pd_idx in 0..768usize {
        let Some(_pt_frame) = paging::pde_frame(dir, pd_idx) else {
            continue;
        };
        let base = (pd_idx as u32) << 22;
        for pt_idx in 0..1024u32 {
            let virt = base + (pt_idx << 12);
            if let Some(pte) = paging::paging_get_present_pte(dir, virt) {
                if !pte.flags().contains(PageFlags::NO_FREE) {
                    frame_allocator::free_block(pte.frame());
                }
            }
        }
    }
}

/// A single open-file slot. Shared between `dup`/`dup2` targets and the
/// original descriptor purely through `Arc` clones -- no separate retain
/// count is needed.
pub struct FileDescriptor {
    pub node: Arc<dyn VfsNode>,
    pub offset: AtomicU32,
    pub flags: AtomicU32,
}

impl FileDescriptor {
    pub fn new(node: Arc<dyn VfsNode>, flags: u32) -> Arc<Self> {
        Arc::new(FileDescriptor {
            node,
            offset: AtomicU32::new(0),
            flags: AtomicU32::new(flags),
        })
    }
}

/// A task's open-file table. Grows by doubling; slot reuse tracks the
/// lowest freed index the way the original's `fd_next` does, so repeated
/// open/close cycles don't walk the whole table each time.
pub struct FdTable {
    inner: Spinlock<FdTableInner>,
}

struct FdTableInner {
    fds: Vec<Option<Arc<FileDescriptor>>>,
    fd_next: usize,
}

impl FdTable {
    pub fn new() -> Arc<Self> {
        Arc::new(FdTable {
            inner: Spinlock::new(FdTableInner {
                fds: Vec::new(),
                fd_next: 0,
            }),
        })
    }

    /// A table populated with the given standard streams at fds 0-2.
    pub fn with_stdio(stdin: Arc<FileDescriptor>, stdout: Arc<FileDescriptor>, stderr: Arc<FileDescriptor>) -> Arc<Self> {
        let table = FdTable::new();
        {
            let mut inner = table.inner.lock();
            inner.fds.push(Some(stdin));
            inner.fds.push(Some(stdout));
            inner.fds.push(Some(stderr));
            inner.fd_next = 3;
        }
        table
    }

    /// A private copy of `self`'s slot array with a fresh retain on every
    /// occupied descriptor -- used by `clone_thread`'s "no parent" path
    /// and any future fork-style duplication.
    pub fn clone_table(&self) -> Arc<Self> {
        let inner = self.inner.lock();
        let fds = inner.fds.clone();
        let fd_next = inner.fd_next;
        Arc::new(FdTable {
            inner: Spinlock::new(FdTableInner { fds, fd_next }),
        })
    }

    pub fn get(&self, fd: i32) -> Option<Arc<FileDescriptor>> {
        if fd < 0 {
            return None;
        }
        self.inner.lock().fds.get(fd as usize).and_then(|s| s.clone())
    }

    /// Installs `desc` at the first free slot `>= fd_next`, growing the
    /// table by doubling if necessary. Returns the new fd number.
    pub fn alloc(&self, desc: Arc<FileDescriptor>) -> i32 {
        let mut inner = self.inner.lock();
        let start = inner.fd_next;
        let mut idx = start;
        loop {
            if idx >= inner.fds.len() {
                let new_len = (inner.fds.len() * 2).max(4);
                inner.fds.resize(new_len, None);
            }
            if inner.fds[idx].is_none() {
                break;
            }
            idx += 1;
        }
        inner.fds[idx] = Some(desc);
        inner.fd_next = idx + 1;
        idx as i32
    }

    /// Installs `desc` at an exact slot, displacing whatever was there
    /// (the `dup2` contract).
    pub fn install_at(&self, fd: i32, desc: Arc<FileDescriptor>) {
        if fd < 0 {
            return;
        }
        let fd = fd as usize;
        let mut inner = self.inner.lock();
        if fd >= inner.fds.len() {
            inner.fds.resize(fd + 1, None);
        }
        inner.fds[fd] = Some(desc);
    }

    pub fn close(&self, fd: i32) -> Option<Arc<FileDescriptor>> {
        if fd < 0 {
            return None;
        }
        let fd = fd as usize;
        let mut inner = self.inner.lock();
        let removed = inner.fds.get_mut(fd).and_then(|s| s.take());
        if removed.is_some() {
            inner.fd_next = inner.fd_next.min(fd);
        }
        removed
    }
}

/// The task control block.
pub struct Task {
    pub pid: Pid,
    pub name: Spinlock<alloc::string::String>,
    state: AtomicU8,
    pub priority: Priority,

    pub kstack: Box<[u8]>,
    /// Saved stack pointer used by `context::switch_to`. Valid only
    /// while the task is not `Running`.
    pub esp: AtomicU32,

    pub mem: Arc<Spinlock<ProcMem>>,
    pub fd_table: Arc<FdTable>,
    pub cwd_inode: AtomicU32,
    /// Textual form of `cwd_inode`, maintained alongside it by
    /// `process::cwd` for `getcwd`. The inode is what path resolution
    /// actually walks from; this field exists only so `sys_getcwd` has a
    /// string to hand back.
    pub cwd_path: Spinlock<alloc::string::String>,
    pub terminal: Spinlock<Option<Arc<dyn VfsNode>>>,

    pub pending_signals: AtomicU32,
    pub handlers: Spinlock<[usize; NSIG]>,
    /// Pre-signal register frame, populated by `syscall::maybe_deliver_signal`
    /// when a handler gets redirected into and consumed by `sys_sigreturn`.
    pub saved_frame: Spinlock<Option<SavedFrame>>,

    pub vruntime: AtomicU64,
    pub exec_start: AtomicU64,
    pub wake_tick: AtomicU32,

    pub parent_pid: AtomicU32,
    pub assigned_cpu: AtomicI32,

    /// Current low/high bounds of this task's growable user stack region,
    /// consulted by the stack-growth case of the page-fault triage.
    pub stack_floor: AtomicU32,
    pub stack_ceiling: AtomicU32,

    pub exit_status: AtomicI32,
    pub exit_sem: Semaphore,
    pub exit_waiters: AtomicUsize,

    pub fpu_state: Spinlock<Option<Box<[u8]>>>,
}

impl Task {
    /// Builds a task shell with a fresh pid and every field that does
    /// not depend on whether the caller is making a kthread or a user
    /// task: zeroed signal/wait state, no parent, no stack range yet.
    /// Callers (`process::creation`) fill in the rest after construction.
    pub fn new(name: &str, priority: Priority, mem: Arc<Spinlock<ProcMem>>, fd_table: Arc<FdTable>, kstack: Box<[u8]>) -> Arc<Self> {
        Arc::new(Task {
            pid: super::table::alloc_pid(),
            name: Spinlock::new(alloc::string::String::from(name)),
            state: AtomicU8::new(TaskState::Runnable as u8),
            priority,
            kstack,
            esp: AtomicU32::new(0),
            mem,
            fd_table,
            cwd_inode: AtomicU32::new(1),
            cwd_path: Spinlock::new(alloc::string::String::from("/")),
            terminal: Spinlock::new(None),
            pending_signals: AtomicU32::new(0),
            handlers: Spinlock::new([0usize; NSIG]),
            saved_frame: Spinlock::new(None),
            vruntime: AtomicU64::new(0),
            exec_start: AtomicU64::new(0),
            wake_tick: AtomicU32::new(0),
            parent_pid: AtomicU32::new(0),
            assigned_cpu: AtomicI32::new(-1),
            stack_floor: AtomicU32::new(0),
            stack_ceiling: AtomicU32::new(0),
            exit_status: AtomicI32::new(0),
            exit_sem: Semaphore::new(0),
            exit_waiters: AtomicUsize::new(0),
            fpu_state: Spinlock::new(None),
        })
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state(), TaskState::Unused | TaskState::Zombie)
    }
}
