//! Task lifecycle: control blocks, the global task table, creation,
//! exit/reap, waiting, signals, and the address-space operations a
//! running task's syscalls or page faults trigger.
//!
//! There is no separate process/thread split here -- see [`pcb`]'s
//! module doc for why `Task` is the one schedulable unit.

#![allow(dead_code)]

extern crate alloc;

pub mod creation;
pub mod cwd;
pub mod exit;
pub mod memory;
pub mod pcb;
pub mod signal_delivery;
pub mod table;
pub mod wait;

pub use pcb::{
    FdTable, FileDescriptor, MapFlags, MmapArea, Pid, Priority, ProcMem, SavedFrame, Task, TaskState,
    SIGRETURN_TRAMPOLINE_VADDR,
};
pub use signal_delivery::signal;

/// `mm::page_fault`'s single-argument view of [`signal_delivery::deliver_fault_signal`]:
/// the fault path never has anything but "the current task" to blame.
pub fn deliver_fault_signal(sig: u32) {
    if let Some(task) = table::current() {
        signal_delivery::deliver_fault_signal(&task, sig);
    }
}

/// `mm::page_fault`'s entry point into the stack/mmap/heap triage.
pub fn handle_user_fault(fault_addr: u32, write: bool) -> bool {
    memory::handle_user_fault(fault_addr, write)
}
