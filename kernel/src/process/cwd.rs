//! Current-working-directory bookkeeping.
//!
//! A task's cwd is an inode number (`Task::cwd_inode`); resolving a
//! relative path against it is the VFS's job (`fs::vfs::resolve`), not
//! this module's. `cwd_path` tracks the textual path alongside the inode
//! purely so `sys_getcwd` has a string to hand back; it is not consulted
//! by path resolution.

#![allow(dead_code)]

use alloc::string::String;
use core::sync::atomic::Ordering;

use super::pcb::Task;

pub fn get(task: &Task) -> u32 {
    task.cwd_inode.load(Ordering::Acquire)
}

pub fn set(task: &Task, inode: u32) {
    task.cwd_inode.store(inode, Ordering::Release);
}

pub fn get_path(task: &Task) -> String {
    task.cwd_path.lock().clone()
}

pub fn set_path(task: &Task, path: &str) {
    *task.cwd_path.lock() = String::from(path);
}
