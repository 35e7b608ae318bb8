//! Task creation: kernel threads, ELF-backed user tasks, and
//! thread-style clones that share their creator's address space.
//!
//! User-stack argument setup never switches `CR3` to the new task's
//! directory and back the way the original did it -- writing through
//! the fixmap (see [`write_user_bytes`]) reaches a freshly built,
//! not-yet-scheduled directory just as well and avoids a
//! disable-interrupts/switch/restore dance for what is, at this point,
//! still entirely single-threaded setup work.

#![allow(dead_code)]

use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator::{self, FrameNumber};
use crate::mm::paging::{self, PageFlags, PageTable};
use crate::sync::Spinlock;

use super::pcb::{FdTable, FileDescriptor, KSTACK_SIZE, Priority, ProcMem, Task, SIGRETURN_TRAMPOLINE_VADDR};
use super::table;

const PAGE_SIZE: u32 = paging::PAGE_SIZE;
const PAGE_MASK: u32 = PAGE_SIZE - 1;

fn fresh_kstack() -> alloc::boxed::Box<[u8]> {
    alloc::vec![0u8; KSTACK_SIZE].into_boxed_slice()
}

fn kstack_top(kstack: &[u8]) -> u32 {
    (kstack.as_ptr() as u32 + kstack.len() as u32) & !0xF
}

/// Creates the stdin=kbd/stdout=stderr=console table a task with no
/// parent (pid 1, or a standalone kthread that wants a console) starts
/// with.
fn default_console_fds() -> Arc<FdTable> {
    let kbd = crate::fs::devfs::fetch("kbd");
    let console = crate::fs::devfs::fetch("console");
    let stdin = FileDescriptor::new(kbd.unwrap_or_else(crate::fs::devfs::null_node), 0);
    let stdout = FileDescriptor::new(console.clone().unwrap_or_else(crate::fs::devfs::null_node), 0);
    let stderr = FileDescriptor::new(console.unwrap_or_else(crate::fs::devfs::null_node), 0);
    FdTable::with_stdio(stdin, stdout, stderr)
}

/// Builds a kernel-resident task shell running `entry`, with no user
/// address space at all (`page_dir_phys` is the kernel's own directory).
/// Shared by [`spawn_kthread`] and [`spawn_idle`]; the two differ only in
/// whether the new task is registered with the pid table and scheduler.
fn new_kthread(name: &str, priority: Priority, entry: extern "C" fn() -> !) -> Arc<Task> {
    let mem = Arc::new(Spinlock::new(ProcMem {
        page_dir_phys: paging::kernel_directory_phys(),
        prog_break: 0,
        heap_start: 0,
        mmap_list: Vec::new(),
        mmap_top: 0,
        mem_pages: 0,
        fbmap_pages: 0,
        fbmap_user_ptr: 0,
        fbmap_size_bytes: 0,
        fbmap_is_virtio: false,
        leader_pid: 0,
    }));
    let kstack = fresh_kstack();
    let top = kstack_top(&kstack);
    let task = Task::new(name, priority, mem, default_console_fds(), kstack);
    task.mem.lock().leader_pid = task.pid;

    // SAFETY: `top` bounds a freshly allocated, exclusively owned stack.
    let esp = unsafe { crate::arch::x86::context::prepare_kernel_thread_stack(top, entry) };
    task.esp.store(esp, Ordering::Release);
    task
}

/// Creates a task running `entry` with no user address space at all: the
/// init task, the reaper, and every other kernel-resident service. Visible
/// to the scheduler and reapable like any other task.
pub fn spawn_kthread(name: &str, priority: Priority, entry: extern "C" fn() -> !) -> Arc<Task> {
    let task = new_kthread(name, priority, entry);
    table::insert(task.clone());
    crate::sched::add(&task);
    task
}

/// Creates a CPU's idle task: never placed in a run queue or the pid
/// table, since it is only ever dispatched as the explicit fallback when
/// a run queue is empty (see `sched::yield_now`).
pub fn spawn_idle(entry: extern "C" fn() -> !) -> Arc<Task> {
    let task = new_kthread("idle", Priority::Idle, entry);
    task.set_state(super::pcb::TaskState::Runnable);
    task
}

/// Spawns the dedicated reaper kthread that periodically drops the pid
/// table's reference to every fully-dead zombie.
pub fn spawn_reaper() -> Arc<Task> {
    extern "C" fn reaper_main() -> ! {
        loop {
            super::exit::reap_pass();
            crate::sched::sleep_ms(50);
        }
    }
    spawn_kthread("reaper", Priority::Low, reaper_main)
}

/// Loads and runs `filename` as a brand new task. `argv[0]` conventionally
/// names the program. The new task inherits the caller's cwd, terminal,
/// and a retained clone of its fd table; with no current task (boot-time
/// init) it gets a fresh console-backed table instead.
pub fn spawn_elf(filename: &str, argv: &[&str]) -> KernelResult<Arc<Task>> {
    let exec_node = crate::fs::vfs::resolve(filename)?;
    let image = crate::elf::validate32(&exec_node)?;

    let dir_phys = paging::new_user_directory()?;
    let dir = dir_phys as *mut PageTable;

    let prog_break = (image.max_vaddr + PAGE_MASK) & !PAGE_MASK;
    let mut mmap_top = 0x8000_1000u32;
    if mmap_top < prog_break {
        mmap_top = prog_break + 0x10_0000;
    }

    let mut mem = ProcMem {
        page_dir_phys: dir_phys,
        prog_break,
        heap_start: prog_break,
        mmap_list: Vec::new(),
        mmap_top,
        mem_pages: 0,
        fbmap_pages: 0,
        fbmap_user_ptr: 0,
        fbmap_size_bytes: 0,
        fbmap_is_virtio: false,
        leader_pid: 0,
    };
    for seg in &image.segments {
        super::memory::install_exec_segment(&mut mem, exec_node.clone(), seg.vaddr, seg.mem_size, seg.file_size, seg.file_offset);
    }

    const USTACK_TOP_LIMIT: u32 = 0xB040_0000;
    const STACK_SIZE: u32 = 4 * 1024 * 1024;
    let ustack_bottom = USTACK_TOP_LIMIT - STACK_SIZE;

    for i in 1..=4u32 {
        let addr = USTACK_TOP_LIMIT - i * PAGE_SIZE;
        let frame = frame_allocator::alloc_block()?;
        // SAFETY: `dir` was just allocated by `new_user_directory` and is
        // not yet referenced by any running task.
        unsafe { paging::paging_map(dir, addr, frame, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER)? };
        mem.mem_pages += 1;
    }

    map_sigreturn_trampoline(dir)?;
    mem.mem_pages += 1;

    let parent = table::current();
    let (cwd_inode, cwd_path, parent_pid, terminal, fd_table) = match &parent {
        Some(p) => (
            p.cwd_inode.load(Ordering::Acquire),
            super::cwd::get_path(p),
            p.pid,
            p.terminal.lock().clone(),
            p.fd_table.clone_table(),
        ),
        None => (1, alloc::string::String::from("/"), 0, None, default_console_fds()),
    };

    let user_esp = write_argv_frame(dir, USTACK_TOP_LIMIT, argv)?;

    let mem = Arc::new(Spinlock::new(mem));
    let kstack = fresh_kstack();
    let top = kstack_top(&kstack);

    let mut name_buf = filename.to_string();
    name_buf.truncate(32);
    let task = Task::new(&name_buf, Priority::User, mem, fd_table, kstack);
    task.mem.lock().leader_pid = task.pid;
    task.cwd_inode.store(cwd_inode, Ordering::Release);
    super::cwd::set_path(&task, &cwd_path);
    task.parent_pid.store(parent_pid, Ordering::Release);
    *task.terminal.lock() = terminal;
    task.stack_floor.store(ustack_bottom, Ordering::Release);
    task.stack_ceiling.store(USTACK_TOP_LIMIT, Ordering::Release);

    // SAFETY: `top` bounds a freshly allocated, exclusively owned stack.
    let sp = unsafe { crate::arch::x86::usermode::seed_iret_frame(top, image.entry, user_esp) };
    // SAFETY: see above; `sp` is inside the same stack.
    let esp = unsafe { crate::arch::x86::context::prepare_kernel_thread_stack(sp, crate::arch::x86::usermode::trampoline_return) };
    task.esp.store(esp, Ordering::Release);

    table::insert(task.clone());
    crate::sched::add(&task);
    Ok(task)
}

/// Creates a task that shares the caller's `mem` and `fd_table` (a
/// "thread" in the POSIX sense): `stack_bottom`/`stack_top` must already
/// be present and writable in the caller's address space, and are
/// registered as a `MAP_STACK` area so demand growth never extends it.
pub fn clone_thread(entry: u32, arg: u32, stack_bottom: u32, stack_top: u32) -> KernelResult<Arc<Task>> {
    let caller = table::current().ok_or(KernelError::InvalidState {
        expected: "a current task",
        actual: "no current task",
    })?;

    if !paging::paging_is_user_accessible(paging::active_directory(), stack_bottom) {
        return Err(KernelError::InvalidAddress { addr: stack_bottom as usize });
    }

    {
        let mut mem = caller.mem.lock();
        mem.mmap_list.push(super::pcb::MmapArea {
            vaddr_start: stack_bottom,
            vaddr_end: stack_top,
            file_offset: 0,
            length: stack_top - stack_bottom,
            file_size: 0,
            map_flags: super::pcb::MapFlags::STACK,
            file: None,
        });
    }

    let kstack = fresh_kstack();
    let top = kstack_top(&kstack);
    let task = Task::new("thread", Priority::User, caller.mem.clone(), caller.fd_table.clone(), kstack);
    task.cwd_inode.store(caller.cwd_inode.load(Ordering::Acquire), Ordering::Release);
    super::cwd::set_path(&task, &super::cwd::get_path(&caller));
    task.parent_pid.store(caller.pid, Ordering::Release);
    *task.terminal.lock() = caller.terminal.lock().clone();

    let dir = caller.mem.lock().page_dir_phys as *mut PageTable;
    let user_esp = write_user_bytes(dir, stack_top - 4, &arg.to_le_bytes()).map(|_| stack_top - 4)?;

    // SAFETY: `top` bounds a freshly allocated, exclusively owned stack.
    let sp = unsafe { crate::arch::x86::usermode::seed_iret_frame(top, entry, user_esp) };
    // SAFETY: see above.
    let esp = unsafe { crate::arch::x86::context::prepare_kernel_thread_stack(sp, crate::arch::x86::usermode::trampoline_return) };
    task.esp.store(esp, Ordering::Release);

    table::insert(task.clone());
    crate::sched::add(&task);
    Ok(task)
}

/// `mov eax, 18 ; int 0x80` -- the entire body of the `sigreturn`
/// trampoline. A caught signal's return address on the user stack
/// points here; running off the end would fall into unmapped memory
/// and fault, which is the expected outcome for a handler that somehow
/// keeps running after this stub instead of `ret`-ing into it.
const SIGRETURN_STUB: [u8; 7] = [0xB8, 0x12, 0x00, 0x00, 0x00, 0xCD, 0x80];

/// Maps the one-page `sigreturn` trampoline at [`SIGRETURN_TRAMPOLINE_VADDR`]
/// into a freshly built user directory. `maybe_deliver_signal` points
/// every caught signal's return address at this page.
fn map_sigreturn_trampoline(dir: *mut PageTable) -> KernelResult<()> {
    let frame = frame_allocator::alloc_block()?;
    // SAFETY: `dir` was just allocated by `new_user_directory` and is not
    // yet referenced by any running task.
    unsafe {
        paging::paging_map(
            dir,
            SIGRETURN_TRAMPOLINE_VADDR,
            frame,
            PageFlags::PRESENT | PageFlags::USER,
        )?;
    }
    write_user_bytes(dir, SIGRETURN_TRAMPOLINE_VADDR, &SIGRETURN_STUB)
}

/// Copies `src` to `dest_vaddr` (which may span more than one mapped
/// page) in `dir`'s address space, resolving each touched page's
/// backing frame through the fixmap rather than requiring `dir` to be
/// the currently active directory.
fn write_user_bytes(dir: *mut PageTable, dest_vaddr: u32, src: &[u8]) -> KernelResult<()> {
    let mut written = 0usize;
    while written < src.len() {
        let vaddr = dest_vaddr + written as u32;
        let page_base = vaddr & !PAGE_MASK;
        let page_off = (vaddr & PAGE_MASK) as usize;
        let phys = paging::paging_get_phys(dir, page_base).ok_or(KernelError::UnmappedMemory { addr: page_base as usize })?;
        let frame = FrameNumber::from_phys(phys & !PAGE_MASK);
        let chunk = core::cmp::min(src.len() - written, PAGE_SIZE as usize - page_off);
        // SAFETY: `frame` backs a page already mapped present+writable
        // in `dir`; the fixmap guard scopes our access to it.
        unsafe {
            let guard = paging::fixmap_frame(6, frame)?;
            let dst = (guard.vaddr() as *mut u8).add(page_off);
            core::ptr::copy_nonoverlapping(src.as_ptr().add(written), dst, chunk);
        }
        written += chunk;
    }
    Ok(())
}

/// Lays out the initial `argc, argv, envp` frame at the top of a fresh
/// user stack and returns the user `ESP` a brand-new task should start
/// with, per the "called as `_start(argc, argv)`" convention: from low
/// to high address, `[0][argc][argv_ptr][arg_ptrs...][0]`.
fn write_argv_frame(dir: *mut PageTable, ustack_top_limit: u32, argv: &[&str]) -> KernelResult<u32> {
    let actual_argc = argv.len().min(16);
    let mut arg_ptrs = [0u32; 16];
    let mut cursor = ustack_top_limit;

    for i in (0..actual_argc).rev() {
        let bytes = argv[i].as_bytes();
        cursor -= bytes.len() as u32 + 1;
        write_user_bytes(dir, cursor, bytes)?;
        write_user_bytes(dir, cursor + bytes.len() as u32, &[0u8])?;
        arg_ptrs[i] = cursor;
    }
    cursor &= !0xF;

    let array_words = actual_argc as u32 + 1; // arg_ptrs[] + NULL terminator
    let header_words = 3; // fake retaddr, argc, argv_ptr
    let final_esp = cursor - (header_words + array_words) * 4;
    let argv_ptr = final_esp + header_words * 4;

    let mut words = Vec::with_capacity((header_words + array_words) as usize);
    words.push(0u32);
    words.push(actual_argc as u32);
    words.push(argv_ptr);
    words.extend_from_slice(&arg_ptrs[..actual_argc]);
    words.push(0u32);

    let mut buf = Vec::with_capacity(words.len() * 4);
    for w in &words {
        buf.extend_from_slice(&w.to_le_bytes());
    }
    write_user_bytes(dir, final_esp, &buf)?;
    Ok(final_esp)
}
