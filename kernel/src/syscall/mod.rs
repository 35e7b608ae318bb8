//! The `int 0x80` dispatch table: every handler named in row 0-61 of the
//! process ABI, plus the `sigreturn`/signal-delivery hooks
//! [`arch::x86::syscall::dispatch_trampoline`] calls directly instead of
//! routing through [`dispatch`].
//!
//! Every handler that touches a user pointer runs it through
//! [`mm::user_validation`] first -- this module never trusts `ebx..edi`
//! to be anything but attacker-controlled integers. Handlers return a
//! plain `i32`; `-1` is the universal failure sentinel the ABI uses,
//! matching [`crate::error::KernelError`]'s doc comment that every
//! fallible kernel operation threads back through here to a single
//! errno-style mapping.

#![allow(dead_code)]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch;
use crate::arch::x86::syscall::TrapFrame;
use crate::fs::{self, vfs, NodeType, Permissions, VfsNode};
use crate::ipc::{futex, listener};
use crate::mm::{frame_allocator, paging, user_validation};
use crate::process::{self, cwd, exit, memory, pcb, signal, signal_delivery, table, wait, MapFlags, SavedFrame};
use crate::sync::Spinlock;
use crate::timer;

const MAX_PATH: usize = 255;
const MAX_PRINT: usize = 4096;

/// Arguments a trapped `int 0x80` carried, already unpacked from the
/// register frame by [`arch::x86::syscall::dispatch_trampoline`].
pub struct SyscallArgs {
    pub num: u32,
    pub args: [u32; 5],
}

// ===========================================================================
// User memory helpers
// ===========================================================================

/// Copies `buf.len()` bytes from `ptr` in the caller's address space.
/// `false` if any page in the range is missing, not user-accessible, or
/// out of the user address window.
fn copy_from_user(ptr: u32, buf: &mut [u8]) -> bool {
    if buf.is_empty() {
        return true;
    }
    if !user_validation::check_user_buffer_present(ptr, buf.len() as u32) {
        return false;
    }
    // SAFETY: just validated present and user-readable in the active
    // (this task's own) directory.
    unsafe { core::ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), buf.len()) };
    true
}

/// As [`copy_from_user`], in the other direction, requiring the
/// destination be writable.
fn copy_to_user(ptr: u32, buf: &[u8]) -> bool {
    if buf.is_empty() {
        return true;
    }
    if !user_validation::check_user_buffer_writable_present(ptr, buf.len() as u32) {
        return false;
    }
    // SAFETY: just validated present, user-accessible and writable.
    unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), ptr as *mut u8, buf.len()) };
    true
}

/// Reads a NUL-terminated string out of user memory, one byte at a time
/// so a string that crosses into an unmapped page is caught exactly at
/// the boundary rather than read speculatively.
fn read_user_cstr(ptr: u32, max: usize) -> Option<String> {
    let mut out = Vec::new();
    let mut addr = ptr;
    for _ in 0..max {
        if !user_validation::check_user_buffer_present(addr, 1) {
            return None;
        }
        // SAFETY: validated above.
        let byte = unsafe { core::ptr::read(addr as *const u8) };
        if byte == 0 {
            return core::str::from_utf8(&out).ok().map(String::from);
        }
        out.push(byte);
        addr = addr.wrapping_add(1);
    }
    None
}

fn split_path(path: &str) -> Option<(&str, &str)> {
    let pos = path.rfind('/')?;
    if pos == 0 {
        Some(("/", &path[1..]))
    } else {
        Some((&path[..pos], &path[pos + 1..]))
    }
}

/// Resolves `path`'s parent directory's `DirEntry` for `path`'s leaf
/// name, the only way to recover an inode number through the
/// [`VfsNode`] trait (it has no `inode()` accessor of its own).
fn leaf_inode(path: &str) -> Option<u32> {
    let (parent_path, name) = split_path(path)?;
    let parent = vfs::resolve(parent_path).ok()?;
    parent
        .readdir()
        .ok()?
        .into_iter()
        .find(|e| e.name == name)
        .map(|e| e.inode as u32)
}

// ===========================================================================
// open() flag bits (Linux i386 values, matching drivers::terminal's
// convention of keeping the numeric ABI compatible even where nothing
// downstream cares about the exact bit pattern)
// ===========================================================================

const O_CREAT: u32 = 0o100;
const O_TRUNC: u32 = 0o1000;

fn open_path(path: &str, flags: u32) -> Result<alloc::sync::Arc<dyn VfsNode>, &'static str> {
    match vfs::open(path) {
        Ok(node) => {
            if flags & O_TRUNC != 0 {
                let _ = node.truncate(0);
            }
            Ok(node)
        }
        Err(_) if flags & O_CREAT != 0 => {
            let (parent_path, name) = split_path(path).ok_or("Invalid path")?;
            let parent = vfs::resolve(parent_path)?;
            parent.create(name, Permissions::default())
        }
        Err(e) => Err(e),
    }
}

// ===========================================================================
// clip_set/clip_get -- a small in-kernel clipboard, not the heavier
// desktop capability-IPC clipboard endpoint (that is a different,
// GUI-session-scoped subsystem).
// ===========================================================================

const CLIPBOARD_CAP: usize = 4096;
static CLIPBOARD: Spinlock<Vec<u8>> = Spinlock::new(Vec::new());

// ===========================================================================
// ioctl request codes this kernel understands, re-exported from
// drivers::terminal for readability at the call sites below.
// ===========================================================================

use crate::drivers::terminal::{TCGETS, TCSETS, TCSETSF, TCSETSW, TIOCGWINSZ, TIOCSWINSZ};

// ===========================================================================
// On-the-wire record layouts SPEC_FULL.md's distillation did not pin
// down a field order for. Grounded on fs::Metadata/fs::DirEntry/Task's
// existing fields; see DESIGN.md for the Open Question this settles.
// ===========================================================================

/// `stat(path, stat*)`'s output record.
#[repr(C)]
struct Stat {
    size: u32,
    node_type: u32,
    permissions: u32,
    uid: u32,
    gid: u32,
    created: u32,
    modified: u32,
    accessed: u32,
}

fn node_type_code(t: NodeType) -> u32 {
    match t {
        NodeType::File => 0,
        NodeType::Directory => 1,
        NodeType::CharDevice => 2,
        NodeType::BlockDevice => 3,
        NodeType::Pipe => 4,
        NodeType::Socket => 5,
        NodeType::Symlink => 6,
        NodeType::SharedMemory => 7,
    }
}

fn permissions_bits(p: Permissions) -> u32 {
    let bits = [
        p.owner_read, p.owner_write, p.owner_exec,
        p.group_read, p.group_write, p.group_exec,
        p.other_read, p.other_write, p.other_exec,
    ];
    let mut out = 0u32;
    for (i, set) in bits.iter().enumerate() {
        if *set {
            out |= 1 << (8 - i);
        }
    }
    out
}

/// `fsinfo(fs_info*)`'s output record.
#[repr(C)]
struct FsInfo {
    total_frames: u32,
    free_frames: u32,
    fs_name: [u8; 16],
}

/// `proc_list(proc_info*, cap)`'s per-entry record.
#[repr(C)]
struct ProcInfo {
    pid: u32,
    parent_pid: u32,
    state: u32,
    priority: u32,
    name: [u8; 32],
}

/// `getdents(fd, buf, size)`'s fixed-size per-entry record.
#[repr(C)]
struct DirentRecord {
    inode: u32,
    node_type: u8,
    name_len: u8,
    _reserved: u16,
    name: [u8; 56],
}

const DIRENT_SIZE: usize = core::mem::size_of::<DirentRecord>();

/// `fb_present`'s user-supplied damage rectangle, `i32` per SPEC_FULL.md
/// rather than [`crate::fb::Rect`]'s `u32` (negative offsets are
/// rejected, not wrapped).
#[repr(C)]
#[derive(Clone, Copy)]
struct UserRect {
    x: i32,
    y: i32,
    w: i32,
    h: i32,
}

#[repr(C)]
struct FbPresentReq {
    src: u32,
    src_stride: u32,
    rects: u32,
    rect_count: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct PollFd {
    fd: i32,
    events: i16,
    revents: i16,
}

const POLLIN: i16 = 0x01;
const POLLOUT: i16 = 0x04;
const POLLHUP: i16 = 0x10;
const POLLNVAL: i16 = 0x20;

// ===========================================================================
// Dispatch
// ===========================================================================

/// Decodes and runs one trapped syscall. Enables interrupts before the
/// handler body runs -- a long-running handler (`read` blocking on a
/// pipe, `waitpid`) must not hold the rest of the system off the CPU
/// for its whole duration.
pub fn dispatch(args: SyscallArgs) -> i32 {
    arch::enable_interrupts();

    let a = args.args;
    match args.num {
        0 => exit::exit_current(a[0] as i32),
        1 => sys_print(a[0]),
        2 => sys_getpid(),
        3 => sys_open(a[0], a[1]),
        4 => sys_read(a[0] as i32, a[1], a[2]),
        5 => sys_write(a[0] as i32, a[1], a[2]),
        6 => sys_close(a[0] as i32),
        7 => {
            crate::sched::sleep_ms(a[0]);
            0
        }
        8 => memory::sbrk(a[0] as i32),
        9 => sys_kill(a[0], a[1]),
        11 => {
            crate::sched::sleep_ms((a[0] / 1000).max(1));
            0
        }
        12 => sys_meminfo(a[0], a[1]),
        13 => sys_mkdir(a[0]),
        14 => sys_unlink(a[0]),
        15 => sys_time(a[0]),
        16 => sys_reboot(),
        17 => sys_signal(a[0], a[1]),
        18 => 0, // sigreturn: dispatch_trampoline intercepts this before dispatch() ever sees it.
        20 => sys_clone(a[0], a[1], a[2]),
        25 => sys_clip_set(a[0], a[1]),
        26 => sys_clip_get(a[0], a[1]),
        27 => sys_set_term_mode(a[0]),
        28 => sys_set_console_color(a[0], a[1]),
        29 => sys_pipe(a[0]),
        30 => sys_dup2(a[0] as i32, a[1] as i32),
        31 => sys_mmap(a[0] as i32, a[1], a[2]),
        32 => sys_munmap(a[0], a[1]),
        33 => sys_stat(a[0], a[1]),
        34 => sys_fsinfo(a[0]),
        35 => sys_rename(a[0], a[1]),
        36 => sys_spawn(a[0], a[1], a[2]),
        37 => sys_waitpid(a[0] as i32, a[1]),
        38 => sys_getdents(a[0] as i32, a[1], a[2]),
        39 => sys_fstatat(a[0] as i32, a[1], a[2]),
        40 => crate::fb::fb_map(current_pid()).unwrap_or(0) as i32,
        41 => crate::fb::fb_acquire(current_pid()).is_ok() as i32,
        42 => crate::fb::fb_release(current_pid()).is_ok() as i32,
        43 => sys_shm_create(a[0]),
        44 => sys_pipe_try_read(a[0] as i32, a[1], a[2]),
        45 => sys_pipe_try_write(a[0] as i32, a[1], a[2]),
        46 => sys_kbd_try_read(a[0]),
        47 => sys_ipc_listen(a[0]),
        48 => sys_ipc_accept(a[0] as i32, a[1]),
        49 => sys_ipc_connect(a[0], a[1]),
        50 => sys_fb_present(a[0]),
        51 => sys_shm_create_named(a[0], a[1]),
        52 => sys_shm_open_named(a[0]),
        53 => sys_shm_unlink_named(a[0]),
        54 => sys_futex_wait(a[0], a[1]),
        55 => sys_futex_wake(a[0], a[1]),
        56 => sys_poll(a[0], a[1], a[2]),
        57 => sys_ioctl(a[0] as i32, a[1] as usize, a[2]),
        58 => sys_chdir(a[0]),
        59 => sys_getcwd(a[0], a[1]),
        60 => timer::get_uptime_ms() as i32,
        61 => sys_proc_list(a[0], a[1]),
        _ => -1,
    }
}

fn current_task() -> Option<alloc::sync::Arc<pcb::Task>> {
    table::current()
}

fn current_pid() -> pcb::Pid {
    current_task().map(|t| t.pid).unwrap_or(0)
}

// ===========================================================================
// Handlers
// ===========================================================================

fn sys_print(cstr: u32) -> i32 {
    let Some(s) = read_user_cstr(cstr, MAX_PRINT) else { return -1 };
    crate::drivers::console::get_console_driver().lock().write_to_all(&s);
    0
}

fn sys_getpid() -> i32 {
    current_task().map(|t| t.pid as i32).unwrap_or(-1)
}

fn sys_open(path_ptr: u32, flags: u32) -> i32 {
    let Some(path) = read_user_cstr(path_ptr, MAX_PATH) else { return -1 };
    let Some(task) = current_task() else { return -1 };
    match open_path(&path, flags) {
        Ok(node) => task.fd_table.alloc(pcb::FileDescriptor::new(node, flags)),
        Err(_) => -1,
    }
}

fn sys_read(fd: i32, buf_ptr: u32, len: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    let Some(desc) = task.fd_table.get(fd) else { return -1 };
    if !user_validation::check_user_buffer_writable_present(buf_ptr, len) {
        return -1;
    }
    let mut buf = alloc::vec![0u8; len as usize];
    let offset = desc.offset.load(core::sync::atomic::Ordering::Acquire) as usize;
    match desc.node.read(offset, &mut buf) {
        Ok(n) => {
            desc.offset.fetch_add(n as u32, core::sync::atomic::Ordering::AcqRel);
            if !copy_to_user(buf_ptr, &buf[..n]) {
                return -1;
            }
            n as i32
        }
        Err(_) => -1,
    }
}

fn sys_write(fd: i32, buf_ptr: u32, len: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    let Some(desc) = task.fd_table.get(fd) else { return -1 };
    if !user_validation::check_user_buffer_present(buf_ptr, len) {
        return -1;
    }
    let mut buf = alloc::vec![0u8; len as usize];
    if !copy_from_user(buf_ptr, &mut buf) {
        return -1;
    }
    let offset = desc.offset.load(core::sync::atomic::Ordering::Acquire) as usize;
    match desc.node.write(offset, &buf) {
        Ok(n) => {
            desc.offset.fetch_add(n as u32, core::sync::atomic::Ordering::AcqRel);
            n as i32
        }
        Err(_) => -1,
    }
}

fn sys_close(fd: i32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    task.fd_table.close(fd).map(|_| 0).unwrap_or(-1)
}

/// Raises `sig` (ECX; defaults to SIGTERM if 0, matching shells that
/// pass no signal) against `pid`, rather than terminating it directly.
/// The target samples and acts on it at its own next syscall return --
/// immediately if it has no handler installed for `sig`.
fn sys_kill(pid: u32, sig: u32) -> i32 {
    let Some(target) = table::find(pid) else { return -1 };
    let sig = if sig == 0 { signal::SIGTERM } else { sig };
    signal_delivery::raise(&target, sig);
    0
}

fn sys_meminfo(used_ptr: u32, free_ptr: u32) -> i32 {
    let total = frame_allocator::total_frame_count() as u32;
    let free = frame_allocator::free_frame_count() as u32;
    let used = total.saturating_sub(free);
    if !copy_to_user(used_ptr, &used.to_le_bytes()) || !copy_to_user(free_ptr, &free.to_le_bytes()) {
        return -1;
    }
    0
}

fn sys_mkdir(path_ptr: u32) -> i32 {
    let Some(path) = read_user_cstr(path_ptr, MAX_PATH) else { return -1 };
    if fs::get_vfs().write().mkdir(&path, Permissions::default()).is_err() {
        return -1;
    }
    leaf_inode(&path).unwrap_or(0) as i32
}

fn sys_unlink(path_ptr: u32) -> i32 {
    let Some(path) = read_user_cstr(path_ptr, MAX_PATH) else { return -1 };
    fs::get_vfs().write().unlink(&path).map(|_| 0).unwrap_or(-1)
}

/// Renders a CMOS real-time-clock read as `"HH:MM:SS\0"`. There is no
/// dedicated RTC driver module; the two-register read (index port
/// 0x70, data port 0x71) is the standard PC convention, same style as
/// `drivers::console`'s direct VGA CRT controller port access.
fn sys_time(buf_ptr: u32) -> i32 {
    fn cmos_read(reg: u8) -> u8 {
        // SAFETY: 0x70/0x71 are the standard CMOS RTC index/data ports.
        unsafe {
            arch::outb(0x70, reg);
            arch::inb(0x71)
        }
    }
    fn bcd_to_bin(v: u8) -> u8 {
        (v & 0x0F) + ((v >> 4) * 10)
    }
    let hour = bcd_to_bin(cmos_read(0x04));
    let min = bcd_to_bin(cmos_read(0x02));
    let sec = bcd_to_bin(cmos_read(0x00));
    let mut out = [0u8; 9];
    let s = alloc::format!("{:02}:{:02}:{:02}", hour, min, sec);
    out[..8].copy_from_slice(s.as_bytes());
    if !copy_to_user(buf_ptr, &out) {
        return -1;
    }
    0
}

/// Pulses the keyboard controller's reset line. Never returns.
fn sys_reboot() -> i32 {
    // SAFETY: 0x64 is the standard PS/2 keyboard controller command
    // port; 0xFE is the documented CPU-reset pulse command.
    unsafe { arch::outb(0x64, 0xFE) };
    arch::x86::halt();
}

fn sys_signal(signo: u32, handler: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    if signal_delivery::set_handler(&task, signo, handler as usize) {
        0
    } else {
        -1
    }
}

fn sys_clone(entry: u32, arg: u32, stack_top: u32) -> i32 {
    let stack_bottom = stack_top.saturating_sub(paging::PAGE_SIZE);
    match process::creation::clone_thread(entry, arg, stack_bottom, stack_top) {
        Ok(task) => task.pid as i32,
        Err(_) => -1,
    }
}

fn sys_clip_set(buf_ptr: u32, len: u32) -> i32 {
    let len = (len as usize).min(CLIPBOARD_CAP);
    let mut buf = alloc::vec![0u8; len];
    if !copy_from_user(buf_ptr, &mut buf) {
        return -1;
    }
    *CLIPBOARD.lock() = buf;
    len as i32
}

fn sys_clip_get(buf_ptr: u32, max: u32) -> i32 {
    let clip = CLIPBOARD.lock();
    let n = clip.len().min(max as usize);
    if !copy_to_user(buf_ptr, &clip[..n]) {
        return -1;
    }
    n as i32
}

fn sys_set_term_mode(mode: u32) -> i32 {
    use crate::drivers::terminal::{self, ECHO, ICANON};
    let mut t = terminal::get_termios_snapshot();
    if mode == 0 {
        t.c_lflag |= ICANON | ECHO;
    } else {
        t.c_lflag &= !(ICANON | ECHO);
    }
    terminal::set_termios(&t);
    0
}

fn sys_set_console_color(fg: u32, bg: u32) -> i32 {
    use crate::drivers::console::ConsoleColor;
    crate::drivers::console::get_console_driver()
        .lock()
        .set_default_color(ConsoleColor::from_nibble(fg), ConsoleColor::from_nibble(bg));
    0
}

fn sys_pipe(fds_ptr: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    let (reader, writer) = fs::pipe::create_pipe();
    let rfd = task.fd_table.alloc(pcb::FileDescriptor::new(reader, 0));
    let wfd = task.fd_table.alloc(pcb::FileDescriptor::new(writer, 0));
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(rfd as u32).to_le_bytes());
    out[4..8].copy_from_slice(&(wfd as u32).to_le_bytes());
    if !copy_to_user(fds_ptr, &out) {
        return -1;
    }
    0
}

fn sys_dup2(old: i32, new: i32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    let Some(desc) = task.fd_table.get(old) else { return -1 };
    task.fd_table.install_at(new, desc);
    new
}

fn sys_mmap(fd: i32, size: u32, flags: u32) -> i32 {
    let Some(task) = current_task() else { return 0 };
    let file = if fd >= 0 { task.fd_table.get(fd).map(|d| d.node.clone()) } else { None };
    let file_size = file.as_ref().and_then(|n| n.metadata().ok()).map(|m| m.size as u32).unwrap_or(0);
    let map_flags = if flags & 1 != 0 { MapFlags::SHARED } else { MapFlags::PRIVATE };
    memory::mmap(&task, file, size, file_size, map_flags).unwrap_or(0) as i32
}

fn sys_munmap(addr: u32, len: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    memory::munmap(&task, addr, len).map(|_| 0).unwrap_or(-1)
}

fn stat_node(node: &alloc::sync::Arc<dyn VfsNode>) -> Option<Stat> {
    let m = node.metadata().ok()?;
    Some(Stat {
        size: m.size as u32,
        node_type: node_type_code(m.node_type),
        permissions: permissions_bits(m.permissions),
        uid: m.uid,
        gid: m.gid,
        created: m.created as u32,
        modified: m.modified as u32,
        accessed: m.accessed as u32,
    })
}

fn write_stat(ptr: u32, stat: &Stat) -> bool {
    // SAFETY: Stat is repr(C), all-u32 fields, no padding-sensitive
    // invariants; read as a flat byte slice for the copy.
    let bytes = unsafe { core::slice::from_raw_parts(stat as *const Stat as *const u8, core::mem::size_of::<Stat>()) };
    copy_to_user(ptr, bytes)
}

fn sys_stat(path_ptr: u32, stat_ptr: u32) -> i32 {
    let Some(path) = read_user_cstr(path_ptr, MAX_PATH) else { return -1 };
    let Ok(node) = vfs::resolve(&path) else { return -1 };
    let Some(stat) = stat_node(&node) else { return -1 };
    if !write_stat(stat_ptr, &stat) {
        return -1;
    }
    0
}

fn sys_fsinfo(ptr: u32) -> i32 {
    let info = FsInfo {
        total_frames: frame_allocator::total_frame_count() as u32,
        free_frames: frame_allocator::free_frame_count() as u32,
        fs_name: {
            let mut n = [0u8; 16];
            let name = b"ramfs";
            n[..name.len()].copy_from_slice(name);
            n
        },
    };
    // SAFETY: FsInfo is repr(C) with no padding-sensitive invariants.
    let bytes = unsafe { core::slice::from_raw_parts(&info as *const FsInfo as *const u8, core::mem::size_of::<FsInfo>()) };
    if !copy_to_user(ptr, bytes) {
        return -1;
    }
    0
}

/// File-content rename via copy-then-unlink (the VFS has no native
/// rename). Directories are not supported by this path.
fn sys_rename(old_ptr: u32, new_ptr: u32) -> i32 {
    let Some(old_path) = read_user_cstr(old_ptr, MAX_PATH) else { return -1 };
    let Some(new_path) = read_user_cstr(new_ptr, MAX_PATH) else { return -1 };
    let Ok(old_node) = vfs::resolve(&old_path) else { return -1 };
    let Ok(meta) = old_node.metadata() else { return -1 };
    if meta.node_type != NodeType::File {
        return -1;
    }
    let mut buf = alloc::vec![0u8; meta.size];
    if old_node.read(0, &mut buf).is_err() {
        return -1;
    }
    let Some((parent_path, name)) = split_path(&new_path) else { return -1 };
    let Ok(parent) = vfs::resolve(parent_path) else { return -1 };
    let Ok(new_node) = parent.create(name, meta.permissions) else { return -1 };
    if new_node.write(0, &buf).is_err() {
        return -1;
    }
    fs::get_vfs().write().unlink(&old_path).map(|_| 0).unwrap_or(-1)
}

fn sys_spawn(path_ptr: u32, argc: u32, argv_ptr: u32) -> i32 {
    let Some(path) = read_user_cstr(path_ptr, MAX_PATH) else { return -1 };
    let mut owned = Vec::with_capacity(argc as usize);
    for i in 0..argc {
        let mut entry = [0u8; 4];
        if !copy_from_user(argv_ptr + i * 4, &mut entry) {
            return -1;
        }
        let Some(s) = read_user_cstr(u32::from_le_bytes(entry), MAX_PATH) else { return -1 };
        owned.push(s);
    }
    let argv: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
    match process::creation::spawn_elf(&path, &argv) {
        Ok(task) => task.pid as i32,
        Err(_) => -1,
    }
}

fn sys_waitpid(pid: i32, status_ptr: u32) -> i32 {
    let (result_pid, status) = if pid < 0 {
        match wait::wait_any() {
            Some((p, s)) => (p as i32, s),
            None => return -1,
        }
    } else {
        match wait::waitpid(pid as u32) {
            Some(s) => (pid, s),
            None => return -1,
        }
    };
    if status_ptr != 0 && !copy_to_user(status_ptr, &status.to_le_bytes()) {
        return -1;
    }
    result_pid
}

fn sys_getdents(fd: i32, buf_ptr: u32, size: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    let Some(desc) = task.fd_table.get(fd) else { return -1 };
    let Ok(entries) = desc.node.readdir() else { return -1 };

    let already = desc.offset.load(core::sync::atomic::Ordering::Acquire) as usize;
    let max_records = (size as usize) / DIRENT_SIZE;
    let mut written = 0usize;
    let mut out = alloc::vec![0u8; max_records * DIRENT_SIZE];

    for entry in entries.iter().skip(already).take(max_records) {
        let mut name = [0u8; 56];
        let name_bytes = entry.name.as_bytes();
        let n = name_bytes.len().min(56);
        name[..n].copy_from_slice(&name_bytes[..n]);
        let record = DirentRecord {
            inode: entry.inode as u32,
            node_type: node_type_code(entry.node_type) as u8,
            name_len: n as u8,
            _reserved: 0,
            name,
        };
        // SAFETY: DirentRecord is repr(C), fixed-size, no padding-sensitive invariants.
        let bytes = unsafe { core::slice::from_raw_parts(&record as *const DirentRecord as *const u8, DIRENT_SIZE) };
        out[written..written + DIRENT_SIZE].copy_from_slice(bytes);
        written += DIRENT_SIZE;
    }
    if !copy_to_user(buf_ptr, &out[..written]) {
        return -1;
    }
    desc.offset.fetch_add((written / DIRENT_SIZE) as u32, core::sync::atomic::Ordering::AcqRel);
    written as i32
}

const AT_FDCWD: i32 = -100;

fn sys_fstatat(dirfd: i32, name_ptr: u32, stat_ptr: u32) -> i32 {
    let Some(name) = read_user_cstr(name_ptr, MAX_PATH) else { return -1 };
    let node = if dirfd == AT_FDCWD {
        vfs::resolve(&name)
    } else {
        let Some(task) = current_task() else { return -1 };
        let Some(desc) = task.fd_table.get(dirfd) else { return -1 };
        desc.node.lookup(&name)
    };
    let Ok(node) = node else { return -1 };
    let Some(stat) = stat_node(&node) else { return -1 };
    if !write_stat(stat_ptr, &stat) {
        return -1;
    }
    0
}

fn sys_shm_create(size: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    match fs::shm::create_anon(size as usize) {
        Some(node) => task.fd_table.alloc(pcb::FileDescriptor::new(node, 0)),
        None => -1,
    }
}

fn sys_pipe_try_read(fd: i32, buf_ptr: u32, size: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    let Some(desc) = task.fd_table.get(fd) else { return -1 };
    if !user_validation::check_user_buffer_writable_present(buf_ptr, size) {
        return -1;
    }
    let mut buf = alloc::vec![0u8; size as usize];
    match desc.node.try_read(0, &mut buf) {
        Ok(n) => {
            if !copy_to_user(buf_ptr, &buf[..n]) {
                return -1;
            }
            n as i32
        }
        Err(_) => -1,
    }
}

fn sys_pipe_try_write(fd: i32, buf_ptr: u32, size: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    let Some(desc) = task.fd_table.get(fd) else { return -1 };
    if !user_validation::check_user_buffer_present(buf_ptr, size) {
        return -1;
    }
    let mut buf = alloc::vec![0u8; size as usize];
    if !copy_from_user(buf_ptr, &mut buf) {
        return -1;
    }
    match desc.node.try_write(0, &buf) {
        Ok(n) => n as i32,
        Err(_) => -1,
    }
}

fn sys_kbd_try_read(char_ptr: u32) -> i32 {
    let Some(node) = fs::devfs::fetch("kbd") else { return -1 };
    let mut byte = [0u8; 1];
    match node.try_read(0, &mut byte) {
        Ok(0) => 0,
        Ok(_) => {
            if !copy_to_user(char_ptr, &byte) {
                return -1;
            }
            1
        }
        Err(_) => -1,
    }
}

fn sys_ipc_listen(name_ptr: u32) -> i32 {
    let Some(name) = read_user_cstr(name_ptr, MAX_PATH) else { return -1 };
    let Some(task) = current_task() else { return -1 };
    match listener::listen_handle(&name) {
        Ok(node) => task.fd_table.alloc(pcb::FileDescriptor::new(node, 0)),
        Err(_) => -1,
    }
}

fn write_channel_fds(task: &pcb::Task, channel: listener::Channel, out_ptr: u32) -> bool {
    let rfd = task.fd_table.alloc(pcb::FileDescriptor::new(channel.reader, 0));
    let wfd = task.fd_table.alloc(pcb::FileDescriptor::new(channel.writer, 0));
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(rfd as u32).to_le_bytes());
    out[4..8].copy_from_slice(&(wfd as u32).to_le_bytes());
    copy_to_user(out_ptr, &out)
}

fn sys_ipc_accept(lfd: i32, fds_ptr: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    let Some(desc) = task.fd_table.get(lfd) else { return -1 };
    let Some(name) = desc.node.listener_name().map(String::from) else { return -1 };
    match listener::ipc_accept(&name) {
        Ok(channel) => {
            if !write_channel_fds(&task, channel, fds_ptr) {
                return -1;
            }
            1
        }
        Err(_) => -1,
    }
}

fn sys_ipc_connect(name_ptr: u32, fds_ptr: u32) -> i32 {
    let Some(name) = read_user_cstr(name_ptr, MAX_PATH) else { return -1 };
    let Some(task) = current_task() else { return -1 };
    match listener::ipc_connect(&name) {
        Ok(channel) => {
            if !write_channel_fds(&task, channel, fds_ptr) {
                return -1;
            }
            0
        }
        Err(_) => -1,
    }
}

fn sys_fb_present(req_ptr: u32) -> i32 {
    let mut raw = [0u8; core::mem::size_of::<FbPresentReq>()];
    if !copy_from_user(req_ptr, &mut raw) {
        return -1;
    }
    // SAFETY: raw is exactly sized and was copied from validated user memory.
    let req = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const FbPresentReq) };
    if req.rect_count as usize > 4096 {
        return -1;
    }
    let rect_bytes = req.rect_count as usize * core::mem::size_of::<UserRect>();
    let mut rect_buf = alloc::vec![0u8; rect_bytes];
    if !copy_from_user(req.rects, &mut rect_buf) {
        return -1;
    }
    let mut rects = Vec::with_capacity(req.rect_count as usize);
    for i in 0..req.rect_count as usize {
        // SAFETY: rect_buf holds exactly rect_count UserRect-sized records.
        let r = unsafe { core::ptr::read_unaligned((rect_buf.as_ptr() as *const UserRect).add(i)) };
        if r.x < 0 || r.y < 0 || r.w < 0 || r.h < 0 {
            continue;
        }
        rects.push(crate::fb::Rect { x: r.x as u32, y: r.y as u32, w: r.w as u32, h: r.h as u32 });
    }
    crate::fb::fb_present(current_pid(), req.src, req.src_stride, &rects).map(|_| 0).unwrap_or(-1)
}

fn sys_shm_create_named(name_ptr: u32, size: u32) -> i32 {
    let Some(name) = read_user_cstr(name_ptr, MAX_PATH) else { return -1 };
    let Some(task) = current_task() else { return -1 };
    match fs::shm::create_named(&name, size as usize) {
        Some(node) => task.fd_table.alloc(pcb::FileDescriptor::new(node, 0)),
        None => -1,
    }
}

fn sys_shm_open_named(name_ptr: u32) -> i32 {
    let Some(name) = read_user_cstr(name_ptr, MAX_PATH) else { return -1 };
    let Some(task) = current_task() else { return -1 };
    match fs::shm::open_named(&name) {
        Some(node) => task.fd_table.alloc(pcb::FileDescriptor::new(node, 0)),
        None => -1,
    }
}

fn sys_shm_unlink_named(name_ptr: u32) -> i32 {
    let Some(name) = read_user_cstr(name_ptr, MAX_PATH) else { return -1 };
    if fs::shm::unlink_named(&name) {
        0
    } else {
        -1
    }
}

fn sys_futex_wait(uaddr: u32, expected: u32) -> i32 {
    futex::wait(uaddr, expected).map(|_| 0).unwrap_or(-1)
}

fn sys_futex_wake(uaddr: u32, n: u32) -> i32 {
    futex::wake(uaddr, n) as i32
}

fn sys_poll(fds_ptr: u32, nfds: u32, timeout_ms: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    let fds_bytes = nfds as usize * core::mem::size_of::<PollFd>();
    let mut raw = alloc::vec![0u8; fds_bytes];

    let mut elapsed = 0u32;
    let step = 10u32;
    loop {
        if !copy_from_user(fds_ptr, &mut raw) {
            return -1;
        }
        let mut ready = 0i32;
        for i in 0..nfds as usize {
            // SAFETY: raw holds exactly nfds PollFd-sized records.
            let mut pf = unsafe { core::ptr::read_unaligned((raw.as_ptr() as *const PollFd).add(i)) };
            pf.revents = 0;
            match task.fd_table.get(pf.fd) {
                None => pf.revents |= POLLNVAL,
                Some(desc) => {
                    if pf.events & POLLIN != 0 {
                        let mut probe = [0u8; 1];
                        match desc.node.try_read(0, &mut probe) {
                            Ok(0) => pf.revents |= POLLHUP,
                            Ok(_) => pf.revents |= POLLIN,
                            Err(_) => {}
                        }
                    }
                    if pf.events & POLLOUT != 0 {
                        pf.revents |= POLLOUT;
                    }
                }
            }
            if pf.revents != 0 {
                ready += 1;
            }
            // SAFETY: see above; write back the same validated slot.
            unsafe { core::ptr::write_unaligned((raw.as_mut_ptr() as *mut PollFd).add(i), pf) };
        }
        if ready > 0 {
            if !copy_to_user(fds_ptr, &raw) {
                return -1;
            }
            return ready;
        }
        if task.pending_signals.load(core::sync::atomic::Ordering::Acquire) & (1 << signal::SIGINT) != 0 {
            return -2;
        }
        if timeout_ms == 0 {
            return 0;
        }
        crate::sched::sleep_ms(step);
        elapsed += step;
        if elapsed >= timeout_ms {
            return 0;
        }
    }
}

fn sys_ioctl(fd: i32, req: usize, arg: u32) -> i32 {
    use crate::drivers::terminal::{self, KernelTermios, KernelWinsize};
    let Some(task) = current_task() else { return -1 };
    if task.fd_table.get(fd).is_none() {
        return -1;
    }
    match req {
        TCGETS => {
            let t = terminal::get_termios_snapshot();
            // SAFETY: KernelTermios is repr(C) with a fixed byte layout.
            let bytes = unsafe { core::slice::from_raw_parts(&t as *const KernelTermios as *const u8, core::mem::size_of::<KernelTermios>()) };
            if !copy_to_user(arg, bytes) { -1 } else { 0 }
        }
        TCSETS | TCSETSW | TCSETSF => {
            let mut raw = [0u8; core::mem::size_of::<KernelTermios>()];
            if !copy_from_user(arg, &mut raw) {
                return -1;
            }
            // SAFETY: raw is exactly sized for KernelTermios.
            let t = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const KernelTermios) };
            terminal::set_termios(&t);
            0
        }
        TIOCGWINSZ => {
            let ws = terminal::get_winsize_snapshot();
            // SAFETY: KernelWinsize is repr(C) with a fixed byte layout.
            let bytes = unsafe { core::slice::from_raw_parts(&ws as *const KernelWinsize as *const u8, core::mem::size_of::<KernelWinsize>()) };
            if !copy_to_user(arg, bytes) { -1 } else { 0 }
        }
        TIOCSWINSZ => {
            let mut raw = [0u8; core::mem::size_of::<KernelWinsize>()];
            if !copy_from_user(arg, &mut raw) {
                return -1;
            }
            // SAFETY: raw is exactly sized for KernelWinsize.
            let ws = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const KernelWinsize) };
            terminal::set_winsize(&ws);
            0
        }
        _ => -1,
    }
}

fn sys_chdir(path_ptr: u32) -> i32 {
    let Some(path) = read_user_cstr(path_ptr, MAX_PATH) else { return -1 };
    let Some(task) = current_task() else { return -1 };
    if fs::get_vfs().write().set_cwd(path.clone()).is_err() {
        return -1;
    }
    cwd::set_path(&task, &path);
    if let Some(inode) = leaf_inode(&path) {
        cwd::set(&task, inode);
    }
    0
}

fn sys_getcwd(buf_ptr: u32, size: u32) -> i32 {
    let Some(task) = current_task() else { return -1 };
    let path = cwd::get_path(&task);
    let needed = path.len() + 1;
    if needed > size as usize {
        return -1;
    }
    let mut out = alloc::vec![0u8; needed];
    out[..path.len()].copy_from_slice(path.as_bytes());
    if !copy_to_user(buf_ptr, &out) {
        return -1;
    }
    path.len() as i32
}

fn sys_proc_list(buf_ptr: u32, cap: u32) -> i32 {
    let mut infos = Vec::new();
    table::for_each(|t| {
        if infos.len() >= cap as usize {
            return;
        }
        let mut name = [0u8; 32];
        let n = t.name.lock();
        let bytes = n.as_bytes();
        let len = bytes.len().min(32);
        name[..len].copy_from_slice(&bytes[..len]);
        infos.push(ProcInfo {
            pid: t.pid,
            parent_pid: t.parent_pid.load(core::sync::atomic::Ordering::Acquire),
            state: t.state() as u32,
            priority: t.priority as u32,
            name,
        });
    });
    let record_size = core::mem::size_of::<ProcInfo>();
    let mut out = alloc::vec![0u8; infos.len() * record_size];
    for (i, info) in infos.iter().enumerate() {
        // SAFETY: ProcInfo is repr(C), fixed-size, no padding-sensitive invariants.
        let bytes = unsafe { core::slice::from_raw_parts(info as *const ProcInfo as *const u8, record_size) };
        out[i * record_size..(i + 1) * record_size].copy_from_slice(bytes);
    }
    if !copy_to_user(buf_ptr, &out) {
        return -1;
    }
    infos.len() as i32
}

// ===========================================================================
// sigreturn / signal delivery, called directly by
// arch::x86::syscall::dispatch_trampoline around every return to user
// space, not through dispatch()'s match above.
// ===========================================================================

/// Restores the register frame a caught signal's handler interrupted,
/// bit for bit. Called only for `num == SIGRETURN_NR`; a task that
/// traps this without a saved frame (never dispatched a handler) is
/// left untouched.
///
/// # Safety
/// `frame` must point at the live `TrapFrame` of the syscall currently
/// unwinding back to user space.
pub unsafe fn do_sigreturn(frame: *mut TrapFrame) {
    let Some(task) = current_task() else { return };
    let Some(saved) = task.saved_frame.lock().take() else { return };
    // SAFETY: delegated to caller.
    unsafe {
        (*frame).eax = saved.eax;
        (*frame).ebx = saved.ebx;
        (*frame).ecx = saved.ecx;
        (*frame).edx = saved.edx;
        (*frame).esi = saved.esi;
        (*frame).edi = saved.edi;
        (*frame).ebp = saved.ebp;
        (*frame).eip = saved.eip;
        (*frame).cs = saved.cs;
        (*frame).eflags = saved.eflags;
        (*frame).esp = saved.esp;
        (*frame).ss = saved.ss;
    }
}

/// Redirects `frame` into a pending signal's handler, if the current
/// task has one dispatchable. Snapshots the frame this syscall is about
/// to return through into `task.saved_frame` first, so `sigreturn` can
/// restore it; simulates the stack `call handler(signum)` would have
/// left by pushing `signum` then the `sigreturn` trampoline address as
/// the fake return address, directly through the user stack pointer
/// already live in `frame.esp` (valid without a fixmap: CR3 is already
/// this task's own directory at this point in the trap's lifetime).
///
/// # Safety
/// `frame` must point at the live `TrapFrame` of the syscall currently
/// unwinding back to user space.
pub unsafe fn maybe_deliver_signal(frame: *mut TrapFrame) {
    let Some(task) = current_task() else { return };
    let Some(dispatch) = signal_delivery::take_dispatchable(&task) else { return };

    // SAFETY: delegated to caller.
    unsafe {
        let snapshot = SavedFrame {
            eax: (*frame).eax, ebx: (*frame).ebx, ecx: (*frame).ecx, edx: (*frame).edx,
            esi: (*frame).esi, edi: (*frame).edi, ebp: (*frame).ebp, eip: (*frame).eip,
            cs: (*frame).cs, eflags: (*frame).eflags, esp: (*frame).esp, ss: (*frame).ss,
        };
        *task.saved_frame.lock() = Some(snapshot);

        let mut sp = (*frame).esp;
        sp -= 4;
        core::ptr::write(sp as *mut u32, dispatch.signum);
        sp -= 4;
        core::ptr::write(sp as *mut u32, process::SIGRETURN_TRAMPOLINE_VADDR);

        (*frame).esp = sp;
        (*frame).eip = dispatch.handler as u32;
    }
}
