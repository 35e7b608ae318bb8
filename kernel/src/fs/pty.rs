//! Pseudo-terminals.
//!
//! A PTY is a master/slave pair sharing one [`PtyInner`] line discipline:
//! an input queue (master write -> slave read, ICRNL-transformed) and an
//! output queue (slave write -> master read, ONLCR-transformed), plus
//! termios flags, window size, and the foreground process that control
//! characters (`VINTR`/`VQUIT`/`VSUSP`) and `SIGWINCH` are delivered to.
//!
//! Job control here is simplified to a single foreground pid rather than
//! full process-group fan-out: the minimal task model this kernel uses
//! (`process::pcb::Task`) has no `pgid`/`sid` fields, so
//! `TIOCGPGRP`/`TIOCSPGRP`/`TIOCGSID` all operate on that one pid. A
//! shell's single foreground job is the overwhelmingly common case this
//! is built for.

#![allow(dead_code)]

extern crate alloc;

use alloc::{collections::VecDeque, format, string::String, sync::Arc};
use core::sync::atomic::{AtomicU32, Ordering};

use super::{devfs, DirEntry, Metadata, NodeType, Permissions, VfsNode};
use crate::process::signal_delivery::{raise, signal};
use crate::sync::{
    poll_waitq::{PollWaitq, PollWaiter},
    spinlock::Spinlock,
};

pub const PTY_BUFFER_SIZE: usize = 4096;

/// `ioctl` request codes this kernel's tty layer understands.
pub mod ioctl {
    pub const TIOCGPTN: u32 = 0x8004_5430;
    pub const TCGETS: u32 = 0x5401;
    pub const TCSETS: u32 = 0x5402;
    pub const TIOCGWINSZ: u32 = 0x5413;
    pub const TIOCSWINSZ: u32 = 0x5414;
    pub const TIOCGSID: u32 = 0x5429;
    pub const TCGETPGRP: u32 = 0x540F;
    pub const TCSETPGRP: u32 = 0x5410;
    pub const TIOCSCTTY: u32 = 0x540E;
}

#[derive(Debug, Clone, Copy)]
pub struct Winsize {
    pub rows: u16,
    pub cols: u16,
    pub xpixel: u16,
    pub ypixel: u16,
}

impl Default for Winsize {
    fn default() -> Self {
        Winsize { rows: 24, cols: 80, xpixel: 0, ypixel: 0 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Termios {
    pub echo: bool,
    pub canonical: bool,
    pub isig: bool,
    pub icrnl: bool,
    pub onlcr: bool,
}

impl Default for Termios {
    fn default() -> Self {
        Termios { echo: true, canonical: true, isig: true, icrnl: true, onlcr: true }
    }
}

pub mod cc {
    pub const VINTR: u8 = 0x03; // ^C
    pub const VQUIT: u8 = 0x1c; // ^\
    pub const VSUSP: u8 = 0x1a; // ^Z
}

struct PtyInner {
    /// Bytes typed at the master, ready for the slave to read.
    to_slave: VecDeque<u8>,
    /// Bytes written by the slave, ready for the master to read.
    to_master: VecDeque<u8>,
    termios: Termios,
    winsize: Winsize,
    foreground_pid: Option<u32>,
    session_pid: Option<u32>,
    master_open: bool,
    slave_open: bool,
}

struct PtyPair {
    id: u32,
    inner: Spinlock<PtyInner>,
    slave_waitq: PollWaitq,
    master_waitq: PollWaitq,
}

impl PtyPair {
    fn new(id: u32) -> Arc<Self> {
        Arc::new(PtyPair {
            id,
            inner: Spinlock::new(PtyInner {
                to_slave: VecDeque::with_capacity(PTY_BUFFER_SIZE),
                to_master: VecDeque::with_capacity(PTY_BUFFER_SIZE),
                termios: Termios::default(),
                winsize: Winsize::default(),
                foreground_pid: None,
                session_pid: None,
                master_open: true,
                slave_open: true,
            }),
            slave_waitq: PollWaitq::new(),
            master_waitq: PollWaitq::new(),
        })
    }

    fn ioctl(&self, cmd: u32, arg: usize) -> Result<u32, &'static str> {
        let mut inner = self.inner.lock();
        match cmd {
            ioctl::TIOCGPTN => Ok(self.id),
            ioctl::TCGETS => {
                // Caller packs/unpacks the flags at `arg`; we just hand back a
                // bit-packed summary since there is no userspace struct layout
                // to write through from kernel space here.
                let t = inner.termios;
                Ok(t.echo as u32 | (t.canonical as u32) << 1 | (t.isig as u32) << 2
                    | (t.icrnl as u32) << 3 | (t.onlcr as u32) << 4)
            }
            ioctl::TCSETS => {
                inner.termios = Termios {
                    echo: arg & 1 != 0,
                    canonical: arg & 2 != 0,
                    isig: arg & 4 != 0,
                    icrnl: arg & 8 != 0,
                    onlcr: arg & 16 != 0,
                };
                Ok(0)
            }
            ioctl::TIOCGWINSZ => {
                let w = inner.winsize;
                Ok((w.rows as u32) << 16 | w.cols as u32)
            }
            ioctl::TIOCSWINSZ => {
                inner.winsize = Winsize {
                    rows: (arg >> 16) as u16,
                    cols: arg as u16,
                    xpixel: 0,
                    ypixel: 0,
                };
                if let Some(pid) = inner.foreground_pid {
                    drop(inner);
                    signal_pid(pid, signal::SIGWINCH);
                }
                Ok(0)
            }
            ioctl::TIOCGSID => inner.session_pid.ok_or("No controlling terminal"),
            ioctl::TCGETPGRP => inner.foreground_pid.ok_or("No foreground process"),
            ioctl::TCSETPGRP => {
                inner.foreground_pid = Some(arg as u32);
                Ok(0)
            }
            ioctl::TIOCSCTTY => {
                let pid = crate::sched::current_task_id();
                inner.session_pid = Some(pid);
                inner.foreground_pid = Some(pid);
                Ok(0)
            }
            _ => Err("Unsupported ioctl"),
        }
    }
}

fn signal_pid(pid: u32, sig: u32) {
    if let Some(task) = crate::process::table::find(pid) {
        raise(&task, sig);
        crate::sched::wake_task(pid);
    }
}

/// Applies input-side line discipline (ICRNL, signal-generating control
/// characters) and appends the result to `to_slave`.
fn feed_input(pair: &PtyPair, data: &[u8]) {
    let mut inner = pair.inner.lock();
    for &byte in data {
        if inner.termios.isig {
            let sig = match byte {
                cc::VINTR => Some(signal::SIGINT),
                cc::VQUIT => Some(signal::SIGQUIT),
                cc::VSUSP => Some(signal::SIGTSTP),
                _ => None,
            };
            if let Some(sig) = sig {
                if let Some(pid) = inner.foreground_pid {
                    drop(inner);
                    signal_pid(pid, sig);
                    inner = pair.inner.lock();
                }
                continue;
            }
        }
        let translated = if inner.termios.icrnl && byte == b'\r' { b'\n' } else { byte };
        inner.to_slave.push_back(translated);
    }
    drop(inner);
    pair.slave_waitq.wake_all();
}

/// Applies output-side line discipline (ONLCR) and appends to `to_master`.
fn feed_output(pair: &PtyPair, data: &[u8]) {
    let mut inner = pair.inner.lock();
    for &byte in data {
        if inner.termios.onlcr && byte == b'\n' {
            inner.to_master.push_back(b'\r');
        }
        inner.to_master.push_back(byte);
    }
    drop(inner);
    pair.master_waitq.wake_all();
}

fn drain_blocking(
    pair: &Arc<PtyPair>,
    queue: impl Fn(&mut PtyInner) -> &mut VecDeque<u8>,
    other_open: impl Fn(&PtyInner) -> bool,
    waitq: &PollWaitq,
    buffer: &mut [u8],
) -> Result<usize, &'static str> {
    loop {
        {
            let mut inner = pair.inner.lock();
            let q = queue(&mut inner);
            if !q.is_empty() {
                let n = buffer.len().min(q.len());
                for slot in buffer.iter_mut().take(n) {
                    *slot = q.pop_front().unwrap();
                }
                return Ok(n);
            }
            if !other_open(&inner) {
                return Ok(0);
            }
        }
        let mut waiter = PollWaiter::default();
        waitq.register(&mut waiter, crate::sched::current_task_id());
        crate::sched::block_current();
        waitq.unregister(&mut waiter);
    }
}

pub struct PtyMaster {
    pair: Arc<PtyPair>,
}

pub struct PtySlave {
    pair: Arc<PtyPair>,
}

fn tty_metadata() -> Metadata {
    Metadata {
        node_type: NodeType::CharDevice,
        size: 0,
        permissions: Permissions::default(),
        uid: 0,
        gid: 0,
        created: 0,
        modified: 0,
        accessed: 0,
    }
}

macro_rules! impl_unused_vfsnode_members {
    () => {
        fn readdir(&self) -> Result<alloc::vec::Vec<DirEntry>, &'static str> {
            Err("Not a directory")
        }
        fn lookup(&self, _name: &str) -> Result<Arc<dyn VfsNode>, &'static str> {
            Err("Not a directory")
        }
        fn create(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
            Err("Cannot create on tty")
        }
        fn mkdir(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
            Err("Cannot create on tty")
        }
        fn unlink(&self, _name: &str) -> Result<(), &'static str> {
            Err("Cannot unlink tty")
        }
        fn truncate(&self, _size: usize) -> Result<(), &'static str> {
            Err("Cannot truncate tty")
        }
        fn metadata(&self) -> Result<Metadata, &'static str> {
            Ok(tty_metadata())
        }
    };
}

impl VfsNode for PtyMaster {
    fn node_type(&self) -> NodeType {
        NodeType::CharDevice
    }

    fn read(&self, _offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
        drain_blocking(
            &self.pair,
            |inner| &mut inner.to_master,
            |inner| inner.slave_open,
            &self.pair.master_waitq,
            buffer,
        )
    }

    fn try_read(&self, _offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
        let mut inner = self.pair.inner.lock();
        let n = buffer.len().min(inner.to_master.len());
        for slot in buffer.iter_mut().take(n) {
            *slot = inner.to_master.pop_front().unwrap();
        }
        if n > 0 {
            Ok(n)
        } else if !inner.slave_open {
            Ok(0)
        } else {
            Err("would block")
        }
    }

    fn write(&self, _offset: usize, data: &[u8]) -> Result<usize, &'static str> {
        feed_input(&self.pair, data);
        Ok(data.len())
    }

    impl_unused_vfsnode_members!();
}

impl Drop for PtyMaster {
    fn drop(&mut self) {
        self.pair.inner.lock().master_open = false;
        self.pair.slave_waitq.detach_all();
        devfs::take(&format!("pts/{}", self.pair.id));
    }
}

impl VfsNode for PtySlave {
    fn node_type(&self) -> NodeType {
        NodeType::CharDevice
    }

    fn read(&self, _offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
        drain_blocking(
            &self.pair,
            |inner| &mut inner.to_slave,
            |inner| inner.master_open,
            &self.pair.slave_waitq,
            buffer,
        )
    }

    fn try_read(&self, _offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
        let mut inner = self.pair.inner.lock();
        let n = buffer.len().min(inner.to_slave.len());
        for slot in buffer.iter_mut().take(n) {
            *slot = inner.to_slave.pop_front().unwrap();
        }
        if n > 0 {
            Ok(n)
        } else if !inner.master_open {
            Ok(0)
        } else {
            Err("would block")
        }
    }

    fn write(&self, _offset: usize, data: &[u8]) -> Result<usize, &'static str> {
        feed_output(&self.pair, data);
        Ok(data.len())
    }

    impl_unused_vfsnode_members!();
}

impl Drop for PtySlave {
    fn drop(&mut self) {
        self.pair.inner.lock().slave_open = false;
        self.pair.master_waitq.detach_all();
    }
}

impl PtyMaster {
    pub fn ioctl(&self, cmd: u32, arg: usize) -> Result<u32, &'static str> {
        self.pair.ioctl(cmd, arg)
    }
}

impl PtySlave {
    pub fn ioctl(&self, cmd: u32, arg: usize) -> Result<u32, &'static str> {
        self.pair.ioctl(cmd, arg)
    }
}

static NEXT_PTY_ID: AtomicU32 = AtomicU32::new(0);

/// Implements opening `/dev/ptmx`: allocates a new PTY pair, registers
/// its slave under `/dev/pts/<n>`, and returns the master end plus the
/// slave's device path.
pub fn open_ptmx() -> (Arc<dyn VfsNode>, String) {
    let id = NEXT_PTY_ID.fetch_add(1, Ordering::AcqRel);
    let pair = PtyPair::new(id);
    let master: Arc<dyn VfsNode> = Arc::new(PtyMaster { pair: pair.clone() });
    let slave: Arc<dyn VfsNode> = Arc::new(PtySlave { pair });
    let path = format!("pts/{}", id);
    devfs::register(&path, slave);
    (master, format!("/dev/{}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_crosses_to_slave_with_icrnl() {
        let (master, path) = open_ptmx();
        let _ = path;
        master.write(0, b"hi\r").unwrap();
        let slave = devfs::fetch(&path["/dev/".len()..]).unwrap();
        let mut buf = [0u8; 8];
        let n = slave.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi\n");
    }

    #[test]
    fn output_gets_onlcr() {
        let (master, path) = open_ptmx();
        let slave = devfs::fetch(&path["/dev/".len()..]).unwrap();
        slave.write(0, b"a\nb").unwrap();
        let mut buf = [0u8; 8];
        let n = master.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"a\r\nb");
    }
}
