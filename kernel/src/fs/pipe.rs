//! Anonymous pipes.
//!
//! A pipe is a pair of [`VfsNode`]s -- one read end, one write end --
//! sharing a single [`PipeBuffer`]: a fixed 32 KiB ring plus a read-side
//! and write-side wait queue. Used by the shell's `|` operator, the
//! `pipe` syscall, and the IPC listener's per-connection streams.

#![allow(dead_code)]

extern crate alloc;

use alloc::{boxed::Box, sync::Arc, vec};
use core::sync::atomic::{AtomicU32, Ordering};

use super::{DirEntry, Metadata, NodeType, Permissions, VfsNode};
use crate::sync::{
    poll_waitq::{PollWaitq, PollWaiter},
    spinlock::Spinlock,
};

/// Ring capacity, per the kernel's pipe design.
pub const PIPE_CAPACITY: usize = 32 * 1024;

struct Ring {
    data: Box<[u8]>,
    r_ptr: usize,
    w_ptr: usize,
    len: usize,
}

impl Ring {
    fn new() -> Self {
        Ring {
            data: vec![0u8; PIPE_CAPACITY].into_boxed_slice(),
            r_ptr: 0,
            w_ptr: 0,
            len: 0,
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len);
        for slot in buf.iter_mut().take(n) {
            *slot = self.data[self.r_ptr];
            self.r_ptr = (self.r_ptr + 1) % PIPE_CAPACITY;
        }
        self.len -= n;
        n
    }

    fn write_some(&mut self, data: &[u8]) -> usize {
        let space = PIPE_CAPACITY - self.len;
        let n = data.len().min(space);
        for &byte in data.iter().take(n) {
            self.data[self.w_ptr] = byte;
            self.w_ptr = (self.w_ptr + 1) % PIPE_CAPACITY;
        }
        self.len += n;
        n
    }
}

struct PipeBuffer {
    ring: Spinlock<Ring>,
    sem_read: PollWaitq,
    sem_write: PollWaitq,
    readers: AtomicU32,
    writers: AtomicU32,
}

impl PipeBuffer {
    fn new() -> Self {
        PipeBuffer {
            ring: Spinlock::new(Ring::new()),
            sem_read: PollWaitq::new(),
            sem_write: PollWaitq::new(),
            readers: AtomicU32::new(1),
            writers: AtomicU32::new(1),
        }
    }
}

/// The read half of a pipe.
pub struct PipeReadEnd {
    buf: Arc<PipeBuffer>,
}

/// The write half of a pipe.
pub struct PipeWriteEnd {
    buf: Arc<PipeBuffer>,
}

/// Create a connected `(read_end, write_end)` pair.
pub fn create_pipe() -> (Arc<dyn VfsNode>, Arc<dyn VfsNode>) {
    let buf = Arc::new(PipeBuffer::new());
    (
        Arc::new(PipeReadEnd { buf: buf.clone() }),
        Arc::new(PipeWriteEnd { buf }),
    )
}

fn pipe_metadata() -> Metadata {
    Metadata {
        node_type: NodeType::Pipe,
        size: 0,
        permissions: Permissions::read_only(),
        uid: 0,
        gid: 0,
        created: 0,
        modified: 0,
        accessed: 0,
    }
}

fn block_on(waitq: &PollWaitq) {
    let mut waiter = PollWaiter::default();
    waitq.register(&mut waiter, crate::sched::current_task_id());
    crate::sched::block_current();
    waitq.unregister(&mut waiter);
}

impl VfsNode for PipeReadEnd {
    fn node_type(&self) -> NodeType {
        NodeType::Pipe
    }

    fn read(&self, _offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
        if buffer.is_empty() {
            return Ok(0);
        }
        loop {
            let n = self.buf.ring.lock().read_some(buffer);
            if n > 0 {
                self.buf.sem_write.wake_all();
                return Ok(n);
            }
            if self.buf.writers.load(Ordering::Acquire) == 0 {
                return Ok(0); // EOF: no writer left and buffer is empty
            }
            block_on(&self.buf.sem_read);
        }
    }

    fn try_read(&self, _offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
        let n = self.buf.ring.lock().read_some(buffer);
        if n > 0 {
            self.buf.sem_write.wake_all();
            return Ok(n);
        }
        if self.buf.writers.load(Ordering::Acquire) == 0 {
            Ok(0) // EOF
        } else {
            Err("would block")
        }
    }

    fn write(&self, _offset: usize, _data: &[u8]) -> Result<usize, &'static str> {
        Err("Cannot write to pipe read end")
    }

    fn metadata(&self) -> Result<Metadata, &'static str> {
        Ok(pipe_metadata())
    }

    fn readdir(&self) -> Result<alloc::vec::Vec<DirEntry>, &'static str> {
        Err("Not a directory")
    }

    fn lookup(&self, _name: &str) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Not a directory")
    }

    fn create(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create in pipe")
    }

    fn mkdir(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create in pipe")
    }

    fn unlink(&self, _name: &str) -> Result<(), &'static str> {
        Err("Cannot unlink from pipe")
    }

    fn truncate(&self, _size: usize) -> Result<(), &'static str> {
        Err("Cannot truncate pipe")
    }
}

impl Drop for PipeReadEnd {
    fn drop(&mut self) {
        self.buf.readers.fetch_sub(1, Ordering::AcqRel);
        self.buf.sem_write.detach_all();
    }
}

impl VfsNode for PipeWriteEnd {
    fn node_type(&self) -> NodeType {
        NodeType::Pipe
    }

    fn read(&self, _offset: usize, _buffer: &mut [u8]) -> Result<usize, &'static str> {
        Err("Cannot read from pipe write end")
    }

    fn write(&self, _offset: usize, data: &[u8]) -> Result<usize, &'static str> {
        if self.buf.readers.load(Ordering::Acquire) == 0 {
            return Err("Broken pipe");
        }
        let mut written = 0;
        while written < data.len() {
            if self.buf.readers.load(Ordering::Acquire) == 0 {
                return Err("Broken pipe");
            }
            let n = self.buf.ring.lock().write_some(&data[written..]);
            if n > 0 {
                written += n;
                self.buf.sem_read.wake_all();
            } else {
                block_on(&self.buf.sem_write);
            }
        }
        Ok(written)
    }

    fn try_write(&self, _offset: usize, data: &[u8]) -> Result<usize, &'static str> {
        if self.buf.readers.load(Ordering::Acquire) == 0 {
            return Err("Broken pipe");
        }
        let n = self.buf.ring.lock().write_some(data);
        if n > 0 {
            self.buf.sem_read.wake_all();
            Ok(n)
        } else {
            Err("would block")
        }
    }

    fn metadata(&self) -> Result<Metadata, &'static str> {
        Ok(pipe_metadata())
    }

    fn readdir(&self) -> Result<alloc::vec::Vec<DirEntry>, &'static str> {
        Err("Not a directory")
    }

    fn lookup(&self, _name: &str) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Not a directory")
    }

    fn create(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create in pipe")
    }

    fn mkdir(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create in pipe")
    }

    fn unlink(&self, _name: &str) -> Result<(), &'static str> {
        Err("Cannot unlink from pipe")
    }

    fn truncate(&self, _size: usize) -> Result<(), &'static str> {
        Err("Cannot truncate pipe")
    }
}

impl Drop for PipeWriteEnd {
    fn drop(&mut self) {
        self.buf.writers.fetch_sub(1, Ordering::AcqRel);
        self.buf.sem_read.detach_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let (r, w) = create_pipe();
        assert_eq!(w.write(0, b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        let n = r.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn eof_after_writer_dropped() {
        let (r, w) = create_pipe();
        drop(w);
        let mut buf = [0u8; 16];
        assert_eq!(r.read(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn broken_pipe_after_reader_dropped() {
        let (r, w) = create_pipe();
        drop(r);
        assert!(w.write(0, b"x").is_err());
    }

    #[test]
    fn try_read_reports_would_block_on_empty_buffer() {
        let (r, _w) = create_pipe();
        let mut buf = [0u8; 4];
        assert_eq!(r.try_read(0, &mut buf), Err("would block"));
    }
}
