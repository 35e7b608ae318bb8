//! POSIX-style shared memory objects.
//!
//! A shared memory object is a fixed set of physical frames, allocated
//! once at creation and handed out by reference (not copied) to every
//! `mmap(MAP_SHARED)` caller and every direct `read`/`write` through its
//! fd -- the same frame backs every mapping, so writes from one process
//! are immediately visible to all others. Modeled after the ring-backed
//! single-file-per-object pattern in [`super::pipe`], with frame
//! ownership/zeroing borrowed from the `fb` module's per-page approach.

#![allow(dead_code)]

extern crate alloc;

use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};

#[cfg(not(target_arch = "aarch64"))]
use spin::RwLock;

#[cfg(target_arch = "aarch64")]
use super::bare_lock::RwLock;
use super::{DirEntry, Metadata, NodeType, Permissions, VfsNode};
use crate::mm::frame_allocator::{self, FrameNumber};
use crate::mm::paging;

const PAGE_SIZE: usize = paging::PAGE_SIZE as usize;

/// A shared memory object: `size` bytes backed by `ceil(size / PAGE_SIZE)`
/// frames, allocated up front and zeroed.
pub struct SharedMem {
    frames: Vec<FrameNumber>,
    size: usize,
}

impl SharedMem {
    fn create(size: usize) -> Option<Arc<Self>> {
        if size == 0 {
            return None;
        }
        let page_count = size.div_ceil(PAGE_SIZE);
        let mut frames = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            let frame = frame_allocator::alloc_block().ok()?;
            // SAFETY: a freshly allocated frame has no other mapping yet.
            unsafe {
                let guard = paging::fixmap_frame(2, frame).ok()?;
                core::ptr::write_bytes(guard.vaddr() as *mut u8, 0, PAGE_SIZE);
            }
            frames.push(frame);
        }
        Some(Arc::new(SharedMem { frames, size }))
    }

    fn frame_for_offset(&self, offset: usize) -> Option<FrameNumber> {
        self.frames.get(offset / PAGE_SIZE).copied()
    }
}

impl Drop for SharedMem {
    fn drop(&mut self) {
        for frame in self.frames.drain(..) {
            frame_allocator::free_block(frame);
        }
    }
}

impl VfsNode for SharedMem {
    fn node_type(&self) -> NodeType {
        NodeType::SharedMemory
    }

    fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
        if offset >= self.size {
            return Ok(0);
        }
        let n = buffer.len().min(self.size - offset);
        let mut done = 0;
        while done < n {
            let page_off = offset + done;
            let Some(frame) = self.frame_for_offset(page_off) else {
                break;
            };
            let in_page = page_off % PAGE_SIZE;
            let chunk = (PAGE_SIZE - in_page).min(n - done);
            // SAFETY: frame is owned by this object for its whole lifetime.
            unsafe {
                let guard = paging::fixmap_frame(2, frame).map_err(|_| "fixmap exhausted")?;
                let src = (guard.vaddr() as usize + in_page) as *const u8;
                core::ptr::copy_nonoverlapping(src, buffer[done..].as_mut_ptr(), chunk);
            }
            done += chunk;
        }
        Ok(done)
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<usize, &'static str> {
        if offset >= self.size {
            return Ok(0);
        }
        let n = data.len().min(self.size - offset);
        let mut done = 0;
        while done < n {
            let page_off = offset + done;
            let Some(frame) = self.frame_for_offset(page_off) else {
                break;
            };
            let in_page = page_off % PAGE_SIZE;
            let chunk = (PAGE_SIZE - in_page).min(n - done);
            // SAFETY: frame is owned by this object for its whole lifetime.
            unsafe {
                let guard = paging::fixmap_frame(2, frame).map_err(|_| "fixmap exhausted")?;
                let dst = (guard.vaddr() as usize + in_page) as *mut u8;
                core::ptr::copy_nonoverlapping(data[done..].as_ptr(), dst, chunk);
            }
            done += chunk;
        }
        Ok(done)
    }

    fn shared_frame(&self, offset: usize) -> Option<FrameNumber> {
        self.frame_for_offset(offset)
    }

    fn metadata(&self) -> Result<Metadata, &'static str> {
        Ok(Metadata {
            node_type: NodeType::SharedMemory,
            size: self.size,
            permissions: Permissions::default(),
            uid: 0,
            gid: 0,
            created: 0,
            modified: 0,
            accessed: 0,
        })
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, &'static str> {
        Err("Not a directory")
    }

    fn lookup(&self, _name: &str) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Not a directory")
    }

    fn create(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create in shared memory")
    }

    fn mkdir(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create in shared memory")
    }

    fn unlink(&self, _name: &str) -> Result<(), &'static str> {
        Err("Cannot unlink from shared memory")
    }

    fn truncate(&self, _size: usize) -> Result<(), &'static str> {
        Err("Cannot truncate an existing shared memory object")
    }
}

/// `shm_create`: an anonymous object with no registry entry, useful
/// only for sharing across a `clone()`d fd table.
pub fn create_anon(size: usize) -> Option<Arc<dyn VfsNode>> {
    SharedMem::create(size).map(|s| s as Arc<dyn VfsNode>)
}

/// Named objects, reachable by any task that knows the name.
static NAMED: RwLock<BTreeMap<String, Arc<SharedMem>>> = RwLock::new(BTreeMap::new());

/// `shm_create_named`: creates (or re-creates) a named object.
pub fn create_named(name: &str, size: usize) -> Option<Arc<dyn VfsNode>> {
    let obj = SharedMem::create(size)?;
    NAMED.write().insert(String::from(name), obj.clone());
    Some(obj as Arc<dyn VfsNode>)
}

/// `shm_open_named`: looks up an existing named object.
pub fn open_named(name: &str) -> Option<Arc<dyn VfsNode>> {
    NAMED.read().get(name).cloned().map(|s| s as Arc<dyn VfsNode>)
}

/// `shm_unlink_named`: removes the name from the registry. Existing
/// mappings and fds keep the object alive (refcounted through `Arc`)
/// until the last one drops, matching POSIX `shm_unlink` semantics.
pub fn unlink_named(name: &str) -> bool {
    NAMED.write().remove(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let obj = create_anon(PAGE_SIZE * 2).unwrap();
        assert_eq!(obj.write(0, b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        let n = obj.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn named_lookup_shares_the_same_object() {
        let created = create_named("frame-buffer", PAGE_SIZE).unwrap();
        created.write(0, b"x").unwrap();
        let opened = open_named("frame-buffer").unwrap();
        let mut buf = [0u8; 1];
        opened.read(0, &mut buf).unwrap();
        assert_eq!(buf[0], b'x');
    }

    #[test]
    fn unlink_does_not_invalidate_existing_handles() {
        let created = create_named("scratch", PAGE_SIZE).unwrap();
        assert!(unlink_named("scratch"));
        assert!(open_named("scratch").is_none());
        assert!(created.write(0, b"still alive").is_ok());
    }
}
