//! Reader/writer lock built from two binary semaphores, per
//! SPEC_FULL.md's synchronisation primitives: a reader-count guard and a
//! writer-exclusion semaphore. The first reader to arrive blocks the
//! writer semaphore on the readers' behalf; the last reader to leave
//! releases it. Writers take the writer semaphore directly.

#![allow(dead_code)]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use super::semaphore::Semaphore;

struct RawRwLock {
    lock: Semaphore,
    write_sem: Semaphore,
    reader_count: AtomicU32,
}

impl RawRwLock {
    const fn new() -> Self {
        RawRwLock {
            lock: Semaphore::new(1),
            write_sem: Semaphore::new(1),
            reader_count: AtomicU32::new(0),
        }
    }

    fn read_lock(&self) {
        self.lock.wait();
        let prev = self.reader_count.fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            self.write_sem.wait();
        }
        self.lock.signal();
    }

    fn read_unlock(&self) {
        self.lock.wait();
        let prev = self.reader_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.write_sem.signal();
        }
        self.lock.signal();
    }

    fn write_lock(&self) {
        self.write_sem.wait();
    }

    fn write_unlock(&self) {
        self.write_sem.signal();
    }
}

pub struct RwLock<T: ?Sized> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

// SAFETY: the two semaphores serialize every path that reaches `data`.
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(data: T) -> Self {
        RwLock {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.raw.read_lock();
        RwLockReadGuard { lock: self }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.raw.write_lock();
        RwLockWriteGuard { lock: self }
    }
}

pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: a read guard exists only while the writer semaphore is
        // held on the readers' behalf, so no writer can be mutating.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.read_unlock();
    }
}

pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: a write guard holds the writer semaphore exclusively.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see Deref.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.write_unlock();
    }
}
