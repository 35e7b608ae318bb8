//! Synchronization Primitives
//!
//! Safe synchronization and global state management, plus the IRQ-safe
//! locking and blocking primitives everything above `mm` is built from:
//! a spinlock with EFLAGS save/restore, a semaphore and rwlock built on
//! top of it, and the poll wait queues `fs` and `ipc` block on.

pub mod once_lock;
pub mod poll_waitq;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;

pub use once_lock::{GlobalState, LazyLock, OnceLock};
pub use poll_waitq::{PollWaitq, PollWaiter};
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
pub use spinlock::{Spinlock, without_interrupts};
