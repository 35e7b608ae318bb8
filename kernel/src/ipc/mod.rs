//! Inter-process communication: named listener channels and futexes.
//!
//! [`listener`] implements `ipc_listen`/`ipc_connect`/`ipc_accept`,
//! pairing two tasks into a full-duplex channel built from crossed pipe
//! pairs. [`futex`] implements `futex_wait`/`futex_wake` keyed by
//! physical address. These are what the syscall dispatch table calls.

pub mod futex;
pub mod listener;
