//! Named IPC listeners.
//!
//! `ipc_listen(name)` registers a listener under `name`; `ipc_connect(name)`
//! enqueues a pending request and blocks until a matching `ipc_accept`
//! pairs it up. Each side of a paired connection gets a full-duplex
//! channel built from two pipe pairs crossed over -- the connector's
//! input reader is the acceptor's output writer's pipe, and vice versa
//! -- the same full-duplex-from-two-half-duplex-pipes construction
//! `fs::pty` uses for its master/slave queues, generalized here to two
//! independent peers instead of one line-discipline object shared by
//! both ends.

#![allow(dead_code)]

extern crate alloc;

use alloc::{collections::BTreeMap, string::String, sync::Arc};

use crate::fs::{pipe, DirEntry, Metadata, NodeType, Permissions, VfsNode};
use crate::sync::{
    poll_waitq::{PollWaitq, PollWaiter},
    spinlock::Spinlock,
};

/// One accepted connection's two ends, handed to `ipc_connect`'s and
/// `ipc_accept`'s caller respectively.
pub struct Channel {
    pub reader: Arc<dyn VfsNode>,
    pub writer: Arc<dyn VfsNode>,
}

struct PendingRequest {
    /// The connector's channel, stashed here until `ipc_accept` claims
    /// it and hands back the acceptor's matching half.
    connector_channel: Channel,
    acceptor_channel: Channel,
    claimed: bool,
}

struct Listener {
    backlog: Spinlock<alloc::collections::VecDeque<Arc<Spinlock<PendingRequest>>>>,
    waitq: PollWaitq,
}

static LISTENERS: Spinlock<BTreeMap<String, Arc<Listener>>> = Spinlock::new(BTreeMap::new());

/// Registers a new named listener. Fails if the name is already taken.
pub fn ipc_listen(name: &str) -> Result<(), &'static str> {
    let mut table = LISTENERS.lock();
    if table.contains_key(name) {
        return Err("Address already in use");
    }
    table.insert(
        String::from(name),
        Arc::new(Listener {
            backlog: Spinlock::new(alloc::collections::VecDeque::new()),
            waitq: PollWaitq::new(),
        }),
    );
    Ok(())
}

/// Removes a listener, waking anyone blocked in `ipc_accept` on it so
/// they observe the closure rather than hanging.
pub fn ipc_close(name: &str) {
    if let Some(listener) = LISTENERS.lock().remove(name) {
        listener.waitq.detach_all();
    }
}

fn crossed_channels() -> (Channel, Channel) {
    let (r_a, w_a) = pipe::create_pipe();
    let (r_b, w_b) = pipe::create_pipe();
    (
        Channel { reader: r_a, writer: w_b },
        Channel { reader: r_b, writer: w_a },
    )
}

/// Enqueues a connection request on `name`'s listener and blocks until
/// `ipc_accept` pairs it, then returns this side's full-duplex channel.
pub fn ipc_connect(name: &str) -> Result<Channel, &'static str> {
    let listener = LISTENERS
        .lock()
        .get(name)
        .cloned()
        .ok_or("No such listener")?;

    let (connector_channel, acceptor_channel) = crossed_channels();
    let request = Arc::new(Spinlock::new(PendingRequest {
        connector_channel,
        acceptor_channel,
        claimed: false,
    }));
    listener.backlog.lock().push_back(request.clone());
    listener.waitq.wake_all();

    let mut waiter = PollWaiter::default();
    while !request.lock().claimed {
        listener.waitq.register(&mut waiter, crate::sched::current_task_id());
        if !request.lock().claimed {
            crate::sched::block_current();
        }
        listener.waitq.unregister(&mut waiter);
    }

    let mut req = request.lock();
    Ok(Channel {
        reader: req.connector_channel.reader.clone(),
        writer: req.connector_channel.writer.clone(),
    })
}

/// Blocks until a pending connection exists on `name`'s listener, pairs
/// with the oldest one, and returns this side's full-duplex channel.
pub fn ipc_accept(name: &str) -> Result<Channel, &'static str> {
    let listener = LISTENERS
        .lock()
        .get(name)
        .cloned()
        .ok_or("No such listener")?;

    let mut waiter = PollWaiter::default();
    let request = loop {
        if let Some(req) = listener.backlog.lock().pop_front() {
            break req;
        }
        listener.waitq.register(&mut waiter, crate::sched::current_task_id());
        if let Some(req) = listener.backlog.lock().pop_front() {
            listener.waitq.unregister(&mut waiter);
            break req;
        }
        crate::sched::block_current();
        listener.waitq.unregister(&mut waiter);
    };

    let mut req = request.lock();
    let channel = Channel {
        reader: req.acceptor_channel.reader.clone(),
        writer: req.acceptor_channel.writer.clone(),
    };
    req.claimed = true;
    drop(req);
    listener.waitq.wake_all();
    Ok(channel)
}

/// An fd-table entry for a registered listener, so `sys_ipc_listen` can
/// hand the caller an ordinary fd and `sys_ipc_accept` can recover the
/// name from it instead of needing its own side table.
pub struct ListenerHandle {
    name: String,
}

/// Registers `name` and returns an fd-installable node for it.
pub fn listen_handle(name: &str) -> Result<Arc<dyn VfsNode>, &'static str> {
    ipc_listen(name)?;
    Ok(Arc::new(ListenerHandle { name: String::from(name) }))
}

impl VfsNode for ListenerHandle {
    fn node_type(&self) -> NodeType {
        NodeType::Socket
    }

    fn read(&self, _offset: usize, _buffer: &mut [u8]) -> Result<usize, &'static str> {
        Err("Cannot read from a listener")
    }

    fn write(&self, _offset: usize, _data: &[u8]) -> Result<usize, &'static str> {
        Err("Cannot write to a listener")
    }

    fn metadata(&self) -> Result<Metadata, &'static str> {
        Ok(Metadata {
            node_type: NodeType::Socket,
            size: 0,
            permissions: Permissions::default(),
            uid: 0,
            gid: 0,
            created: 0,
            modified: 0,
            accessed: 0,
        })
    }

    fn readdir(&self) -> Result<alloc::vec::Vec<DirEntry>, &'static str> {
        Err("Not a directory")
    }

    fn lookup(&self, _name: &str) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Not a directory")
    }

    fn create(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create on a listener")
    }

    fn mkdir(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create on a listener")
    }

    fn unlink(&self, _name: &str) -> Result<(), &'static str> {
        Err("Cannot unlink a listener")
    }

    fn truncate(&self, _size: usize) -> Result<(), &'static str> {
        Err("Cannot truncate a listener")
    }

    fn listener_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        ipc_close(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_rejects_duplicate_name() {
        ipc_listen("test-dup").unwrap();
        assert!(ipc_listen("test-dup").is_err());
        ipc_close("test-dup");
    }

    #[test]
    fn connect_without_listener_fails() {
        assert!(ipc_connect("no-such-listener").is_err());
    }
}
