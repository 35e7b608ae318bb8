//! Device Filesystem (/dev)
//!
//! Backed by a single global name -> node registry. The mounted `/dev`
//! directory ([`DevRoot`]) and the free functions below ([`register`],
//! [`fetch`], [`take`]) both read and write the same map, so a driver
//! registering a device is immediately visible both through path lookup
//! (`open("/dev/kbd")`) and through direct kernel-internal access
//! (`devfs::fetch("kbd")`) without the two views drifting apart.

use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};

#[cfg(not(target_arch = "aarch64"))]
use spin::RwLock;

#[cfg(target_arch = "aarch64")]
use super::bare_lock::RwLock;
use super::{DirEntry, Filesystem, Metadata, NodeType, Permissions, VfsNode};

/// Built-in device node backing the always-present `/dev/{null,zero,random,urandom,console,tty0}`
/// entries. Anything else (pipes, PTYs, `/dev/kmsg`, `/dev/kbd`, the framebuffer) is registered
/// by its owning subsystem via [`register`] instead of living here.
struct DevNode {
    name: String,
    node_type: NodeType,
    _major: u32,
    _minor: u32,
    permissions: Permissions,
}

impl DevNode {
    fn new_char(name: String, major: u32, minor: u32) -> Self {
        Self {
            name,
            node_type: NodeType::CharDevice,
            _major: major,
            _minor: minor,
            permissions: Permissions::default(),
        }
    }
}

impl VfsNode for DevNode {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn read(&self, _offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
        match self.name.as_str() {
            "null" => Ok(0),
            "zero" => {
                buffer.fill(0);
                Ok(buffer.len())
            }
            "random" | "urandom" => {
                for byte in buffer.iter_mut() {
                    *byte = (crate::read_timestamp() & 0xFF) as u8;
                }
                Ok(buffer.len())
            }
            _ => Err("Device not implemented"),
        }
    }

    fn write(&self, _offset: usize, data: &[u8]) -> Result<usize, &'static str> {
        match self.name.as_str() {
            "null" => Ok(data.len()),
            "console" | "tty0" => {
                for &byte in data {
                    crate::print!("{}", byte as char);
                }
                Ok(data.len())
            }
            _ => Err("Device not implemented"),
        }
    }

    fn metadata(&self) -> Result<Metadata, &'static str> {
        Ok(Metadata {
            node_type: self.node_type,
            size: 0,
            permissions: self.permissions,
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

    fn create(
        &self,
        _name: &str,
        _permissions: Permissions,
    ) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create files in device")
    }

    fn mkdir(
        &self,
        _name: &str,
        _permissions: Permissions,
    ) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create directories in device")
    }

    fn unlink(&self, _name: &str) -> Result<(), &'static str> {
        Err("Cannot unlink device")
    }

    fn truncate(&self, _size: usize) -> Result<(), &'static str> {
        Err("Cannot truncate device")
    }
}

/// `/dev/kmsg`: a text snapshot of the structured log ring buffer,
/// formatted as `[seq][level][subsystem] message\n` lines. Read-only;
/// `offset` slices into the current snapshot rather than tracking a
/// consumer cursor, so two readers at different offsets both see a
/// consistent (if possibly just-appended-to) view.
struct KmsgNode;

impl KmsgNode {
    fn render(&self) -> String {
        use core::fmt::Write;
        let mut out = String::new();
        let mut seq = 0u64;
        let _ = crate::log_service::log_drain(|entry| {
            let level = match entry.level {
                crate::log_service::LogLevel::Error => "ERROR",
                crate::log_service::LogLevel::Warn => "WARN",
                crate::log_service::LogLevel::Info => "INFO",
                crate::log_service::LogLevel::Debug => "DEBUG",
                crate::log_service::LogLevel::Trace => "TRACE",
            };
            let _ = writeln!(out, "[{}][{}][{}] {}", seq, level, entry.subsystem(), entry.message());
            seq += 1;
        });
        out
    }
}

impl VfsNode for KmsgNode {
    fn node_type(&self) -> NodeType {
        NodeType::CharDevice
    }

    fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
        let text = self.render();
        let bytes = text.as_bytes();
        if offset >= bytes.len() {
            return Ok(0);
        }
        let n = (bytes.len() - offset).min(buffer.len());
        buffer[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, _offset: usize, _data: &[u8]) -> Result<usize, &'static str> {
        Err("kmsg is read-only")
    }

    fn metadata(&self) -> Result<Metadata, &'static str> {
        Ok(Metadata {
            node_type: NodeType::CharDevice,
            size: 0,
            permissions: Permissions::read_only(),
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

    fn create(&self, _name: &str, _permissions: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create files in device")
    }

    fn mkdir(&self, _name: &str, _permissions: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create directories in device")
    }

    fn unlink(&self, _name: &str) -> Result<(), &'static str> {
        Err("Cannot unlink device")
    }

    fn truncate(&self, _size: usize) -> Result<(), &'static str> {
        Err("Cannot truncate device")
    }
}

/// `/dev/kbd`: non-blocking single-byte reads off the keyboard driver's
/// decoded-key ring buffer. `kbd_try_read` is the only consumer, so
/// `read` always returns either 0 or 1 byte regardless of `buffer.len()`.
struct KbdNode;

impl VfsNode for KbdNode {
    fn node_type(&self) -> NodeType {
        NodeType::CharDevice
    }

    fn read(&self, _offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
        if buffer.is_empty() {
            return Ok(0);
        }
        match crate::drivers::keyboard::read_key() {
            Some(byte) => {
                buffer[0] = byte;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn write(&self, _offset: usize, _data: &[u8]) -> Result<usize, &'static str> {
        Err("kbd is read-only")
    }

    fn metadata(&self) -> Result<Metadata, &'static str> {
        Ok(Metadata {
            node_type: NodeType::CharDevice,
            size: 0,
            permissions: Permissions::read_only(),
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

    fn create(&self, _name: &str, _permissions: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create files in device")
    }

    fn mkdir(&self, _name: &str, _permissions: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create directories in device")
    }

    fn unlink(&self, _name: &str) -> Result<(), &'static str> {
        Err("Cannot unlink device")
    }

    fn truncate(&self, _size: usize) -> Result<(), &'static str> {
        Err("Cannot truncate device")
    }
}

/// The single source of truth for every `/dev` entry, ambient and driver-registered alike.
static DEVICES: RwLock<BTreeMap<String, Arc<dyn VfsNode>>> = RwLock::new(BTreeMap::new());

fn install_ambient_devices() {
    let ambient: [(&str, u32, u32); 6] = [
        ("null", 1, 3),
        ("zero", 1, 5),
        ("random", 1, 8),
        ("urandom", 1, 9),
        ("console", 5, 1),
        ("tty0", 4, 0),
    ];
    let mut devices = DEVICES.write();
    for (name, major, minor) in ambient {
        devices
            .entry(String::from(name))
            .or_insert_with(|| Arc::new(DevNode::new_char(String::from(name), major, minor)));
    }
    devices
        .entry(String::from("kmsg"))
        .or_insert_with(|| Arc::new(KmsgNode) as Arc<dyn VfsNode>);
    devices
        .entry(String::from("kbd"))
        .or_insert_with(|| Arc::new(KbdNode) as Arc<dyn VfsNode>);
}

/// Register a device node under `/dev/<name>`, replacing any prior entry of the same name.
pub fn register(name: &str, node: Arc<dyn VfsNode>) {
    DEVICES.write().insert(String::from(name), node);
}

/// Borrow a device node by name without removing it from the registry.
pub fn fetch(name: &str) -> Option<Arc<dyn VfsNode>> {
    DEVICES.read().get(name).cloned()
}

/// Atomically remove and return a device node, e.g. when a PTY slave/master pair is torn down.
pub fn take(name: &str) -> Option<Arc<dyn VfsNode>> {
    DEVICES.write().remove(name)
}

/// The canonical `/dev/null` node, handed out to callers (stdio defaults, discarded fds)
/// that need a sink/source without going through a path lookup.
pub fn null_node() -> Arc<dyn VfsNode> {
    fetch("null").expect("devfs: /dev/null missing from registry")
}

/// Device filesystem root directory; a thin directory view over [`DEVICES`].
struct DevRoot;

impl VfsNode for DevRoot {
    fn node_type(&self) -> NodeType {
        NodeType::Directory
    }

    fn read(&self, _offset: usize, _buffer: &mut [u8]) -> Result<usize, &'static str> {
        Err("Cannot read directory")
    }

    fn write(&self, _offset: usize, _data: &[u8]) -> Result<usize, &'static str> {
        Err("Cannot write to directory")
    }

    fn metadata(&self) -> Result<Metadata, &'static str> {
        Ok(Metadata {
            node_type: NodeType::Directory,
            size: 0,
            permissions: Permissions::default(),
            uid: 0,
            gid: 0,
            created: 0,
            modified: 0,
            accessed: 0,
        })
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, &'static str> {
        let devices = DEVICES.read();
        let mut entries = alloc::vec![
            DirEntry { name: String::from("."), node_type: NodeType::Directory, inode: 0 },
            DirEntry { name: String::from(".."), node_type: NodeType::Directory, inode: 0 },
        ];
        for (name, device) in devices.iter() {
            entries.push(DirEntry {
                name: name.clone(),
                node_type: device.node_type(),
                inode: 0,
            });
        }
        Ok(entries)
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>, &'static str> {
        fetch(name).ok_or("Device not found")
    }

    fn create(
        &self,
        _name: &str,
        _permissions: Permissions,
    ) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create files in /dev")
    }

    fn mkdir(
        &self,
        _name: &str,
        _permissions: Permissions,
    ) -> Result<Arc<dyn VfsNode>, &'static str> {
        Err("Cannot create directories in /dev")
    }

    fn unlink(&self, _name: &str) -> Result<(), &'static str> {
        Err("Cannot unlink from /dev")
    }

    fn truncate(&self, _size: usize) -> Result<(), &'static str> {
        Err("Cannot truncate directory")
    }
}

/// Device filesystem
pub struct DevFs {
    root: Arc<DevRoot>,
}

impl DevFs {
    pub fn new() -> Self {
        install_ambient_devices();
        Self {
            root: Arc::new(DevRoot),
        }
    }
}

impl Default for DevFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for DevFs {
    fn root(&self) -> Arc<dyn VfsNode> {
        self.root.clone() as Arc<dyn VfsNode>
    }

    fn name(&self) -> &str {
        "devfs"
    }

    fn is_readonly(&self) -> bool {
        false
    }

    fn sync(&self) -> Result<(), &'static str> {
        Ok(())
    }
}
