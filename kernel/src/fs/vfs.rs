//! Thin `KernelResult` boundary over the global [`super::Vfs`] singleton.
//!
//! The VFS core's trait methods all return `Result<_, &'static str>`, a
//! convention kept as-is rather than rewritten (see
//! `KernelError::LegacyError`). Code outside `fs/` that wants to compose
//! a lookup into a `KernelResult`-returning chain with `?` goes through
//! [`resolve`] instead of calling `get_vfs()` directly.

extern crate alloc;

use alloc::sync::Arc;

use crate::error::KernelResult;

use super::{get_vfs, VfsNode};

/// Resolve an absolute or cwd-relative path to its node.
pub fn resolve(path: &str) -> KernelResult<Arc<dyn VfsNode>> {
    Ok(get_vfs().read().resolve_path(path)?)
}

/// Resolve `/dev/<name>` style paths straight to the devfs registry,
/// bypassing a full path walk. Falls back to [`resolve`] for anything
/// not under `/dev`.
pub fn open(path: &str) -> KernelResult<Arc<dyn VfsNode>> {
    if let Some(name) = path.strip_prefix("/dev/") {
        if let Some(node) = super::devfs::fetch(name) {
            return Ok(node);
        }
    }
    resolve(path)
}
