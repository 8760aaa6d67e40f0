//! Per-process I/O context.
//!
//! Holds the root and current directories and the open-handle table. The
//! directory pair sits under a readers-writer lock that path lookup holds
//! shared for its whole run, so a concurrent `setroot` cannot pull the
//! root out from under a resolution in progress.
//!
//! The process layer proper is outside this crate; `current()` returns
//! the kernel context until a scheduler hook is installed.

use crate::config::HANDLE_MAX;
use crate::fs::file::FileHandle;
use crate::fs::node::{Node, NodeRef};
use crate::klib::error::{Result, Status};
use crate::util::id_alloc::IdAllocator;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use bitflags::bitflags;
use lazy_static::lazy_static;
use spin::{Mutex, RwLock};

pub type HandleId = u32;

bitflags! {
    /// Rights a context holds over privileged filesystem operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capability: u32 {
        const MOUNT = 1 << 0;
        const SETROOT = 1 << 1;
    }
}

pub(crate) struct Dirs {
    pub root: Option<NodeRef>,
    pub cwd: Option<NodeRef>,
}

struct HandleTable {
    ids: IdAllocator,
    map: BTreeMap<HandleId, Arc<FileHandle>>,
}

pub struct IoContext {
    dirs: RwLock<Dirs>,
    handles: Mutex<HandleTable>,
    caps: Capability,
}

impl IoContext {
    pub fn new(caps: Capability) -> Arc<IoContext> {
        Arc::new(IoContext {
            dirs: RwLock::new(Dirs {
                root: None,
                cwd: None,
            }),
            handles: Mutex::new(HandleTable {
                ids: IdAllocator::new(HANDLE_MAX),
                map: BTreeMap::new(),
            }),
            caps,
        })
    }

    pub fn has_cap(&self, cap: Capability) -> bool {
        self.caps.contains(cap)
    }

    pub(crate) fn dirs(&self) -> &RwLock<Dirs> {
        &self.dirs
    }

    /// Point the context at a fresh namespace root. Takes one reference
    /// each for the root and cwd slots.
    pub(crate) fn seed(&self, root: &Arc<Node>) {
        let mut dirs = self.dirs.write();
        dirs.root = Some(NodeRef::from_get(root));
        dirs.cwd = Some(NodeRef::from_get(root));
    }

    pub fn set_cwd(&self, node: NodeRef) {
        self.dirs.write().cwd = Some(node);
    }

    pub fn set_root(&self, node: NodeRef) {
        self.dirs.write().root = Some(node);
    }

    pub fn install_handle(&self, handle: Arc<FileHandle>) -> Result<HandleId> {
        let mut table = self.handles.lock();
        let id = table.ids.alloc().ok_or(Status::NoMemory)?;
        table.map.insert(id, handle);
        Ok(id)
    }

    pub fn get_handle(&self, id: HandleId) -> Result<Arc<FileHandle>> {
        self.handles
            .lock()
            .map
            .get(&id)
            .cloned()
            .ok_or(Status::InvalidHandle)
    }

    pub fn close_handle(&self, id: HandleId) -> Result<()> {
        let handle = {
            let mut table = self.handles.lock();
            let handle = table.map.remove(&id).ok_or(Status::InvalidHandle)?;
            table.ids.free(id);
            handle
        };
        // The node reference drops outside the table lock; releasing it
        // takes the owning mount's lock.
        drop(handle);
        Ok(())
    }

    pub fn open_handles(&self) -> usize {
        self.handles.lock().map.len()
    }
}

lazy_static! {
    static ref KERNEL_CONTEXT: Arc<IoContext> = IoContext::new(Capability::all());
}

/// The kernel process' context.
pub fn kernel() -> &'static Arc<IoContext> {
    &KERNEL_CONTEXT
}

/// Context of the calling thread. Scheduler integration replaces this
/// with a per-process lookup; until then everything acts as the kernel.
pub fn current() -> Arc<IoContext> {
    KERNEL_CONTEXT.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_table_ids_recycle() {
        let ctx = IoContext::new(Capability::empty());
        assert!(!ctx.has_cap(Capability::MOUNT));
        assert_eq!(ctx.get_handle(0).unwrap_err(), Status::InvalidHandle);
        assert_eq!(ctx.close_handle(3).unwrap_err(), Status::InvalidHandle);
        assert_eq!(ctx.open_handles(), 0);
    }
}
