//! In-memory filesystem nodes and their lifecycle.
//!
//! Nodes are owned by their mount's by-ID map and live there even after
//! the last reference drops, so repeated lookups hit the cache instead of
//! the driver. Unreferenced nodes sit on a per-mount unused list and a
//! global LRU list that the low-resource manager trims.
//!
//! There is no per-node lock: every mutable node field is written only
//! while the owning mount's lock is held. The reference count itself is
//! atomic, but transitions touching zero must happen under the mount lock
//! (that is what keeps a node from being destroyed between a map lookup
//! and the reference bump).

use crate::fatal;
use crate::fs::mount::{self, MountId};
use crate::klib::error::{Result, Status};
use crate::lrm::Pressure;
use crate::mm::PageObject;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    File = 0,
    Directory = 1,
    Symlink = 2,
    Other = 3,
}

/// Metadata returned by `fs_info` and `fs_handle_info`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct NodeInfo {
    pub id: NodeId,
    pub mount: MountId,
    pub ntype: NodeType,
    pub size: u64,
    pub links: u32,
    pub block_size: u32,
}

/// One directory entry, after mount patching.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub id: NodeId,
    pub mount: MountId,
    pub name: String,
}

/// Per-node driver callbacks.
///
/// A driver implements what its filesystem supports; every default
/// surfaces `NotSupported`, which the public operations pass through.
#[allow(unused_variables)]
pub trait NodeOps: Send + Sync {
    /// Resolve a name within a directory to a node ID.
    fn lookup_entry(&self, node: &Node, name: &str) -> Result<NodeId> {
        Err(Status::NotSupported)
    }

    /// Entry at `index`, driver-raw (no mount patching). Past-the-end
    /// reads return `NotFound`.
    fn read_entry(&self, node: &Node, index: u64) -> Result<(NodeId, String)> {
        Err(Status::NotSupported)
    }

    /// Total number of entries, for directory END seeks.
    fn entry_count(&self, node: &Node) -> Result<u64> {
        Err(Status::NotSupported)
    }

    /// Create an entry under `parent`. Returns the new node carrying one
    /// reference. `target` is the destination for symlinks.
    fn create(
        &self,
        parent: &Node,
        name: &str,
        ntype: NodeType,
        target: Option<&str>,
    ) -> Result<Arc<Node>> {
        Err(Status::NotSupported)
    }

    /// Remove the entry `name` from `parent`. The driver marks the node
    /// removed once its link count reaches zero.
    fn unlink(&self, parent: &Node, name: &str, node: &Node) -> Result<()> {
        Err(Status::NotSupported)
    }

    fn read(&self, node: &Node, buf: &mut [u8], offset: u64, nonblock: bool) -> Result<usize> {
        Err(Status::NotSupported)
    }

    fn write(&self, node: &Node, buf: &[u8], offset: u64, nonblock: bool) -> Result<usize> {
        Err(Status::NotSupported)
    }

    fn resize(&self, node: &Node, size: u64) -> Result<()> {
        Err(Status::NotSupported)
    }

    /// Destination string of a symbolic link.
    fn read_link(&self, node: &Node) -> Result<String> {
        Err(Status::NotSupported)
    }

    /// Write cached state back to the backing store.
    fn flush(&self, node: &Node) -> Result<()> {
        Ok(())
    }

    /// Release driver state when the node leaves the cache. Persistent
    /// storage survives this; only removed nodes lose their data.
    fn free(&self, node: &Node) -> Result<()> {
        Ok(())
    }

    /// Cached data object used for memory mapping.
    fn get_cache(&self, node: &Node) -> Result<Arc<dyn PageObject>> {
        Err(Status::NotSupported)
    }

    /// Fill driver-known fields of `info` (size, links, block size).
    fn info(&self, node: &Node, info: &mut NodeInfo) {}
}

pub struct Node {
    id: NodeId,
    ntype: NodeType,
    /// References held by callers and by the mount itself. Zero means the
    /// node is cached but unused.
    refs: AtomicU32,
    /// Set once the link count hits zero; the node is destroyed instead
    /// of cached when its last reference drops.
    removed: AtomicBool,
    /// Owning mount, or `None` for a standalone memory node.
    mount: Option<MountId>,
    /// Mount whose root shadows this node; 0 when not a mountpoint.
    mounted: AtomicU16,
    /// Key into the unused lists while the node rests there, else 0.
    lru_stamp: AtomicU64,
    pub(crate) ops: Arc<dyn NodeOps>,
    private: Option<Box<dyn Any + Send + Sync>>,
}

impl Node {
    pub fn new(
        mount: Option<MountId>,
        id: NodeId,
        ntype: NodeType,
        ops: Arc<dyn NodeOps>,
        private: Option<Box<dyn Any + Send + Sync>>,
    ) -> Arc<Node> {
        Arc::new(Node {
            id,
            ntype,
            refs: AtomicU32::new(1),
            removed: AtomicBool::new(false),
            mount,
            mounted: AtomicU16::new(0),
            lru_stamp: AtomicU64::new(0),
            ops,
            private,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.ntype
    }

    pub fn is_dir(&self) -> bool {
        self.ntype == NodeType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.ntype == NodeType::Symlink
    }

    pub fn mount_id(&self) -> Option<MountId> {
        self.mount
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Driver side: flag the node as having no remaining links.
    pub fn set_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Mount shadowing this node, if any.
    pub fn mounted_id(&self) -> Option<MountId> {
        match self.mounted.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_mounted(&self, id: MountId) {
        self.mounted.store(id, Ordering::Release);
    }

    /// Raw count adjustments for paths that already hold the mount lock
    /// (lookup splices, unmount teardown).
    pub(crate) fn ref_inc(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn ref_sub(&self, n: u32) {
        self.refs.fetch_sub(n, Ordering::AcqRel);
    }

    pub(crate) fn lru_stamp(&self) -> u64 {
        self.lru_stamp.load(Ordering::Acquire)
    }

    pub(crate) fn set_lru_stamp(&self, stamp: u64) {
        self.lru_stamp.store(stamp, Ordering::Release);
    }

    /// Driver-private state downcast.
    pub fn private<T: 'static>(&self) -> Option<&T> {
        self.private.as_ref()?.downcast_ref::<T>()
    }

    pub fn info(&self) -> NodeInfo {
        let mut info = NodeInfo {
            id: self.id,
            mount: self.mount.unwrap_or(0),
            ntype: self.ntype,
            size: 0,
            links: 0,
            block_size: crate::config::PAGE_SIZE as u32,
        };
        self.ops.info(self, &mut info);
        info
    }
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("type", &self.ntype)
            .field("mount", &self.mount)
            .field("refs", &self.refs())
            .finish()
    }
}

// ---------------------------------------------------------------------
// Reference counting
// ---------------------------------------------------------------------

/// An owned reference to a node. Dropping it releases the reference and,
/// at zero, parks or destroys the node. Every exit path of the lookup and
/// handle machinery cleans up through this type.
#[derive(Debug)]
pub struct NodeRef {
    node: Arc<Node>,
}

impl NodeRef {
    /// Wrap a reference the caller already owns (a node fresh from a
    /// driver, or one whose count was bumped under the mount lock).
    pub(crate) fn adopt(node: Arc<Node>) -> NodeRef {
        NodeRef { node }
    }

    /// Take an additional reference on an already-referenced node.
    pub fn from_get(node: &Arc<Node>) -> NodeRef {
        node_get(node);
        NodeRef { node: node.clone() }
    }

    pub fn inner(&self) -> &Arc<Node> {
        &self.node
    }

    /// Surrender the wrapper without releasing; the caller now owns one
    /// manual reference.
    pub(crate) fn into_raw(self) -> Arc<Node> {
        let node = self.node.clone();
        core::mem::forget(self);
        node
    }

    pub fn same_node(&self, other: &NodeRef) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        NodeRef::from_get(&self.node)
    }
}

impl core::ops::Deref for NodeRef {
    type Target = Node;
    fn deref(&self) -> &Node {
        &self.node
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        release_ref(&self.node);
    }
}

/// Bump the reference count of a node that is already referenced.
/// Zero-to-one transitions must go through the mount-locked lookup path;
/// seeing zero here is a lifecycle bug.
pub fn node_get(node: &Arc<Node>) {
    let prev = node.refs.fetch_add(1, Ordering::AcqRel);
    if prev == 0 {
        fatal!("node {}: reference from zero outside the mount lock", node.id);
    }
}

/// Release one reference, parking or destroying the node at zero.
pub(crate) fn release_ref(node: &Arc<Node>) {
    let Some(mid) = node.mount else {
        // Standalone memory node: destroy on last release.
        let prev = node.refs.fetch_sub(1, Ordering::AcqRel);
        match prev {
            0 => fatal!("node {}: reference count underflow", node.id),
            1 => {
                let _ = node.ops.flush(node);
                let _ = node.ops.free(node);
            }
            _ => {}
        }
        return;
    };

    let Some(mount) = mount::mount_by_id(mid) else {
        // The mount is tearing down; it owns the cleanup.
        node.refs.fetch_sub(1, Ordering::AcqRel);
        return;
    };

    let mut inner = mount.inner.lock();
    let prev = node.refs.fetch_sub(1, Ordering::AcqRel);
    match prev {
        0 => fatal!("node {}: reference count underflow", node.id),
        1 => {
            if node.is_removed() || !inner.nodes.contains_key(&node.id) {
                if let Err(status) = free_locked(&mut inner, node) {
                    log::error!("node {}: free failed: {}", node.id, status.description());
                }
            } else {
                // Park on the unused lists, newest at the tail.
                let stamp = next_lru_stamp();
                node.set_lru_stamp(stamp);
                inner.used.remove(&node.id);
                inner.unused.insert(stamp, node.id);
                UNUSED_LRU.lock().insert(stamp, (mid, node.id));
            }
        }
        _ => {}
    }
}

/// Flush and free a node, dropping it from its mount's maps. Caller holds
/// the mount lock. On failure the node is left exactly where it was.
pub(crate) fn free_locked(inner: &mut mount::MountInner, node: &Arc<Node>) -> Result<()> {
    node.ops.flush(node)?;
    node.ops.free(node)?;
    inner.nodes.remove(&node.id);
    inner.used.remove(&node.id);
    let stamp = node.lru_stamp();
    if stamp != 0 {
        inner.unused.remove(&stamp);
        UNUSED_LRU.lock().remove(&stamp);
        node.set_lru_stamp(0);
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Unused-node LRU and reclaim
// ---------------------------------------------------------------------

static LRU_STAMP: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_lru_stamp() -> u64 {
    LRU_STAMP.fetch_add(1, Ordering::AcqRel)
}

lazy_static! {
    /// All unused nodes, oldest stamp first. Never held across a mount
    /// lock acquisition: mount locks order before this one.
    pub(crate) static ref UNUSED_LRU: Mutex<BTreeMap<u64, (MountId, NodeId)>> =
        Mutex::new(BTreeMap::new());
}

pub fn unused_count() -> usize {
    UNUSED_LRU.lock().len()
}

/// Low-resource hook: evict unused nodes, oldest first. Advisory pressure
/// trims about 2%, low about 10%, critical everything.
pub fn reclaim(level: Pressure) {
    let total = unused_count();
    let target = match level {
        Pressure::Advisory => (total + 49) / 50,
        Pressure::Low => (total + 9) / 10,
        Pressure::Critical => total,
    };

    for _ in 0..target {
        // Pop the LRU head, then release the list before touching any
        // mount lock.
        let Some((stamp, (mid, nid))) = UNUSED_LRU.lock().pop_first() else {
            break;
        };
        let Some(mount) = mount::mount_by_id(mid) else {
            continue;
        };
        let mut inner = mount.inner.lock();
        let Some(node) = inner.nodes.get(&nid).cloned() else {
            continue;
        };
        // Re-check under the mount lock: the node may have been looked up
        // again while we were off the list.
        if node.refs() != 0 || node.lru_stamp() != stamp {
            continue;
        }
        inner.unused.remove(&stamp);
        if let Err(status) = free_and_requeue(&mut inner, &node, mid) {
            log::warn!(
                "node {}: reclaim flush failed, requeued: {}",
                nid,
                status.description()
            );
        }
    }
}

fn free_and_requeue(
    inner: &mut mount::MountInner,
    node: &Arc<Node>,
    mid: MountId,
) -> Result<()> {
    node.set_lru_stamp(0);
    match free_locked(inner, node) {
        Ok(()) => Ok(()),
        Err(status) => {
            // Unflushable: park it at the tail so the sweep cannot spin
            // on the same node.
            let stamp = next_lru_stamp();
            node.set_lru_stamp(stamp);
            inner.unused.insert(stamp, node.id());
            UNUSED_LRU.lock().insert(stamp, (mid, node.id()));
            Err(status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_info_defaults() {
        struct NoOps;
        impl NodeOps for NoOps {}
        let node = Node::new(None, 7, NodeType::File, Arc::new(NoOps), None);
        let info = node.info();
        assert_eq!(info.id, 7);
        assert_eq!(info.ntype, NodeType::File);
        assert_eq!(info.block_size, crate::config::PAGE_SIZE as u32);
        // Unimplemented callbacks surface NotSupported.
        assert_eq!(
            node.ops.lookup_entry(&node, "x").unwrap_err(),
            Status::NotSupported
        );
        // Balance the initial reference; standalone nodes free directly.
        let r = NodeRef::adopt(node);
        drop(r);
    }

    #[test]
    #[should_panic(expected = "reference from zero")]
    fn get_from_zero_aborts() {
        struct NoOps;
        impl NodeOps for NoOps {}
        let node = Node::new(None, 8, NodeType::File, Arc::new(NoOps), None);
        node.refs.store(0, Ordering::Release);
        node_get(&node);
    }
}
