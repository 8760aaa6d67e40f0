//! Filesystem type registry and mount tree.
//!
//! Lock order: the global mount registry, then per-mount locks, parent
//! before child when two are held. The registry lock pins the tree shape;
//! a mount's own lock guards its node map and lists.

use crate::fs::context::{self, Capability};
use crate::fs::node::{self, Node, NodeId, NodeOps, NodeType};
use crate::fs::NodeRef;
use crate::fs::{self};
use crate::klib::error::{Result, Status};
use crate::util::id_alloc::IdAllocator;
use crate::{fatal, kinfo};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::any::Any;
use core::sync::atomic::{AtomicU32, Ordering};
use lazy_static::lazy_static;
use spin::{Mutex, Once};

pub type MountId = u16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const RDONLY = 1 << 0;
    }
}

/// One `name[=value]` pair from a mount option string, after the keys
/// this layer consumes have been stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOption {
    pub name: String,
    pub value: Option<String>,
}

/// Parse a comma-separated option string. Empty tokens are dropped; `ro`
/// is consumed here, everything else is forwarded to the driver.
pub fn parse_options(input: &str) -> (MountFlags, Vec<MountOption>) {
    let mut flags = MountFlags::empty();
    let mut options = Vec::new();
    for token in input.split(',') {
        if token.is_empty() {
            continue;
        }
        let (name, value) = match token.split_once('=') {
            Some((n, v)) => (n, Some(String::from(v))),
            None => (token, None),
        };
        match name {
            "ro" => flags |= MountFlags::RDONLY,
            _ => options.push(MountOption {
                name: String::from(name),
                value,
            }),
        }
    }
    (flags, options)
}

/// Opaque reference to a block device, owned by the block layer.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub path: String,
}

/// A filesystem driver, registered once per type.
#[allow(unused_variables)]
pub trait FsDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Whether `device` holds this filesystem. Only consulted when the
    /// caller did not name a type explicitly.
    fn probe(&self, device: &DeviceHandle, uuid: Option<&str>) -> bool {
        false
    }

    /// Fill in a new mount: must install the operations table and the
    /// root node before returning success.
    fn mount(&self, mount: &Arc<Mount>, options: &[MountOption]) -> Result<()>;

    /// Tear down driver state after the node cache has drained.
    fn unmount(&self, mount: &Arc<Mount>) {}

    /// Materialize a node from backing storage on a cache miss. The
    /// returned node carries one reference.
    fn read_node(&self, mount: &Arc<Mount>, id: NodeId) -> Result<Arc<Node>>;
}

struct FsTypeEntry {
    driver: Arc<dyn FsDriver>,
    refs: AtomicU32,
}

pub(crate) struct MountInner {
    /// Every cached node of this mount, by ID.
    pub nodes: BTreeMap<NodeId, Arc<Node>>,
    /// Nodes with at least one reference.
    pub used: BTreeSet<NodeId>,
    /// Unreferenced cached nodes, LRU stamp to ID.
    pub unused: BTreeMap<u64, NodeId>,
}

pub struct Mount {
    id: MountId,
    flags: MountFlags,
    device: Option<DeviceHandle>,
    pub(crate) driver: Arc<dyn FsDriver>,
    ops: Once<Arc<dyn NodeOps>>,
    root: Once<Arc<Node>>,
    /// Node in the parent mount that this mount shadows. The mount holds
    /// one reference to it for its whole lifetime.
    mountpoint: Once<Arc<Node>>,
    private: Once<Box<dyn Any + Send + Sync>>,
    pub(crate) inner: Mutex<MountInner>,
}

impl Mount {
    pub fn id(&self) -> MountId {
        self.id
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn read_only(&self) -> bool {
        self.flags.contains(MountFlags::RDONLY)
    }

    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    /// Driver side of `FsDriver::mount`: install the node operations.
    pub fn set_ops(&self, ops: Arc<dyn NodeOps>) {
        self.ops.call_once(|| ops);
    }

    pub(crate) fn ops(&self) -> &Arc<dyn NodeOps> {
        self.ops
            .get()
            .unwrap_or_else(|| fatal!("mount {}: driver installed no operations", self.id))
    }

    /// Driver side of `FsDriver::mount`: install the root node.
    pub fn set_root(&self, root: Arc<Node>) {
        self.root.call_once(|| root);
    }

    pub fn root_node(&self) -> &Arc<Node> {
        self.root
            .get()
            .unwrap_or_else(|| fatal!("mount {}: driver installed no root node", self.id))
    }

    pub(crate) fn mountpoint(&self) -> Option<&Arc<Node>> {
        self.mountpoint.get()
    }

    /// Per-mount driver state.
    pub fn set_private(&self, private: Box<dyn Any + Send + Sync>) {
        self.private.call_once(|| private);
    }

    pub fn private<T: 'static>(&self) -> Option<&T> {
        self.private.get()?.downcast_ref::<T>()
    }

    /// Reference the node with `id` in this mount, reading it in on a
    /// cache miss. Crossing into a mounted filesystem is handled here: a
    /// shadowed node yields the shadowing mount's root instead.
    pub fn grab_node(self: &Arc<Self>, id: NodeId) -> Result<NodeRef> {
        let mut inner = self.inner.lock();
        if let Some(cached) = inner.nodes.get(&id).cloned() {
            if let Some(sub) = cached.mounted_id() {
                // Registry order: never reach for another mount while a
                // mount lock is held.
                drop(inner);
                let submount = mount_by_id(sub).ok_or(Status::NotFound)?;
                return Ok(NodeRef::from_get(submount.root_node()));
            }
            let prev = cached.ref_inc();
            if prev == 0 {
                // First reference again: splice off the unused lists.
                let stamp = cached.lru_stamp();
                inner.unused.remove(&stamp);
                node::UNUSED_LRU.lock().remove(&stamp);
                cached.set_lru_stamp(0);
                inner.used.insert(id);
            }
            return Ok(NodeRef::adopt(cached));
        }

        let fresh = self.driver.read_node(self, id)?;
        inner.nodes.insert(id, fresh.clone());
        inner.used.insert(id);
        Ok(NodeRef::adopt(fresh))
    }

    /// Insert a node newly created by the driver into the cache. The
    /// node's reference belongs to the caller.
    pub(crate) fn insert_node(&self, node: &Arc<Node>) {
        let mut inner = self.inner.lock();
        inner.nodes.insert(node.id(), node.clone());
        inner.used.insert(node.id());
    }
}

impl core::fmt::Debug for Mount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("type", &self.driver.name())
            .field("flags", &self.flags)
            .finish()
    }
}

struct MountRegistry {
    by_id: BTreeMap<MountId, Arc<Mount>>,
    root: Option<Arc<Mount>>,
    ids: IdAllocator,
}

lazy_static! {
    static ref FS_TYPES: Mutex<Vec<FsTypeEntry>> = Mutex::new(Vec::new());
    static ref MOUNTS: Mutex<MountRegistry> = {
        let mut ids = IdAllocator::new(u16::MAX as u32 + 1);
        // 0 is the "no mount" sentinel used by node back-references.
        ids.reserve(0);
        Mutex::new(MountRegistry {
            by_id: BTreeMap::new(),
            root: None,
            ids,
        })
    };
}

pub(crate) fn mount_by_id(id: MountId) -> Option<Arc<Mount>> {
    MOUNTS.lock().by_id.get(&id).cloned()
}

pub fn root_mount() -> Option<Arc<Mount>> {
    MOUNTS.lock().root.clone()
}

// ---------------------------------------------------------------------
// Filesystem type registry
// ---------------------------------------------------------------------

pub fn register_fs_type(driver: Arc<dyn FsDriver>) -> Result<()> {
    if driver.name().is_empty() {
        return Err(Status::InvalidArg);
    }
    let mut types = FS_TYPES.lock();
    if types.iter().any(|e| e.driver.name() == driver.name()) {
        return Err(Status::AlreadyExists);
    }
    kinfo!("fs: registered filesystem type {}", driver.name());
    types.push(FsTypeEntry {
        driver,
        refs: AtomicU32::new(0),
    });
    Ok(())
}

pub fn unregister_fs_type(name: &str) -> Result<()> {
    let mut types = FS_TYPES.lock();
    let pos = types
        .iter()
        .position(|e| e.driver.name() == name)
        .ok_or(Status::NotFound)?;
    if types[pos].refs.load(Ordering::Acquire) != 0 {
        return Err(Status::InUse);
    }
    types.remove(pos);
    Ok(())
}

/// Look up a type by name and take a reference on it.
fn fs_type_get(name: &str) -> Result<Arc<dyn FsDriver>> {
    let types = FS_TYPES.lock();
    let entry = types
        .iter()
        .find(|e| e.driver.name() == name)
        .ok_or(Status::UnknownFs)?;
    entry.refs.fetch_add(1, Ordering::AcqRel);
    Ok(entry.driver.clone())
}

fn fs_type_put(name: &str) {
    let types = FS_TYPES.lock();
    if let Some(entry) = types.iter().find(|e| e.driver.name() == name) {
        entry.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Probe registered types against a device, first match wins.
fn fs_type_probe(device: &DeviceHandle) -> Result<Arc<dyn FsDriver>> {
    let types = FS_TYPES.lock();
    for entry in types.iter() {
        if entry.driver.probe(device, None) {
            entry.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(entry.driver.clone());
        }
    }
    Err(Status::UnknownFs)
}

// ---------------------------------------------------------------------
// Mounting
// ---------------------------------------------------------------------

/// Mount a filesystem at `target`.
///
/// The first mount must target `"/"` and becomes the root of the whole
/// namespace; it also seeds the kernel I/O context. Later mounts shadow
/// an existing directory.
pub fn mount(
    device: Option<DeviceHandle>,
    target: &str,
    type_name: Option<&str>,
    options: Option<&str>,
) -> Result<()> {
    if !context::current().has_cap(Capability::MOUNT) {
        return Err(Status::PermDenied);
    }
    if target.is_empty() {
        return Err(Status::InvalidArg);
    }
    let (flags, options) = parse_options(options.unwrap_or(""));

    let have_root = MOUNTS.lock().root.is_some();
    let target_node = if have_root {
        let node = fs::lookup(target, true, Some(NodeType::Directory))?;
        if node.mounted_id().is_some() {
            return Err(Status::InUse);
        }
        let owner = node
            .mount_id()
            .and_then(mount_by_id)
            .ok_or(Status::InvalidArg)?;
        if Arc::ptr_eq(node.inner(), owner.root_node()) {
            // Mount roots cannot be shadowed again.
            return Err(Status::InUse);
        }
        Some(node)
    } else {
        if target != "/" {
            return Err(Status::InvalidArg);
        }
        None
    };

    let driver = match type_name {
        Some(name) => fs_type_get(name)?,
        None => {
            // Probing without a device is meaningless.
            let dev = device.as_ref().ok_or(Status::InvalidArg)?;
            fs_type_probe(dev)?
        }
    };
    let type_name = driver.name();

    let id = match MOUNTS.lock().ids.alloc() {
        Some(id) => id as MountId,
        None => {
            fs_type_put(type_name);
            return Err(Status::FsFull);
        }
    };

    let mount = Arc::new(Mount {
        id,
        flags,
        device,
        driver: driver.clone(),
        ops: Once::new(),
        root: Once::new(),
        mountpoint: Once::new(),
        private: Once::new(),
        inner: Mutex::new(MountInner {
            nodes: BTreeMap::new(),
            used: BTreeSet::new(),
            unused: BTreeMap::new(),
        }),
    });

    if let Err(status) = driver.mount(&mount, &options) {
        MOUNTS.lock().ids.free(id as u32);
        fs_type_put(type_name);
        return Err(status);
    }
    let root = mount.root_node().clone();
    debug_assert_eq!(root.refs(), 1);
    mount.insert_node(&root);

    // Publish. The registry lock pins the tree while the mountpoint link
    // is made; the parent's own lock orders the update against lookups.
    {
        let mut registry = MOUNTS.lock();
        match target_node {
            Some(node) => {
                let parent = node
                    .mount_id()
                    .and_then(|pid| registry.by_id.get(&pid).cloned())
                    .ok_or(Status::NotFound)?;
                let parent_inner = parent.inner.lock();
                if node.mounted_id().is_some() {
                    // Lost the race to another mount on the same target.
                    drop(parent_inner);
                    drop(registry);
                    driver.unmount(&mount);
                    MOUNTS.lock().ids.free(id as u32);
                    fs_type_put(type_name);
                    return Err(Status::InUse);
                }
                node.set_mounted(id);
                drop(parent_inner);
                // The mount keeps the resolution's reference for its
                // lifetime; the shadowed node can never go unused.
                mount.mountpoint.call_once(|| node.into_raw());
            }
            None => {
                if registry.root.is_some() {
                    // Lost the race to become the root mount.
                    drop(registry);
                    driver.unmount(&mount);
                    MOUNTS.lock().ids.free(id as u32);
                    fs_type_put(type_name);
                    return Err(Status::InUse);
                }
                registry.root = Some(mount.clone());
            }
        }
        registry.by_id.insert(id, mount.clone());
    }

    if mount.mountpoint.get().is_none() {
        // First mount: the kernel context starts at the new root.
        context::kernel().seed(mount.root_node());
    }

    kinfo!("fs: mounted {} at {} (id {})", type_name, target, id);
    Ok(())
}

/// Unmount the filesystem whose root is at `target`.
pub fn unmount(target: &str) -> Result<()> {
    if !context::current().has_cap(Capability::MOUNT) {
        return Err(Status::PermDenied);
    }
    let node = fs::lookup(target, true, Some(NodeType::Directory))?;
    let mid = node.mount_id().ok_or(Status::NotMount)?;
    let mount = mount_by_id(mid).ok_or(Status::NotMount)?;
    if !Arc::ptr_eq(node.inner(), mount.root_node()) {
        return Err(Status::NotMount);
    }
    let Some(mp) = mount.mountpoint.get().cloned() else {
        // The root mount outlives everything.
        return Err(Status::InUse);
    };
    let parent_id = mp.mount_id().ok_or(Status::NotMount)?;
    let parent = mount_by_id(parent_id).ok_or(Status::NotMount)?;

    // From here on the resolution reference is managed by hand: dropping
    // a NodeRef takes the mount lock, which we are about to hold.
    let root = node.into_raw();

    let mut registry = MOUNTS.lock();
    let parent_inner = parent.inner.lock();
    let mut inner = mount.inner.lock();

    // Two references are accounted for: the mount's own and the
    // resolution's. Anything beyond that is an open handle or a cwd.
    if root.refs() != 2 || inner.used.len() > 1 {
        drop(inner);
        drop(parent_inner);
        drop(registry);
        node::release_ref(&root);
        return Err(Status::InUse);
    }
    root.ref_sub(2);

    // Destroy every cached-but-unused node, then the root itself. A
    // flush failure aborts the unmount with the node intact.
    let sweep: Vec<NodeId> = inner.unused.values().copied().collect();
    for nid in sweep {
        let Some(victim) = inner.nodes.get(&nid).cloned() else {
            continue;
        };
        if let Err(status) = node::free_locked(&mut inner, &victim) {
            root.ref_inc();
            root.ref_inc();
            drop(inner);
            drop(parent_inner);
            drop(registry);
            node::release_ref(&root);
            return Err(status);
        }
    }
    if let Err(status) = node::free_locked(&mut inner, &root) {
        root.ref_inc();
        root.ref_inc();
        drop(inner);
        drop(parent_inner);
        drop(registry);
        node::release_ref(&root);
        return Err(status);
    }

    mp.set_mounted(0);
    registry.by_id.remove(&mid);
    registry.ids.free(mid as u32);
    drop(inner);
    drop(parent_inner);
    drop(registry);

    mount.driver.unmount(&mount);
    fs_type_put(mount.driver.name());
    // Release the reference the mount held on its mountpoint.
    node::release_ref(&mp);
    kinfo!("fs: unmounted {} (id {})", target, mid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_parsing() {
        let (flags, opts) = parse_options("ro,size=64m,,noatime,uid=");
        assert!(flags.contains(MountFlags::RDONLY));
        assert_eq!(opts.len(), 3);
        assert_eq!(opts[0].name, "size");
        assert_eq!(opts[0].value.as_deref(), Some("64m"));
        assert_eq!(opts[1].name, "noatime");
        assert_eq!(opts[1].value, None);
        assert_eq!(opts[2].name, "uid");
        assert_eq!(opts[2].value.as_deref(), Some(""));

        let (flags, opts) = parse_options("");
        assert!(flags.is_empty());
        assert!(opts.is_empty());
    }

    #[test]
    fn fs_type_registry_lifecycle() {
        struct StubFs;
        impl FsDriver for StubFs {
            fn name(&self) -> &'static str {
                "stubfs"
            }
            fn mount(&self, _mount: &Arc<Mount>, _options: &[MountOption]) -> Result<()> {
                Err(Status::NotSupported)
            }
            fn read_node(&self, _mount: &Arc<Mount>, _id: NodeId) -> Result<Arc<Node>> {
                Err(Status::NotSupported)
            }
        }

        register_fs_type(Arc::new(StubFs)).unwrap();
        assert_eq!(
            register_fs_type(Arc::new(StubFs)).unwrap_err(),
            Status::AlreadyExists
        );
        let driver = fs_type_get("stubfs").unwrap();
        assert_eq!(unregister_fs_type("stubfs").unwrap_err(), Status::InUse);
        fs_type_put(driver.name());
        unregister_fs_type("stubfs").unwrap();
        assert_eq!(unregister_fs_type("stubfs").unwrap_err(), Status::NotFound);
        assert!(matches!(fs_type_get("stubfs"), Err(Status::UnknownFs)));
    }
}
