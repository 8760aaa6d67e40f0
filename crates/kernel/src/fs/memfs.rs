//! In-memory filesystem.
//!
//! The whole filesystem lives in a per-mount object table; cached nodes
//! are views onto it, so evicting an unused node loses nothing. Directory
//! entries sit in a radix tree, file payloads in kmalloc buffers.

use crate::fs::mount::{FsDriver, Mount, MountOption};
use crate::fs::node::{Node, NodeId, NodeInfo, NodeOps, NodeType};
use crate::klib::error::{Result, Status};
use crate::klib::string::kstrdup;
use crate::mm::{AllocPolicy, KBuf};
use crate::util::radix_tree::RadixTree;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

pub const ROOT_ID: NodeId = 1;

struct MemFile {
    data: Option<KBuf>,
    size: usize,
    links: u32,
}

struct MemDir {
    entries: RadixTree<NodeId>,
    links: u32,
}

struct MemLink {
    target: KBuf,
    links: u32,
}

enum MemObject {
    File(MemFile),
    Dir(MemDir),
    Symlink(MemLink),
}

impl MemObject {
    fn ntype(&self) -> NodeType {
        match self {
            MemObject::File(_) => NodeType::File,
            MemObject::Dir(_) => NodeType::Directory,
            MemObject::Symlink(_) => NodeType::Symlink,
        }
    }
}

/// Per-mount state, shared by every node of the mount.
struct MemFsState {
    objects: Mutex<BTreeMap<NodeId, MemObject>>,
    next_id: AtomicU64,
}

impl MemFsState {
    fn alloc_id(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }
}

fn state(node: &Node) -> Result<&Arc<MemFsState>> {
    node.private::<Arc<MemFsState>>()
        .ok_or(Status::InvalidArg)
}

struct MemFsOps;

impl NodeOps for MemFsOps {
    fn lookup_entry(&self, node: &Node, name: &str) -> Result<NodeId> {
        let st = state(node)?;
        let objects = st.objects.lock();
        match objects.get(&node.id()) {
            Some(MemObject::Dir(dir)) => dir.entries.lookup(name).copied().ok_or(Status::NotFound),
            Some(_) => Err(Status::NotDir),
            None => Err(Status::NotFound),
        }
    }

    fn read_entry(&self, node: &Node, index: u64) -> Result<(NodeId, String)> {
        let st = state(node)?;
        let objects = st.objects.lock();
        match objects.get(&node.id()) {
            Some(MemObject::Dir(dir)) => dir
                .entries
                .nth(index as usize)
                .map(|(name, &id)| (id, name))
                .ok_or(Status::NotFound),
            Some(_) => Err(Status::NotDir),
            None => Err(Status::NotFound),
        }
    }

    fn entry_count(&self, node: &Node) -> Result<u64> {
        let st = state(node)?;
        let objects = st.objects.lock();
        match objects.get(&node.id()) {
            Some(MemObject::Dir(dir)) => Ok(dir.entries.len() as u64),
            Some(_) => Err(Status::NotDir),
            None => Err(Status::NotFound),
        }
    }

    fn create(
        &self,
        parent: &Node,
        name: &str,
        ntype: NodeType,
        target: Option<&str>,
    ) -> Result<Arc<Node>> {
        let st = state(parent)?;
        let mount = parent.mount_id().ok_or(Status::InvalidArg)?;
        let mut objects = st.objects.lock();

        match objects.get(&parent.id()) {
            Some(MemObject::Dir(dir)) => {
                if dir.entries.lookup(name).is_some() {
                    return Err(Status::AlreadyExists);
                }
            }
            Some(_) => return Err(Status::NotDir),
            None => return Err(Status::NotFound),
        }

        let id = st.alloc_id();
        let object = match ntype {
            NodeType::File => MemObject::File(MemFile {
                data: None,
                size: 0,
                links: 1,
            }),
            NodeType::Directory => {
                let mut entries = RadixTree::new();
                entries.insert(".", id);
                entries.insert("..", parent.id());
                MemObject::Dir(MemDir { entries, links: 2 })
            }
            NodeType::Symlink => {
                let dest = target.ok_or(Status::InvalidArg)?;
                let buf = kstrdup(dest, AllocPolicy::KERNEL).ok_or(Status::NoMemory)?;
                MemObject::Symlink(MemLink {
                    target: buf,
                    links: 1,
                })
            }
            NodeType::Other => return Err(Status::NotSupported),
        };
        objects.insert(id, object);

        let Some(MemObject::Dir(dir)) = objects.get_mut(&parent.id()) else {
            return Err(Status::NotFound);
        };
        dir.entries.insert(name, id);
        if ntype == NodeType::Directory {
            dir.links += 1;
        }
        drop(objects);

        Ok(Node::new(
            Some(mount),
            id,
            ntype,
            parent.ops.clone(),
            Some(Box::new(st.clone())),
        ))
    }

    fn unlink(&self, parent: &Node, name: &str, node: &Node) -> Result<()> {
        let st = state(parent)?;
        let mut objects = st.objects.lock();

        let entry_id = match objects.get(&parent.id()) {
            Some(MemObject::Dir(dir)) => {
                dir.entries.lookup(name).copied().ok_or(Status::NotFound)?
            }
            Some(_) => return Err(Status::NotDir),
            None => return Err(Status::NotFound),
        };
        if entry_id != node.id() {
            // The entry changed between lookup and unlink.
            return Err(Status::NotFound);
        }

        let removed_dir = match objects.get_mut(&entry_id) {
            Some(MemObject::Dir(dir)) => {
                if dir.entries.len() > 2 {
                    // Only "." and ".." may remain.
                    return Err(Status::InUse);
                }
                dir.links = 0;
                true
            }
            Some(MemObject::File(file)) => {
                file.links -= 1;
                if file.links == 0 {
                    node.set_removed();
                }
                false
            }
            Some(MemObject::Symlink(link)) => {
                link.links -= 1;
                if link.links == 0 {
                    node.set_removed();
                }
                false
            }
            None => return Err(Status::NotFound),
        };
        if removed_dir {
            node.set_removed();
        }

        let Some(MemObject::Dir(dir)) = objects.get_mut(&parent.id()) else {
            return Err(Status::NotFound);
        };
        dir.entries.remove(name);
        if removed_dir {
            dir.links -= 1;
        }
        Ok(())
    }

    fn read(&self, node: &Node, buf: &mut [u8], offset: u64, _nonblock: bool) -> Result<usize> {
        let st = state(node)?;
        let objects = st.objects.lock();
        let Some(MemObject::File(file)) = objects.get(&node.id()) else {
            return Err(Status::NotFile);
        };
        let offset = offset as usize;
        if offset >= file.size {
            return Ok(0);
        }
        let n = buf.len().min(file.size - offset);
        match &file.data {
            Some(data) => buf[..n].copy_from_slice(&data.as_slice()[offset..offset + n]),
            None => buf[..n].fill(0),
        }
        Ok(n)
    }

    fn write(&self, node: &Node, buf: &[u8], offset: u64, _nonblock: bool) -> Result<usize> {
        let st = state(node)?;
        let mut objects = st.objects.lock();
        let Some(MemObject::File(file)) = objects.get_mut(&node.id()) else {
            return Err(Status::NotFile);
        };
        let offset = offset as usize;
        let end = offset + buf.len();

        let capacity = file.data.as_ref().map(|d| d.len()).unwrap_or(0);
        if end > capacity {
            let grown_to = end.next_power_of_two().max(64);
            let grown = match file.data.take() {
                Some(old) => old.resized(grown_to, AllocPolicy::KERNEL),
                None => KBuf::alloc(grown_to, AllocPolicy::KERNEL),
            }
            .ok_or(Status::NoMemory)?;
            file.data = Some(grown);
        }

        let data = file.data.as_mut().expect("buffer grown above");
        data.as_mut_slice()[offset..end].copy_from_slice(buf);
        file.size = file.size.max(end);
        Ok(buf.len())
    }

    fn resize(&self, node: &Node, size: u64) -> Result<()> {
        let st = state(node)?;
        let mut objects = st.objects.lock();
        let Some(MemObject::File(file)) = objects.get_mut(&node.id()) else {
            return Err(Status::NotFile);
        };
        let size = size as usize;
        if size < file.size {
            // Zero the abandoned tail so a later growth reads as holes.
            if let Some(data) = file.data.as_mut() {
                data.as_mut_slice()[size..file.size].fill(0);
            }
        } else if size > file.data.as_ref().map(|d| d.len()).unwrap_or(0) {
            let grown = match file.data.take() {
                Some(old) => old.resized(size, AllocPolicy::KERNEL),
                None => KBuf::alloc(size, AllocPolicy::KERNEL),
            }
            .ok_or(Status::NoMemory)?;
            file.data = Some(grown);
        }
        file.size = size;
        Ok(())
    }

    fn read_link(&self, node: &Node) -> Result<String> {
        let st = state(node)?;
        let objects = st.objects.lock();
        match objects.get(&node.id()) {
            Some(MemObject::Symlink(link)) => link
                .target
                .as_str()
                .map(String::from)
                .ok_or(Status::FormatInvalid),
            Some(_) => Err(Status::NotSymlink),
            None => Err(Status::NotFound),
        }
    }

    fn free(&self, node: &Node) -> Result<()> {
        if node.is_removed() {
            let st = state(node)?;
            st.objects.lock().remove(&node.id());
        }
        Ok(())
    }

    fn info(&self, node: &Node, info: &mut NodeInfo) {
        let Ok(st) = state(node) else {
            return;
        };
        let objects = st.objects.lock();
        match objects.get(&node.id()) {
            Some(MemObject::File(file)) => {
                info.size = file.size as u64;
                info.links = file.links;
            }
            Some(MemObject::Dir(dir)) => {
                info.size = dir.entries.len() as u64;
                info.links = dir.links;
            }
            Some(MemObject::Symlink(link)) => {
                info.size = link.target.len() as u64;
                info.links = link.links;
            }
            None => {}
        }
    }
}

pub struct MemFs;

impl FsDriver for MemFs {
    fn name(&self) -> &'static str {
        "memfs"
    }

    fn description(&self) -> &'static str {
        "In-memory filesystem"
    }

    fn mount(&self, mount: &Arc<Mount>, _options: &[MountOption]) -> Result<()> {
        let mut entries = RadixTree::new();
        entries.insert(".", ROOT_ID);
        entries.insert("..", ROOT_ID);
        let mut objects = BTreeMap::new();
        objects.insert(ROOT_ID, MemObject::Dir(MemDir { entries, links: 2 }));

        let st = Arc::new(MemFsState {
            objects: Mutex::new(objects),
            next_id: AtomicU64::new(ROOT_ID + 1),
        });
        mount.set_private(Box::new(st.clone()));

        let ops: Arc<dyn NodeOps> = Arc::new(MemFsOps);
        mount.set_ops(ops.clone());
        mount.set_root(Node::new(
            Some(mount.id()),
            ROOT_ID,
            NodeType::Directory,
            ops,
            Some(Box::new(st)),
        ));
        Ok(())
    }

    fn read_node(&self, mount: &Arc<Mount>, id: NodeId) -> Result<Arc<Node>> {
        let st = mount
            .private::<Arc<MemFsState>>()
            .ok_or(Status::InvalidArg)?;
        let ntype = {
            let objects = st.objects.lock();
            objects.get(&id).ok_or(Status::NotFound)?.ntype()
        };
        Ok(Node::new(
            Some(mount.id()),
            id,
            ntype,
            mount.ops().clone(),
            Some(Box::new(st.clone())),
        ))
    }
}

/// Register the memfs driver with the filesystem type registry.
pub fn register() -> Result<()> {
    crate::fs::mount::register_fs_type(Arc::new(MemFs))
}
