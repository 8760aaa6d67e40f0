//! Open-file handles.
//!
//! A handle pairs a referenced node with a byte offset and the mode the
//! open asked for. The offset lives under its own readers-writer lock;
//! positional reads and writes bypass it entirely.

use crate::fs::mount::{self, MountId};
use crate::fs::node::{DirEntry, NodeInfo, NodeRef, NodeType};
use crate::klib::error::{Result, Status};
use alloc::sync::Arc;
use bitflags::bitflags;
use spin::RwLock;

bitflags! {
    /// Handle open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
        const NONBLOCK = 1 << 3;
        const DIRECTORY = 1 << 4;
    }
}

/// Seek actions. Directory offsets count entries, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SeekAction {
    Set = 0,
    Add = 1,
    End = 2,
}

impl SeekAction {
    pub fn from_raw(raw: u32) -> Option<SeekAction> {
        match raw {
            0 => Some(SeekAction::Set),
            1 => Some(SeekAction::Add),
            2 => Some(SeekAction::End),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct FileHandle {
    node: NodeRef,
    flags: HandleFlags,
    offset: RwLock<i64>,
}

impl FileHandle {
    pub fn new(node: NodeRef, flags: HandleFlags) -> FileHandle {
        FileHandle {
            node,
            flags,
            offset: RwLock::new(0),
        }
    }

    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub fn flags(&self) -> HandleFlags {
        self.flags
    }

    pub fn offset(&self) -> i64 {
        *self.offset.read()
    }

    fn nonblock(&self) -> bool {
        self.flags.contains(HandleFlags::NONBLOCK)
    }

    fn want_file(&self) -> Result<()> {
        if self.node.is_dir() {
            Err(Status::NotFile)
        } else {
            Ok(())
        }
    }

    fn want_read(&self) -> Result<()> {
        if self.flags.contains(HandleFlags::READ) {
            Ok(())
        } else {
            Err(Status::PermDenied)
        }
    }

    fn want_write(&self) -> Result<()> {
        if !self.flags.contains(HandleFlags::WRITE) {
            return Err(Status::PermDenied);
        }
        if let Some(mount) = self.node.mount_id().and_then(mount::mount_by_id) {
            if mount.read_only() {
                return Err(Status::ReadOnly);
            }
        }
        Ok(())
    }

    /// Read at the current offset, advancing it by the bytes returned.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.want_read()?;
        self.want_file()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut offset = self.offset.write();
        let node = &self.node;
        let n = node.ops.read(node, buf, *offset as u64, self.nonblock())?;
        *offset += n as i64;
        Ok(n)
    }

    /// Positional read; the handle offset is untouched.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.want_read()?;
        self.want_file()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let node = &self.node;
        node.ops.read(node, buf, offset, self.nonblock())
    }

    /// Write at the current offset (or the end, for append handles),
    /// advancing the offset by the bytes written.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.want_write()?;
        self.want_file()?;
        if buf.is_empty() {
            // A zero-byte write does not move the offset, append or not.
            return Ok(0);
        }
        let mut offset = self.offset.write();
        if self.flags.contains(HandleFlags::APPEND) {
            *offset = self.node.info().size as i64;
        }
        let node = &self.node;
        let n = node.ops.write(node, buf, *offset as u64, self.nonblock())?;
        *offset += n as i64;
        Ok(n)
    }

    /// Positional write; ignores the append flag and the handle offset.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.want_write()?;
        self.want_file()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let node = &self.node;
        node.ops.write(node, buf, offset, self.nonblock())
    }

    pub fn resize(&self, size: u64) -> Result<()> {
        self.want_write()?;
        self.want_file()?;
        let node = &self.node;
        node.ops.resize(node, size)
    }

    pub fn seek(&self, action: SeekAction, delta: i64) -> Result<i64> {
        let mut offset = self.offset.write();
        let target = match action {
            SeekAction::Set => delta,
            SeekAction::Add => *offset + delta,
            SeekAction::End => {
                let end = if self.node.is_dir() {
                    match self.node.ops.entry_count(&self.node) {
                        Ok(count) => count as i64,
                        Err(Status::NotSupported) => return Err(Status::NotImplemented),
                        Err(status) => return Err(status),
                    }
                } else {
                    self.node.info().size as i64
                };
                end + delta
            }
        };
        if target < 0 {
            return Err(Status::InvalidArg);
        }
        *offset = target;
        Ok(target)
    }

    /// Read the next directory entry, patching mount boundaries:
    /// the `..` of a mount root points into the parent filesystem, and an
    /// entry that is itself a mountpoint reports the mounted root.
    pub fn read_dir(&self) -> Result<DirEntry> {
        if !self.node.is_dir() {
            return Err(Status::NotDir);
        }
        self.want_read()?;
        let node = &self.node;
        let mid = node.mount_id().ok_or(Status::NotSupported)?;
        let mount = mount::mount_by_id(mid).ok_or(Status::NotFound)?;

        let mut offset = self.offset.write();
        let (raw_id, name) = node.ops.read_entry(node, *offset as u64)?;
        let mut entry = DirEntry {
            id: raw_id,
            mount: mid,
            name,
        };

        let at_mount_root = Arc::ptr_eq(node.inner(), mount.root_node());
        if entry.name == ".." && at_mount_root {
            if let Some(mp) = mount.mountpoint() {
                let parent_mid = mp.mount_id().ok_or(Status::NotFound)?;
                entry.id = mp.ops.lookup_entry(mp, "..")?;
                entry.mount = parent_mid;
            }
        } else if entry.name != "." && entry.name != ".." {
            let shadowing = {
                let inner = mount.inner.lock();
                inner.nodes.get(&raw_id).and_then(|n| n.mounted_id())
            };
            if let Some(sub) = shadowing {
                if let Some(submount) = mount::mount_by_id(sub) {
                    entry.id = submount.root_node().id();
                    entry.mount = sub;
                }
            }
        }

        *offset += 1;
        Ok(entry)
    }

    pub fn sync(&self) -> Result<()> {
        let node = &self.node;
        node.ops.flush(node)
    }

    pub fn info(&self) -> NodeInfo {
        self.node.info()
    }

    pub fn node_type(&self) -> NodeType {
        self.node.node_type()
    }

    pub fn mount_id(&self) -> Option<MountId> {
        self.node.mount_id()
    }
}
