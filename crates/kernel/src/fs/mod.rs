//! Virtual filesystem core.
//!
//! Mount registry, node cache, path lookup, and the handle layer over
//! them. Concrete filesystems implement `FsDriver` + `NodeOps`; the
//! in-tree `memfs` is the reference driver.
//!
//! Path lookup pins the caller's I/O context (shared lock) for its whole
//! run, walks components iteratively, resolves symbolic links by bounded
//! recursion from the containing directory, and crosses mount boundaries
//! in both directions: downward through shadowed nodes, upward through
//! `..` at a mount root.

pub mod context;
pub mod file;
pub mod memfs;
pub mod mount;
pub mod node;

pub use context::{Capability, HandleId, IoContext};
pub use file::{FileHandle, HandleFlags, SeekAction};
pub use mount::{
    mount, register_fs_type, root_mount, unmount, unregister_fs_type, DeviceHandle, FsDriver,
    MountFlags, MountId, MountOption,
};
pub use node::{DirEntry, Node, NodeId, NodeInfo, NodeOps, NodeRef, NodeType};

use crate::config::{NAME_MAX, PATH_MAX, SYMLINK_MAX};
use crate::klib::error::{Result, Status};
use crate::klib::string::{kbasename, kdirname};
use crate::lrm;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Once;

/// One-time bring-up: the reference driver and the low-memory hook.
pub fn init() {
    static INIT: Once<()> = Once::new();
    INIT.call_once(|| {
        if let Err(status) = memfs::register() {
            crate::fatal!("fs: cannot register memfs: {}", status.description());
        }
        lrm::register("fs_node_cache", node::reclaim);
    });
}

// ---------------------------------------------------------------------
// Path lookup
// ---------------------------------------------------------------------

/// Resolve `path` to a referenced node.
///
/// `follow` controls whether a symbolic link in the final position is
/// followed. `want` adds a final type check, mapped to the matching
/// `Not*` status on mismatch.
pub fn lookup(path: &str, follow: bool, want: Option<NodeType>) -> Result<NodeRef> {
    if path.is_empty() || path.len() >= PATH_MAX {
        return Err(Status::InvalidArg);
    }
    let ctx = context::current();
    // Hold the context shared for the whole resolution so a concurrent
    // setroot cannot reseat the tree under us.
    let dirs = ctx.dirs().read();
    let root = dirs.root.as_ref().ok_or(Status::NotFound)?.clone();
    let start = if path.starts_with('/') {
        root.clone()
    } else {
        dirs.cwd.as_ref().ok_or(Status::NotFound)?.clone()
    };
    let mut nest = 0u32;
    let result = resolve_path(start, &root, path, follow, &mut nest);
    drop(dirs);

    let found = result?;
    if let Some(want) = want {
        if found.node_type() != want {
            return Err(match want {
                NodeType::Directory => Status::NotDir,
                NodeType::File => Status::NotFile,
                NodeType::Symlink => Status::NotSymlink,
                NodeType::Other => Status::InvalidArg,
            });
        }
    }
    Ok(found)
}

fn resolve_path(
    mut cur: NodeRef,
    root: &NodeRef,
    path: &str,
    follow_last: bool,
    nest: &mut u32,
) -> Result<NodeRef> {
    let mut rest = path;
    if rest.starts_with('/') {
        cur = root.clone();
        rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            if !cur.is_dir() {
                return Err(Status::NotDir);
            }
            return Ok(cur);
        }
    }
    if !cur.is_dir() && !cur.is_symlink() {
        return Err(Status::NotDir);
    }

    // Directory the current node was found in, kept one step behind so a
    // symbolic link resolves relative to its container.
    let mut prev = cur.clone();

    for token in rest.split('/') {
        if token.is_empty() {
            // Repeated slash.
            continue;
        }
        if token.len() > NAME_MAX {
            return Err(Status::InvalidArg);
        }

        if cur.is_symlink() {
            cur = resolve_symlink(&cur, &prev, root, nest)?;
        }
        if !cur.is_dir() {
            return Err(Status::NotDir);
        }

        if token == ".." {
            if cur.same_node(root) {
                // The process cannot ascend out of its root.
                continue;
            }
            // At the root of a lower mount, reseat on the shadowed node;
            // the normal lookup below then finds its "..".
            let mid = cur.mount_id().ok_or(Status::NotFound)?;
            let owner = mount::mount_by_id(mid).ok_or(Status::NotFound)?;
            if Arc::ptr_eq(cur.inner(), owner.root_node()) {
                if let Some(mp) = owner.mountpoint() {
                    cur = NodeRef::from_get(mp);
                }
            }
        }

        let id = cur.ops.lookup_entry(&cur, token)?;
        if id == cur.id() {
            // "." or an equivalent self-reference.
            continue;
        }
        let mid = cur.mount_id().ok_or(Status::NotFound)?;
        let owner = mount::mount_by_id(mid).ok_or(Status::NotFound)?;
        let next = owner.grab_node(id)?;
        prev = core::mem::replace(&mut cur, next);
    }

    if cur.is_symlink() && follow_last {
        cur = resolve_symlink(&cur, &prev, root, nest)?;
    }
    Ok(cur)
}

fn resolve_symlink(
    link: &NodeRef,
    parent: &NodeRef,
    root: &NodeRef,
    nest: &mut u32,
) -> Result<NodeRef> {
    *nest += 1;
    if *nest > SYMLINK_MAX {
        return Err(Status::SymlinkLimit);
    }
    let target = link.ops.read_link(link)?;
    resolve_path(parent.clone(), root, &target, true, nest)
}

// ---------------------------------------------------------------------
// Namespace operations
// ---------------------------------------------------------------------

/// Split a path into its parent directory (resolved) and final name.
fn split_parent(path: &str) -> Result<(NodeRef, &str)> {
    let name = kbasename(path);
    if name == "/" || name == "." || name == ".." || name.is_empty() {
        return Err(Status::InvalidArg);
    }
    let parent = lookup(kdirname(path), true, Some(NodeType::Directory))?;
    Ok((parent, name))
}

fn create_node(path: &str, ntype: NodeType, target: Option<&str>) -> Result<NodeRef> {
    let (parent, name) = split_parent(path)?;
    let mid = parent.mount_id().ok_or(Status::NotSupported)?;
    let owner = mount::mount_by_id(mid).ok_or(Status::NotFound)?;
    if owner.read_only() {
        return Err(Status::ReadOnly);
    }
    match parent.ops.lookup_entry(&parent, name) {
        Ok(_) => return Err(Status::AlreadyExists),
        Err(Status::NotFound) => {}
        Err(status) => return Err(status),
    }
    let fresh = parent.ops.create(&parent, name, ntype, target)?;
    owner.insert_node(&fresh);
    Ok(NodeRef::adopt(fresh))
}

pub fn file_create(path: &str) -> Result<()> {
    create_node(path, NodeType::File, None).map(|_| ())
}

pub fn dir_create(path: &str) -> Result<()> {
    create_node(path, NodeType::Directory, None).map(|_| ())
}

pub fn symlink_create(path: &str, target: &str) -> Result<()> {
    if target.is_empty() || target.len() >= PATH_MAX {
        return Err(Status::InvalidArg);
    }
    create_node(path, NodeType::Symlink, Some(target)).map(|_| ())
}

/// Destination of a symbolic link, without following it.
pub fn symlink_read(path: &str) -> Result<String> {
    let link = lookup(path, false, Some(NodeType::Symlink))?;
    link.ops.read_link(&link)
}

pub fn unlink(path: &str) -> Result<()> {
    let (parent, name) = split_parent(path)?;
    let mid = parent.mount_id().ok_or(Status::NotSupported)?;
    let owner = mount::mount_by_id(mid).ok_or(Status::NotFound)?;
    if owner.read_only() {
        return Err(Status::ReadOnly);
    }
    let id = parent.ops.lookup_entry(&parent, name)?;
    if id == parent.id() {
        return Err(Status::InvalidArg);
    }
    let victim = owner.grab_node(id)?;
    if victim.mounted_id().is_some() {
        return Err(Status::InUse);
    }
    if let Some(vm) = victim.mount_id().and_then(mount::mount_by_id) {
        if Arc::ptr_eq(victim.inner(), vm.root_node()) {
            return Err(Status::InUse);
        }
    }
    parent.ops.unlink(&parent, name, &victim)
    // Dropping `victim` releases the last lookup reference; a removed
    // node is destroyed right there.
}

// ---------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------

pub fn file_open(path: &str, flags: HandleFlags) -> Result<HandleId> {
    if !flags.intersects(HandleFlags::READ | HandleFlags::WRITE) {
        return Err(Status::InvalidArg);
    }
    let node = lookup(path, true, Some(NodeType::File))?;
    if flags.contains(HandleFlags::WRITE) {
        let owner = node
            .mount_id()
            .and_then(mount::mount_by_id)
            .ok_or(Status::NotFound)?;
        if owner.read_only() {
            return Err(Status::ReadOnly);
        }
    }
    let handle = FileHandle::new(node, flags - HandleFlags::DIRECTORY);
    context::current().install_handle(Arc::new(handle))
}

pub fn dir_open(path: &str, flags: HandleFlags) -> Result<HandleId> {
    let node = lookup(path, true, Some(NodeType::Directory))?;
    let handle = FileHandle::new(
        node,
        (flags & HandleFlags::NONBLOCK) | HandleFlags::READ | HandleFlags::DIRECTORY,
    );
    context::current().install_handle(Arc::new(handle))
}

fn handle(id: HandleId) -> Result<Arc<FileHandle>> {
    context::current().get_handle(id)
}

pub fn handle_close(id: HandleId) -> Result<()> {
    context::current().close_handle(id)
}

pub fn file_read(id: HandleId, buf: &mut [u8]) -> Result<usize> {
    let h = handle(id)?;
    if h.flags().contains(HandleFlags::DIRECTORY) {
        return Err(Status::NotFile);
    }
    h.read(buf)
}

pub fn file_pread(id: HandleId, buf: &mut [u8], offset: u64) -> Result<usize> {
    let h = handle(id)?;
    if h.flags().contains(HandleFlags::DIRECTORY) {
        return Err(Status::NotFile);
    }
    h.pread(buf, offset)
}

pub fn file_write(id: HandleId, buf: &[u8]) -> Result<usize> {
    let h = handle(id)?;
    if h.flags().contains(HandleFlags::DIRECTORY) {
        return Err(Status::NotFile);
    }
    h.write(buf)
}

pub fn file_pwrite(id: HandleId, buf: &[u8], offset: u64) -> Result<usize> {
    let h = handle(id)?;
    if h.flags().contains(HandleFlags::DIRECTORY) {
        return Err(Status::NotFile);
    }
    h.pwrite(buf, offset)
}

pub fn file_resize(id: HandleId, size: u64) -> Result<()> {
    let h = handle(id)?;
    if h.flags().contains(HandleFlags::DIRECTORY) {
        return Err(Status::NotFile);
    }
    h.resize(size)
}

pub fn handle_seek(id: HandleId, action: SeekAction, offset: i64) -> Result<i64> {
    handle(id)?.seek(action, offset)
}

pub fn handle_info(id: HandleId) -> Result<NodeInfo> {
    Ok(handle(id)?.info())
}

pub fn handle_sync(id: HandleId) -> Result<()> {
    handle(id)?.sync()
}

pub fn dir_read(id: HandleId) -> Result<DirEntry> {
    let h = handle(id)?;
    if !h.flags().contains(HandleFlags::DIRECTORY) {
        return Err(Status::NotDir);
    }
    h.read_dir()
}

// ---------------------------------------------------------------------
// Info and working directory
// ---------------------------------------------------------------------

pub fn info(path: &str, follow: bool) -> Result<NodeInfo> {
    Ok(lookup(path, follow, None)?.info())
}

pub fn setcwd(path: &str) -> Result<()> {
    let node = lookup(path, true, Some(NodeType::Directory))?;
    context::current().set_cwd(node);
    Ok(())
}

pub fn setroot(path: &str) -> Result<()> {
    let ctx = context::current();
    if !ctx.has_cap(Capability::SETROOT) {
        return Err(Status::PermDenied);
    }
    let node = lookup(path, true, Some(NodeType::Directory))?;
    ctx.set_root(node);
    Ok(())
}

/// Absolute path of the current directory, built by walking upward and
/// matching each step's ID in its parent.
pub fn getcwd() -> Result<String> {
    let ctx = context::current();
    let dirs = ctx.dirs().read();
    let root = dirs.root.as_ref().ok_or(Status::NotFound)?.clone();
    let mut cur = dirs.cwd.as_ref().ok_or(Status::NotFound)?.clone();

    let mut segments: Vec<String> = Vec::new();
    let mut nest = 0u32;
    while !cur.same_node(&root) {
        let mid = cur.mount_id().ok_or(Status::NotSupported)?;
        let owner = mount::mount_by_id(mid).ok_or(Status::NotFound)?;
        // The ID to search for in the parent: at the root of a lower
        // mount, what the parent knows is the mountpoint.
        let child_id = if Arc::ptr_eq(cur.inner(), owner.root_node()) {
            match owner.mountpoint() {
                Some(mp) => mp.id(),
                None => break,
            }
        } else {
            cur.id()
        };

        let parent = resolve_path(cur.clone(), &root, "..", true, &mut nest)?;
        if parent.same_node(&cur) {
            break;
        }

        let mut index = 0u64;
        let name = loop {
            match parent.ops.read_entry(&parent, index) {
                Ok((id, name)) => {
                    if id == child_id && name != "." && name != ".." {
                        break name;
                    }
                    index += 1;
                }
                Err(Status::NotFound) => return Err(Status::NotFound),
                Err(status) => return Err(status),
            }
        };
        segments.push(name);
        cur = parent;
    }

    let mut path = String::new();
    if segments.is_empty() {
        path.push('/');
    } else {
        for segment in segments.iter().rev() {
            path.push('/');
            path.push_str(segment);
        }
    }
    Ok(path)
}

// ---------------------------------------------------------------------
// Reserved operations
// ---------------------------------------------------------------------

/// Hard links are not yet wired through the drivers.
pub fn link(_src: &str, _dst: &str) -> Result<()> {
    Err(Status::NotImplemented)
}

/// Cross-directory rename is not yet wired through the drivers.
pub fn rename(_src: &str, _dst: &str) -> Result<()> {
    Err(Status::NotImplemented)
}

/// Global writeback sweep.
pub fn sync() -> Result<()> {
    Err(Status::NotImplemented)
}

// ---------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use lazy_static::lazy_static;
    use spin::Mutex;

    lazy_static! {
        /// The mount tree and kernel context are process-global; tests
        /// that touch them serialize here.
        pub static ref FS_LOCK: Mutex<()> = Mutex::new(());
    }

    /// Serialize and make sure the root memfs is mounted.
    pub fn setup() -> spin::MutexGuard<'static, ()> {
        let guard = FS_LOCK.lock();
        crate::init();
        if mount::root_mount().is_none() {
            mount::mount(None, "/", Some("memfs"), None).unwrap();
        }
        guard
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::setup;
    use super::*;

    #[test]
    fn mount_and_basic_io() {
        let _fs = setup();
        file_create("/e1_a").unwrap();
        let h = file_open("/e1_a", HandleFlags::READ | HandleFlags::WRITE).unwrap();
        assert_eq!(file_write(h, b"hello").unwrap(), 5);
        assert_eq!(handle_seek(h, SeekAction::Set, 0).unwrap(), 0);
        let mut buf = [0u8; 5];
        assert_eq!(file_read(h, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        // Offset advanced past the end: further reads return nothing.
        assert_eq!(file_read(h, &mut buf).unwrap(), 0);
        handle_close(h).unwrap();
        unlink("/e1_a").unwrap();
        assert_eq!(
            file_open("/e1_a", HandleFlags::READ).unwrap_err(),
            Status::NotFound
        );
    }

    #[test]
    fn create_then_unlink_restores_directory() {
        let _fs = setup();
        dir_create("/rt").unwrap();
        let before = info("/rt", true).unwrap().size;
        file_create("/rt/x").unwrap();
        assert_eq!(info("/rt", true).unwrap().size, before + 1);
        unlink("/rt/x").unwrap();
        assert_eq!(info("/rt", true).unwrap().size, before);
        assert_eq!(lookup("/rt/x", true, None).unwrap_err(), Status::NotFound);
        unlink("/rt").unwrap();
    }

    #[test]
    fn symlink_following() {
        let _fs = setup();
        dir_create("/t").unwrap();
        file_create("/t/real").unwrap();
        let h = file_open("/t/real", HandleFlags::WRITE).unwrap();
        assert_eq!(file_write(h, b"X").unwrap(), 1);
        handle_close(h).unwrap();

        symlink_create("/t/link", "real").unwrap();
        let h = file_open("/t/link", HandleFlags::READ).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(file_read(h, &mut buf).unwrap(), 1);
        assert_eq!(&buf, b"X");
        handle_close(h).unwrap();

        // A link to a link still lands on the file.
        symlink_create("/t/link2", "link").unwrap();
        let h = file_open("/t/link2", HandleFlags::READ).unwrap();
        assert_eq!(file_read(h, &mut buf).unwrap(), 1);
        assert_eq!(&buf, b"X");
        handle_close(h).unwrap();

        // Without following, the link itself is what resolves.
        assert_eq!(symlink_read("/t/link").unwrap(), "real");
        assert_eq!(
            lookup("/t/link", false, None).unwrap().node_type(),
            NodeType::Symlink
        );

        // Self-referential cycle.
        symlink_create("/t/l1", "l2").unwrap();
        symlink_create("/t/l2", "l1").unwrap();
        assert_eq!(
            file_open("/t/l1", HandleFlags::READ).unwrap_err(),
            Status::SymlinkLimit
        );
    }

    #[test]
    fn symlink_chain_at_limit_resolves() {
        let _fs = setup();
        dir_create("/chain").unwrap();
        file_create("/chain/real").unwrap();
        // s1 -> s2 -> ... -> s16 -> real: exactly SYMLINK_MAX hops.
        let max = SYMLINK_MAX as usize;
        for i in (1..=max).rev() {
            let path = alloc::format!("/chain/s{}", i);
            let target = if i == max {
                String::from("real")
            } else {
                alloc::format!("s{}", i + 1)
            };
            symlink_create(&path, &target).unwrap();
        }
        assert!(lookup("/chain/s1", true, Some(NodeType::File)).is_ok());

        // One more hop pushes past the limit.
        symlink_create("/chain/s0", "s1").unwrap();
        assert_eq!(
            lookup("/chain/s0", true, Some(NodeType::File)).unwrap_err(),
            Status::SymlinkLimit
        );
    }

    #[test]
    fn mount_shadowing_and_dotdot() {
        let _fs = setup();
        dir_create("/m_e3").unwrap();
        file_create("/m_e3/marker").unwrap();

        mount::mount(None, "/m_e3", Some("memfs"), None).unwrap();
        // The old content is shadowed.
        assert_eq!(
            lookup("/m_e3/marker", true, None).unwrap_err(),
            Status::NotFound
        );

        let sub_root_info = info("/m_e3", true).unwrap();
        let outer_root = info("/", true).unwrap();
        assert_ne!(sub_root_info.mount, outer_root.mount);

        // Directory listing of "/" reports the entry with the mounted
        // root's identity.
        let dh = dir_open("/", HandleFlags::READ).unwrap();
        let mut seen = false;
        loop {
            match dir_read(dh) {
                Ok(entry) => {
                    if entry.name == "m_e3" {
                        assert_eq!(entry.mount, sub_root_info.mount);
                        assert_eq!(entry.id, sub_root_info.id);
                        seen = true;
                    }
                }
                Err(Status::NotFound) => break,
                Err(status) => panic!("dir_read failed: {:?}", status),
            }
        }
        assert!(seen);
        handle_close(dh).unwrap();

        // ".." read from inside the mounted root names the outer parent.
        let dh = dir_open("/m_e3", HandleFlags::READ).unwrap();
        let mut dotdot = None;
        loop {
            match dir_read(dh) {
                Ok(entry) => {
                    if entry.name == ".." {
                        dotdot = Some(entry);
                    }
                }
                Err(Status::NotFound) => break,
                Err(status) => panic!("dir_read failed: {:?}", status),
            }
        }
        let dotdot = dotdot.unwrap();
        assert_eq!(dotdot.mount, outer_root.mount);
        assert_eq!(dotdot.id, outer_root.id);
        handle_close(dh).unwrap();

        // Walking up through the boundary works too.
        let up = lookup("/m_e3/..", true, Some(NodeType::Directory)).unwrap();
        assert_eq!(up.id(), outer_root.id);

        mount::unmount("/m_e3").unwrap();
        // The shadowed content is visible again.
        assert!(lookup("/m_e3/marker", true, None).is_ok());
        unlink("/m_e3/marker").unwrap();
        unlink("/m_e3").unwrap();
    }

    #[test]
    fn unmount_busy_until_handles_close() {
        let _fs = setup();
        dir_create("/m_e6").unwrap();
        mount::mount(None, "/m_e6", Some("memfs"), None).unwrap();
        file_create("/m_e6/f").unwrap();
        let h = file_open("/m_e6/f", HandleFlags::READ).unwrap();

        assert_eq!(mount::unmount("/m_e6").unwrap_err(), Status::InUse);
        handle_close(h).unwrap();
        mount::unmount("/m_e6").unwrap();
        unlink("/m_e6").unwrap();
    }

    #[test]
    fn lookup_boundaries() {
        let _fs = setup();
        assert_eq!(lookup("", true, None).unwrap_err(), Status::InvalidArg);

        // Only slashes: the process root.
        let root_info = info("/", true).unwrap();
        let n = lookup("///", true, None).unwrap();
        assert_eq!(n.id(), root_info.id);

        // ".." cannot escape the root.
        let n = lookup("/../../..", true, None).unwrap();
        assert_eq!(n.id(), root_info.id);

        // "." stays put.
        dir_create("/bnd").unwrap();
        let n = lookup("/bnd/./.", true, None).unwrap();
        assert_eq!(n.id(), info("/bnd", true).unwrap().id);
        unlink("/bnd").unwrap();

        // Type mismatches map to the requested family.
        file_create("/bnd_f").unwrap();
        assert_eq!(
            lookup("/bnd_f", true, Some(NodeType::Directory)).unwrap_err(),
            Status::NotDir
        );
        assert_eq!(
            lookup("/bnd_f", true, Some(NodeType::Symlink)).unwrap_err(),
            Status::NotSymlink
        );
        assert_eq!(
            lookup("/", true, Some(NodeType::File)).unwrap_err(),
            Status::NotFile
        );
        // A file in the middle of a path cannot be descended through.
        assert_eq!(
            lookup("/bnd_f/x", true, None).unwrap_err(),
            Status::NotDir
        );
        unlink("/bnd_f").unwrap();
    }

    #[test]
    fn zero_byte_io_leaves_offset_alone() {
        let _fs = setup();
        file_create("/zb").unwrap();
        let h = file_open(
            "/zb",
            HandleFlags::READ | HandleFlags::WRITE | HandleFlags::APPEND,
        )
        .unwrap();
        assert_eq!(file_write(h, b"abc").unwrap(), 3);
        assert_eq!(handle_seek(h, SeekAction::Set, 1).unwrap(), 1);
        assert_eq!(file_write(h, b"").unwrap(), 0);
        assert_eq!(file_read(h, &mut []).unwrap(), 0);
        // Even on an append handle, the zero-byte write kept offset 1.
        let mut buf = [0u8; 2];
        assert_eq!(file_read(h, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"bc");
        handle_close(h).unwrap();
        unlink("/zb").unwrap();
    }

    #[test]
    fn pread_pwrite_ignore_offset() {
        let _fs = setup();
        file_create("/pp").unwrap();
        let h = file_open("/pp", HandleFlags::READ | HandleFlags::WRITE).unwrap();
        assert_eq!(file_write(h, b"0123456789").unwrap(), 10);
        let mut buf = [0u8; 4];
        assert_eq!(file_pread(h, &mut buf, 3).unwrap(), 4);
        assert_eq!(&buf, b"3456");
        assert_eq!(file_pwrite(h, b"XY", 0).unwrap(), 2);
        // The handle offset still sits at the end from the first write.
        assert_eq!(handle_seek(h, SeekAction::Add, 0).unwrap(), 10);
        assert_eq!(file_pread(h, &mut buf[..2], 0).unwrap(), 2);
        assert_eq!(&buf[..2], b"XY");
        handle_close(h).unwrap();
        unlink("/pp").unwrap();
    }

    #[test]
    fn seek_semantics() {
        let _fs = setup();
        file_create("/sk").unwrap();
        let h = file_open("/sk", HandleFlags::READ | HandleFlags::WRITE).unwrap();
        file_write(h, b"0123456789").unwrap();
        assert_eq!(
            handle_seek(h, SeekAction::Set, -1).unwrap_err(),
            Status::InvalidArg
        );
        assert_eq!(handle_seek(h, SeekAction::Set, 4).unwrap(), 4);
        assert_eq!(handle_seek(h, SeekAction::Add, -2).unwrap(), 2);
        assert_eq!(
            handle_seek(h, SeekAction::Add, -5).unwrap_err(),
            Status::InvalidArg
        );
        assert_eq!(handle_seek(h, SeekAction::End, -3).unwrap(), 7);
        handle_close(h).unwrap();

        // Directory END seeks count entries.
        dir_create("/skd").unwrap();
        file_create("/skd/one").unwrap();
        let dh = dir_open("/skd", HandleFlags::READ).unwrap();
        // ".", "..", "one"
        assert_eq!(handle_seek(dh, SeekAction::End, 0).unwrap(), 3);
        handle_close(dh).unwrap();
        unlink("/skd/one").unwrap();
        unlink("/skd").unwrap();
        unlink("/sk").unwrap();
    }

    #[test]
    fn getcwd_setcwd_round_trip() {
        let _fs = setup();
        dir_create("/cw").unwrap();
        dir_create("/cw/sub").unwrap();
        setcwd("/cw/sub").unwrap();
        assert_eq!(getcwd().unwrap(), "/cw/sub");

        // Relative resolution starts at the cwd.
        file_create("rel").unwrap();
        assert!(lookup("/cw/sub/rel", true, Some(NodeType::File)).is_ok());
        unlink("rel").unwrap();

        // Through a mount boundary as well.
        mount::mount(None, "/cw/sub", Some("memfs"), None).unwrap();
        setcwd("/cw/sub").unwrap();
        assert_eq!(getcwd().unwrap(), "/cw/sub");
        setcwd("/").unwrap();
        mount::unmount("/cw/sub").unwrap();

        assert_eq!(getcwd().unwrap(), "/");
        unlink("/cw/sub").unwrap();
        unlink("/cw").unwrap();
    }

    #[test]
    fn reclaim_evicts_unused_nodes() {
        let _fs = setup();
        dir_create("/rc").unwrap();
        for i in 0..32 {
            file_create(&alloc::format!("/rc/f{}", i)).unwrap();
        }
        // Touch them so they are cached, then drop every reference.
        for i in 0..32 {
            let _ = lookup(&alloc::format!("/rc/f{}", i), true, None).unwrap();
        }
        let before = node::unused_count();
        assert!(before >= 32);

        crate::lrm::notify(crate::lrm::Pressure::Critical);
        assert_eq!(node::unused_count(), 0);

        // Evicted nodes come back from the driver on demand.
        assert!(lookup("/rc/f0", true, Some(NodeType::File)).is_ok());
        for i in 0..32 {
            unlink(&alloc::format!("/rc/f{}", i)).unwrap();
        }
        unlink("/rc").unwrap();
    }

    #[test]
    fn unused_nodes_splice_back_on_lookup() {
        let _fs = setup();
        file_create("/sp").unwrap();
        let n1 = lookup("/sp", true, None).unwrap();
        let id = n1.id();
        drop(n1);
        // Cached and unused now; a fresh lookup revives the same node.
        let n2 = lookup("/sp", true, None).unwrap();
        assert_eq!(n2.id(), id);
        assert_eq!(n2.refs(), 1);
        drop(n2);
        unlink("/sp").unwrap();
    }

    #[test]
    fn read_only_mount_rejects_writes() {
        let _fs = setup();
        dir_create("/ro").unwrap();
        mount::mount(None, "/ro", Some("memfs"), Some("ro")).unwrap();
        assert_eq!(file_create("/ro/x").unwrap_err(), Status::ReadOnly);
        assert_eq!(dir_create("/ro/d").unwrap_err(), Status::ReadOnly);
        assert_eq!(
            symlink_create("/ro/l", "x").unwrap_err(),
            Status::ReadOnly
        );
        mount::unmount("/ro").unwrap();
        unlink("/ro").unwrap();
    }

    #[test]
    fn reserved_operations() {
        let _fs = setup();
        assert_eq!(link("/a", "/b").unwrap_err(), Status::NotImplemented);
        assert_eq!(rename("/a", "/b").unwrap_err(), Status::NotImplemented);
        assert_eq!(sync().unwrap_err(), Status::NotImplemented);
    }

    #[test]
    fn concurrent_mounts_under_one_parent() {
        let _fs = setup();
        dir_create("/cm").unwrap();
        dir_create("/cm/a").unwrap();
        dir_create("/cm/b").unwrap();
        let t1 = std::thread::spawn(|| mount::mount(None, "/cm/a", Some("memfs"), None));
        let t2 = std::thread::spawn(|| mount::mount(None, "/cm/b", Some("memfs"), None));
        t1.join().unwrap().unwrap();
        t2.join().unwrap().unwrap();
        let a = info("/cm/a", true).unwrap();
        let b = info("/cm/b", true).unwrap();
        assert_ne!(a.mount, b.mount);
        mount::unmount("/cm/a").unwrap();
        mount::unmount("/cm/b").unwrap();
        unlink("/cm/b").unwrap();
        unlink("/cm/a").unwrap();
        unlink("/cm").unwrap();
    }
}
