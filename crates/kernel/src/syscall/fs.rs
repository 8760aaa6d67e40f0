//! Filesystem system calls.
//!
//! Thin shims over the VFS: every string crosses the user boundary
//! through `uaccess`, results go back through `put_user`/`copy_to_user`,
//! and statuses pass through untouched. Handle identifiers index the
//! calling context's handle table.

use crate::config::PATH_MAX;
use crate::fs::{self, HandleFlags, HandleId, NodeInfo, SeekAction};
use crate::klib::error::{Result, Status};
use crate::mm::kmalloc::KBuf;
use crate::syscall::uaccess;
use alloc::vec;
use alloc::vec::Vec;

/// Access rights requested at open time.
pub const RIGHT_READ: u32 = 1 << 0;
pub const RIGHT_WRITE: u32 = 1 << 1;

/// Open flags.
pub const FLAG_APPEND: u32 = 1 << 0;
pub const FLAG_NONBLOCK: u32 = 1 << 1;

fn path_arg(user: *const u8) -> Result<KBuf> {
    uaccess::path_from_user(user, PATH_MAX)
}

fn opt_path_arg(user: *const u8) -> Result<Option<KBuf>> {
    if user.is_null() {
        Ok(None)
    } else {
        path_arg(user).map(Some)
    }
}

fn str_of(buf: &KBuf) -> Result<&str> {
    buf.as_str().ok_or(Status::FormatInvalid)
}

fn open_flags(rights: u32, flags: u32) -> HandleFlags {
    let mut hf = HandleFlags::empty();
    if rights & RIGHT_READ != 0 {
        hf |= HandleFlags::READ;
    }
    if rights & RIGHT_WRITE != 0 {
        hf |= HandleFlags::WRITE;
    }
    if flags & FLAG_APPEND != 0 {
        hf |= HandleFlags::APPEND;
    }
    if flags & FLAG_NONBLOCK != 0 {
        hf |= HandleFlags::NONBLOCK;
    }
    hf
}

pub fn fs_file_create(path: *const u8) -> Result<()> {
    let path = path_arg(path)?;
    fs::file_create(str_of(&path)?)
}

pub fn fs_file_open(
    path: *const u8,
    rights: u32,
    flags: u32,
    out_handle: *mut HandleId,
) -> Result<()> {
    if out_handle.is_null() {
        return Err(Status::InvalidArg);
    }
    let path = path_arg(path)?;
    let handle = fs::file_open(str_of(&path)?, open_flags(rights, flags))?;
    uaccess::put_user(out_handle, handle)
}

pub fn fs_file_read(
    handle: HandleId,
    buf: *mut u8,
    count: usize,
    out_bytes: *mut usize,
) -> Result<()> {
    let mut kbuf = vec![0u8; count];
    match fs::file_read(handle, &mut kbuf) {
        Ok(n) => {
            uaccess::copy_to_user(buf, &kbuf[..n])?;
            uaccess::put_user(out_bytes, n)
        }
        Err(status) => {
            let _ = uaccess::put_user(out_bytes, 0);
            Err(status)
        }
    }
}

pub fn fs_file_pread(
    handle: HandleId,
    buf: *mut u8,
    count: usize,
    offset: u64,
    out_bytes: *mut usize,
) -> Result<()> {
    let mut kbuf = vec![0u8; count];
    match fs::file_pread(handle, &mut kbuf, offset) {
        Ok(n) => {
            uaccess::copy_to_user(buf, &kbuf[..n])?;
            uaccess::put_user(out_bytes, n)
        }
        Err(status) => {
            let _ = uaccess::put_user(out_bytes, 0);
            Err(status)
        }
    }
}

pub fn fs_file_write(
    handle: HandleId,
    buf: *const u8,
    count: usize,
    out_bytes: *mut usize,
) -> Result<()> {
    let kbuf = uaccess::copy_from_user(buf, count)?;
    match fs::file_write(handle, &kbuf) {
        Ok(n) => uaccess::put_user(out_bytes, n),
        Err(status) => {
            let _ = uaccess::put_user(out_bytes, 0);
            Err(status)
        }
    }
}

pub fn fs_file_pwrite(
    handle: HandleId,
    buf: *const u8,
    count: usize,
    offset: u64,
    out_bytes: *mut usize,
) -> Result<()> {
    let kbuf = uaccess::copy_from_user(buf, count)?;
    match fs::file_pwrite(handle, &kbuf, offset) {
        Ok(n) => uaccess::put_user(out_bytes, n),
        Err(status) => {
            let _ = uaccess::put_user(out_bytes, 0);
            Err(status)
        }
    }
}

pub fn fs_file_resize(handle: HandleId, size: u64) -> Result<()> {
    fs::file_resize(handle, size)
}

pub fn fs_dir_create(path: *const u8) -> Result<()> {
    let path = path_arg(path)?;
    fs::dir_create(str_of(&path)?)
}

pub fn fs_dir_open(
    path: *const u8,
    rights: u32,
    flags: u32,
    out_handle: *mut HandleId,
) -> Result<()> {
    if out_handle.is_null() {
        return Err(Status::InvalidArg);
    }
    let path = path_arg(path)?;
    let handle = fs::dir_open(str_of(&path)?, open_flags(rights, flags))?;
    uaccess::put_user(out_handle, handle)
}

/// Read the next directory entry into `buf` as a packed record:
/// node ID (u64), mount ID (u16), name length (u16), the name bytes and
/// a NUL. `TooSmall` if the record does not fit; `NotFound` past the
/// last entry.
pub fn fs_dir_read(handle: HandleId, buf: *mut u8, size: usize) -> Result<()> {
    let entry = fs::dir_read(handle)?;
    let name = entry.name.as_bytes();
    let record_len = 8 + 2 + 2 + name.len() + 1;
    if record_len > size {
        // Rewind so the entry is not consumed by a failed read.
        let _ = fs::handle_seek(handle, SeekAction::Add, -1);
        return Err(Status::TooSmall);
    }
    let mut record: Vec<u8> = Vec::with_capacity(record_len);
    record.extend_from_slice(&entry.id.to_ne_bytes());
    record.extend_from_slice(&entry.mount.to_ne_bytes());
    record.extend_from_slice(&(name.len() as u16).to_ne_bytes());
    record.extend_from_slice(name);
    record.push(0);
    uaccess::copy_to_user(buf, &record)
}

pub fn fs_handle_seek(
    handle: HandleId,
    action: u32,
    offset: i64,
    out_new: *mut i64,
) -> Result<()> {
    let action = SeekAction::from_raw(action).ok_or(Status::InvalidArg)?;
    let new = fs::handle_seek(handle, action, offset)?;
    uaccess::put_user(out_new, new)
}

pub fn fs_handle_info(handle: HandleId, out_info: *mut NodeInfo) -> Result<()> {
    if out_info.is_null() {
        return Err(Status::InvalidArg);
    }
    let info = fs::handle_info(handle)?;
    uaccess::put_user(out_info, info)
}

pub fn fs_handle_sync(handle: HandleId) -> Result<()> {
    fs::handle_sync(handle)
}

pub fn fs_handle_close(handle: HandleId) -> Result<()> {
    fs::handle_close(handle)
}

pub fn fs_symlink_create(path: *const u8, target: *const u8) -> Result<()> {
    let path = path_arg(path)?;
    let target = path_arg(target)?;
    fs::symlink_create(str_of(&path)?, str_of(&target)?)
}

/// Read a symbolic link's destination. `TooSmall` is returned without a
/// truncated copy; the buffer gets the full string and a NUL or nothing.
pub fn fs_symlink_read(path: *const u8, buf: *mut u8, size: usize) -> Result<()> {
    let path = path_arg(path)?;
    let target = fs::symlink_read(str_of(&path)?)?;
    if target.len() + 1 > size {
        return Err(Status::TooSmall);
    }
    let mut out: Vec<u8> = Vec::with_capacity(target.len() + 1);
    out.extend_from_slice(target.as_bytes());
    out.push(0);
    uaccess::copy_to_user(buf, &out)
}

pub fn fs_mount(
    device: *const u8,
    path: *const u8,
    fs_type: *const u8,
    options: *const u8,
) -> Result<()> {
    let device = opt_path_arg(device)?;
    let path = path_arg(path)?;
    let fs_type = opt_path_arg(fs_type)?;
    let options = opt_path_arg(options)?;

    let device = match &device {
        Some(d) => Some(fs::DeviceHandle {
            path: alloc::string::String::from(str_of(d)?),
        }),
        None => None,
    };
    let fs_type = match &fs_type {
        Some(t) => Some(str_of(t)?),
        None => None,
    };
    let options = match &options {
        Some(o) => Some(str_of(o)?),
        None => None,
    };
    fs::mount(device, str_of(&path)?, fs_type, options)
}

pub fn fs_unmount(path: *const u8) -> Result<()> {
    let path = path_arg(path)?;
    fs::unmount(str_of(&path)?)
}

pub fn fs_info(path: *const u8, follow: bool, out_info: *mut NodeInfo) -> Result<()> {
    if out_info.is_null() {
        return Err(Status::InvalidArg);
    }
    let path = path_arg(path)?;
    let info = fs::info(str_of(&path)?, follow)?;
    uaccess::put_user(out_info, info)
}

pub fn fs_getcwd(buf: *mut u8, size: usize) -> Result<()> {
    let cwd = fs::getcwd()?;
    if cwd.len() + 1 > size {
        return Err(Status::TooSmall);
    }
    let mut out: Vec<u8> = Vec::with_capacity(cwd.len() + 1);
    out.extend_from_slice(cwd.as_bytes());
    out.push(0);
    uaccess::copy_to_user(buf, &out)
}

pub fn fs_setcwd(path: *const u8) -> Result<()> {
    let path = path_arg(path)?;
    fs::setcwd(str_of(&path)?)
}

pub fn fs_setroot(path: *const u8) -> Result<()> {
    let path = path_arg(path)?;
    fs::setroot(str_of(&path)?)
}

pub fn fs_unlink(path: *const u8) -> Result<()> {
    let path = path_arg(path)?;
    fs::unlink(str_of(&path)?)
}

pub fn fs_link(_src: *const u8, _dst: *const u8) -> Result<()> {
    Err(Status::NotImplemented)
}

pub fn fs_rename(_src: *const u8, _dst: *const u8) -> Result<()> {
    Err(Status::NotImplemented)
}

pub fn fs_sync() -> Result<()> {
    Err(Status::NotImplemented)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::test_support::setup;

    fn cstr(s: &str) -> Vec<u8> {
        let mut v = Vec::from(s.as_bytes());
        v.push(0);
        v
    }

    #[test]
    fn file_lifecycle_via_syscalls() {
        let _fs = setup();
        let path = cstr("/sc_a");
        fs_file_create(path.as_ptr()).unwrap();

        let mut handle: HandleId = 0;
        fs_file_open(
            path.as_ptr(),
            RIGHT_READ | RIGHT_WRITE,
            0,
            &mut handle,
        )
        .unwrap();

        let mut written = 0usize;
        fs_file_write(handle, b"hello".as_ptr(), 5, &mut written).unwrap();
        assert_eq!(written, 5);

        let mut new_offset = 0i64;
        fs_handle_seek(handle, 0, 0, &mut new_offset).unwrap();
        assert_eq!(new_offset, 0);

        let mut buf = [0u8; 5];
        let mut read = 0usize;
        fs_file_read(handle, buf.as_mut_ptr(), 5, &mut read).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf, b"hello");

        let mut info = fs::NodeInfo {
            id: 0,
            mount: 0,
            ntype: fs::NodeType::Other,
            size: 0,
            links: 0,
            block_size: 0,
        };
        fs_handle_info(handle, &mut info).unwrap();
        assert_eq!(info.ntype, fs::NodeType::File);
        assert_eq!(info.size, 5);

        fs_handle_sync(handle).unwrap();
        fs_handle_close(handle).unwrap();
        assert_eq!(
            fs_handle_close(handle).unwrap_err(),
            Status::InvalidHandle
        );
        fs_unlink(path.as_ptr()).unwrap();
    }

    #[test]
    fn pread_pwrite_via_syscalls() {
        let _fs = setup();
        let path = cstr("/sc_pp");
        fs_file_create(path.as_ptr()).unwrap();
        let mut handle: HandleId = 0;
        fs_file_open(path.as_ptr(), RIGHT_READ | RIGHT_WRITE, 0, &mut handle).unwrap();

        let mut n = 0usize;
        fs_file_pwrite(handle, b"abcdef".as_ptr(), 6, 0, &mut n).unwrap();
        assert_eq!(n, 6);
        let mut buf = [0u8; 3];
        fs_file_pread(handle, buf.as_mut_ptr(), 3, 2, &mut n).unwrap();
        assert_eq!(&buf, b"cde");

        fs_file_resize(handle, 2).unwrap();
        let mut info = fs::NodeInfo {
            id: 0,
            mount: 0,
            ntype: fs::NodeType::Other,
            size: 0,
            links: 0,
            block_size: 0,
        };
        fs_handle_info(handle, &mut info).unwrap();
        assert_eq!(info.size, 2);

        fs_handle_close(handle).unwrap();
        fs_unlink(path.as_ptr()).unwrap();
    }

    #[test]
    fn dir_read_records() {
        let _fs = setup();
        fs_dir_create(cstr("/sc_d").as_ptr()).unwrap();
        fs_file_create(cstr("/sc_d/child").as_ptr()).unwrap();

        let mut handle: HandleId = 0;
        fs_dir_open(cstr("/sc_d").as_ptr(), RIGHT_READ, 0, &mut handle).unwrap();

        let mut names = Vec::new();
        let mut record = [0u8; 64];
        loop {
            match fs_dir_read(handle, record.as_mut_ptr(), record.len()) {
                Ok(()) => {
                    let name_len =
                        u16::from_ne_bytes([record[10], record[11]]) as usize;
                    let name =
                        core::str::from_utf8(&record[12..12 + name_len]).unwrap();
                    assert_eq!(record[12 + name_len], 0);
                    names.push(alloc::string::String::from(name));
                }
                Err(Status::NotFound) => break,
                Err(status) => panic!("dir read failed: {:?}", status),
            }
        }
        assert!(names.iter().any(|n| n == "child"));
        assert!(names.iter().any(|n| n == "."));
        assert!(names.iter().any(|n| n == ".."));

        // An undersized buffer reports TooSmall without advancing.
        let mut seek_out = 0i64;
        fs_handle_seek(handle, 0, 0, &mut seek_out).unwrap();
        let mut tiny = [0u8; 4];
        assert_eq!(
            fs_dir_read(handle, tiny.as_mut_ptr(), tiny.len()).unwrap_err(),
            Status::TooSmall
        );

        fs_handle_close(handle).unwrap();
        fs_unlink(cstr("/sc_d/child").as_ptr()).unwrap();
        fs_unlink(cstr("/sc_d").as_ptr()).unwrap();
    }

    #[test]
    fn symlink_read_does_not_truncate() {
        let _fs = setup();
        fs_dir_create(cstr("/sc_l").as_ptr()).unwrap();
        fs_symlink_create(cstr("/sc_l/ln").as_ptr(), cstr("destination").as_ptr()).unwrap();

        let mut buf = [0u8; 64];
        fs_symlink_read(cstr("/sc_l/ln").as_ptr(), buf.as_mut_ptr(), buf.len()).unwrap();
        assert_eq!(&buf[..12], b"destination\0");

        let mut tiny = [0xAAu8; 4];
        assert_eq!(
            fs_symlink_read(cstr("/sc_l/ln").as_ptr(), tiny.as_mut_ptr(), tiny.len())
                .unwrap_err(),
            Status::TooSmall
        );
        // Nothing was written.
        assert_eq!(tiny, [0xAA; 4]);

        fs_unlink(cstr("/sc_l/ln").as_ptr()).unwrap();
        fs_unlink(cstr("/sc_l").as_ptr()).unwrap();
    }

    #[test]
    fn getcwd_too_small() {
        let _fs = setup();
        fs_setcwd(cstr("/").as_ptr()).unwrap();
        let mut buf = [0u8; 8];
        fs_getcwd(buf.as_mut_ptr(), buf.len()).unwrap();
        assert_eq!(&buf[..2], b"/\0");
        let mut tiny = [0u8; 1];
        assert_eq!(
            fs_getcwd(tiny.as_mut_ptr(), 1).unwrap_err(),
            Status::TooSmall
        );
    }

    #[test]
    fn mount_via_syscalls_and_stubs() {
        let _fs = setup();
        fs_dir_create(cstr("/sc_m").as_ptr()).unwrap();
        fs_mount(
            core::ptr::null(),
            cstr("/sc_m").as_ptr(),
            cstr("memfs").as_ptr(),
            cstr("ro").as_ptr(),
        )
        .unwrap();
        assert_eq!(
            fs_file_create(cstr("/sc_m/x").as_ptr()).unwrap_err(),
            Status::ReadOnly
        );
        fs_unmount(cstr("/sc_m").as_ptr()).unwrap();
        fs_unlink(cstr("/sc_m").as_ptr()).unwrap();

        assert_eq!(fs_sync().unwrap_err(), Status::NotImplemented);
        assert_eq!(
            fs_link(cstr("/a").as_ptr(), cstr("/b").as_ptr()).unwrap_err(),
            Status::NotImplemented
        );
        assert_eq!(
            fs_rename(cstr("/a").as_ptr(), cstr("/b").as_ptr()).unwrap_err(),
            Status::NotImplemented
        );

        // Unknown type and bad arguments.
        assert_eq!(
            fs_mount(
                core::ptr::null(),
                cstr("/sc_m").as_ptr(),
                cstr("nosuchfs").as_ptr(),
                core::ptr::null(),
            )
            .unwrap_err(),
            Status::UnknownFs
        );
        assert_eq!(
            fs_mount(
                core::ptr::null(),
                cstr("/sc_m").as_ptr(),
                core::ptr::null(),
                core::ptr::null(),
            )
            .unwrap_err(),
            Status::InvalidArg
        );
    }
}
