// User space memory access helpers
//
// Pointers handed in by user space are validated against the address
// split and copied into kernel memory before anything interprets them.
// Page-fault-aware copies belong to the MMU layer; this is the trusted
// boundary the filesystem calls rely on.

use crate::klib::error::{Result, Status};
use crate::mm::kmalloc::KBuf;
use crate::mm::AllocPolicy;
use alloc::vec::Vec;
use core::ptr;

/// Kernel address space starts here (upper half).
const KERNEL_BASE: usize = 0xFFFF_0000_0000_0000;

fn validate_range(addr: usize, len: usize) -> Result<()> {
    if addr == 0 {
        return Err(Status::InvalidArg);
    }
    let end = addr.checked_add(len).ok_or(Status::InvalidArg)?;
    if addr >= KERNEL_BASE || end >= KERNEL_BASE {
        return Err(Status::InvalidArg);
    }
    Ok(())
}

/// Copy `count` items from user space into a kernel vector.
pub fn copy_from_user<T: Copy>(user: *const T, count: usize) -> Result<Vec<T>> {
    let size = count
        .checked_mul(core::mem::size_of::<T>())
        .ok_or(Status::InvalidArg)?;
    if count == 0 {
        return Ok(Vec::new());
    }
    validate_range(user as usize, size)?;

    let mut buf = Vec::with_capacity(count);
    unsafe {
        ptr::copy_nonoverlapping(user, buf.as_mut_ptr(), count);
        buf.set_len(count);
    }
    Ok(buf)
}

/// Copy a kernel slice out to user space.
pub fn copy_to_user<T: Copy>(user: *mut T, data: &[T]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    validate_range(user as usize, core::mem::size_of_val(data))?;
    unsafe {
        ptr::copy_nonoverlapping(data.as_ptr(), user, data.len());
    }
    Ok(())
}

/// Copy one value out to user space. A null pointer is allowed and means
/// the caller does not want the value.
pub fn put_user<T: Copy>(user: *mut T, value: T) -> Result<()> {
    if user.is_null() {
        return Ok(());
    }
    copy_to_user(user, core::slice::from_ref(&value))
}

/// Duplicate a NUL-terminated user string into kmalloc storage, bounded
/// by `max` bytes including the terminator.
pub fn strndup_from_user(user: *const u8, max: usize) -> Result<KBuf> {
    validate_range(user as usize, 1)?;
    let mut len = 0usize;
    unsafe {
        while len < max {
            if ptr::read(user.add(len)) == 0 {
                break;
            }
            len += 1;
        }
    }
    if len == max {
        // No terminator within bounds.
        return Err(Status::InvalidArg);
    }
    if len == 0 {
        return Err(Status::InvalidArg);
    }
    validate_range(user as usize, len)?;
    let mut buf = KBuf::alloc(len, AllocPolicy::KERNEL).ok_or(Status::NoMemory)?;
    unsafe {
        ptr::copy_nonoverlapping(user, buf.as_mut_slice().as_mut_ptr(), len);
    }
    Ok(buf)
}

/// Like `strndup_from_user` but validated as UTF-8 for path use.
pub fn path_from_user(user: *const u8, max: usize) -> Result<KBuf> {
    let buf = strndup_from_user(user, max)?;
    if buf.as_str().is_none() {
        return Err(Status::FormatInvalid);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        crate::mm::init();
        let src = [1u32, 2, 3, 4];
        let copied = copy_from_user(src.as_ptr(), 4).unwrap();
        assert_eq!(copied, src);

        let mut dst = [0u32; 4];
        copy_to_user(dst.as_mut_ptr(), &copied).unwrap();
        assert_eq!(dst, src);

        assert!(copy_from_user::<u8>(core::ptr::null(), 1).is_err());
        assert!(copy_from_user::<u8>(KERNEL_BASE as *const u8, 1).is_err());
        assert!(copy_from_user::<u8>(core::ptr::null(), 0).is_ok());
    }

    #[test]
    fn string_duplication() {
        crate::mm::init();
        let raw = b"hello\0world";
        let s = strndup_from_user(raw.as_ptr(), 64).unwrap();
        assert_eq!(s.as_slice(), b"hello");

        // Unterminated within the bound.
        let raw = b"abcdef";
        assert_eq!(
            strndup_from_user(raw.as_ptr(), 4).unwrap_err(),
            Status::InvalidArg
        );

        // Empty strings are rejected.
        let raw = b"\0";
        assert_eq!(
            strndup_from_user(raw.as_ptr(), 64).unwrap_err(),
            Status::InvalidArg
        );
    }
}
