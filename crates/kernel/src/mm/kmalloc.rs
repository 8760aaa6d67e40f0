//! General-purpose allocation over the object caches.
//!
//! A fixed ladder of size classes, each backed by its own cache, serves
//! anything up to the largest class; bigger requests go to the arena
//! directly. Callers hand the size back on free, the same way a layout is
//! handed back to a raw allocator.

use crate::config::{KMALLOC_SIZES, PAGE_SIZE};
use crate::fatal;
use crate::mm::slab::{Cache, CacheFlags};
use crate::mm::{arena, AllocPolicy};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use lazy_static::lazy_static;

const CLASS_NAMES: [&str; 8] = [
    "kmalloc-16",
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1024",
    "kmalloc-2048",
];

const KMALLOC_PRIORITY: u8 = 150;

lazy_static! {
    static ref CLASSES: Vec<Arc<Cache>> = KMALLOC_SIZES
        .iter()
        .zip(CLASS_NAMES)
        .map(|(&size, name)| {
            match Cache::create(
                name,
                size,
                0,
                None,
                None,
                0,
                KMALLOC_PRIORITY,
                CacheFlags::empty(),
                AllocPolicy::BOOT,
            ) {
                Ok(cache) => cache,
                Err(_) => fatal!("kmalloc: cannot create {}", name),
            }
        })
        .collect();
}

fn class_index(size: usize) -> Option<usize> {
    KMALLOC_SIZES.iter().position(|&class| size <= class)
}

/// Force creation of the size-class caches. Called from `mm::init` after
/// the magazine layer is ready.
pub fn init() {
    let _ = CLASSES.len();
}

/// Allocate `size` bytes. Zero-size requests yield `None`.
pub fn kmalloc(size: usize, policy: AllocPolicy) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    match class_index(size) {
        Some(idx) => CLASSES[idx].alloc(policy),
        None => {
            let rounded = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            arena::arena().allocate(rounded, policy)
        }
    }
}

/// Free a kmalloc allocation. `size` must be the size that was requested.
///
/// # Safety
///
/// `ptr` must come from `kmalloc(size, _)` and not have been freed.
pub unsafe fn kfree(ptr: NonNull<u8>, size: usize) {
    match class_index(size) {
        Some(idx) => CLASSES[idx].free(ptr),
        None => {
            let rounded = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            arena::arena().release(ptr, rounded);
        }
    }
}

/// An owned, fixed-length kmalloc buffer.
pub struct KBuf {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for KBuf {}
unsafe impl Sync for KBuf {}

impl KBuf {
    /// Allocate a zero-filled buffer. Zero length yields `None`.
    pub fn alloc(len: usize, policy: AllocPolicy) -> Option<KBuf> {
        let ptr = kmalloc(len, policy)?;
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, len) };
        Some(KBuf { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(self.as_slice()).ok()
    }

    /// Reallocate to `new_len`, preserving the common prefix and zeroing
    /// any tail growth.
    pub fn resized(self, new_len: usize, policy: AllocPolicy) -> Option<KBuf> {
        if new_len == self.len {
            return Some(self);
        }
        let mut grown = KBuf::alloc(new_len, policy)?;
        let keep = self.len.min(new_len);
        grown.as_mut_slice()[..keep].copy_from_slice(&self.as_slice()[..keep]);
        Some(grown)
    }
}

impl Drop for KBuf {
    fn drop(&mut self) {
        unsafe { kfree(self.ptr, self.len) };
    }
}

impl core::fmt::Debug for KBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KBuf").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_routing() {
        assert_eq!(class_index(1), Some(0));
        assert_eq!(class_index(16), Some(0));
        assert_eq!(class_index(17), Some(1));
        assert_eq!(class_index(2048), Some(7));
        assert_eq!(class_index(2049), None);
    }

    #[test]
    fn small_and_huge_round_trips() {
        init();
        let p = kmalloc(100, AllocPolicy::KERNEL).unwrap();
        unsafe {
            core::ptr::write_bytes(p.as_ptr(), 0x5A, 100);
            kfree(p, 100);
        }

        // Above the last class: straight from the arena.
        let p = kmalloc(3 * PAGE_SIZE + 5, AllocPolicy::KERNEL).unwrap();
        unsafe {
            core::ptr::write_bytes(p.as_ptr(), 0x5A, 3 * PAGE_SIZE + 5);
            kfree(p, 3 * PAGE_SIZE + 5);
        }

        assert!(kmalloc(0, AllocPolicy::KERNEL).is_none());
    }

    #[test]
    fn kbuf_is_zeroed_and_resizable() {
        init();
        let buf = KBuf::alloc(64, AllocPolicy::KERNEL).unwrap();
        assert!(buf.as_slice().iter().all(|&b| b == 0));

        let mut buf = buf;
        buf.as_mut_slice()[..5].copy_from_slice(b"hello");
        let grown = buf.resized(256, AllocPolicy::KERNEL).unwrap();
        assert_eq!(&grown.as_slice()[..5], b"hello");
        assert!(grown.as_slice()[5..].iter().all(|&b| b == 0));

        let shrunk = grown.resized(2, AllocPolicy::KERNEL).unwrap();
        assert_eq!(shrunk.as_slice(), b"he");
        assert!(KBuf::alloc(0, AllocPolicy::KERNEL).is_none());
    }
}
