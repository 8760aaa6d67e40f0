//! Backing arena facade.
//!
//! The slab layer obtains whole slabs (page-aligned, page-multiple
//! regions) from here and returns them here. The real kernel arena lives
//! outside this crate; `HeapArena` adapts the global allocator so the
//! subsystem runs hosted and during early bring-up.

use crate::config::PAGE_SIZE;
use crate::mm::AllocPolicy;
use core::alloc::Layout;
use core::ptr::NonNull;
use spin::Once;

/// Allocator of page-aligned, page-multiple regions.
pub trait PageArena: Send + Sync {
    /// Allocate `size` bytes (a multiple of the page size). Returns `None`
    /// when the arena cannot satisfy the request under `policy`.
    fn allocate(&self, size: usize, policy: AllocPolicy) -> Option<NonNull<u8>>;

    /// Return a region previously obtained from `allocate`.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must exactly match a live allocation.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

/// Arena backed by the global heap allocator.
pub struct HeapArena;

impl PageArena for HeapArena {
    fn allocate(&self, size: usize, _policy: AllocPolicy) -> Option<NonNull<u8>> {
        debug_assert!(size % PAGE_SIZE == 0);
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        NonNull::new(unsafe { alloc::alloc::alloc(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align_unchecked(size, PAGE_SIZE);
        alloc::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

static HEAP_ARENA: HeapArena = HeapArena;
static ARENA: Once<&'static dyn PageArena> = Once::new();

/// Install the platform arena. May only be called once, before the first
/// slab is created.
pub fn set_arena(arena: &'static dyn PageArena) {
    ARENA.call_once(|| arena);
}

pub(crate) fn arena() -> &'static dyn PageArena {
    match ARENA.get() {
        Some(a) => *a,
        None => &HEAP_ARENA,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_arena_round_trip() {
        let region = HEAP_ARENA
            .allocate(2 * PAGE_SIZE, AllocPolicy::KERNEL)
            .unwrap();
        assert_eq!(region.as_ptr() as usize % PAGE_SIZE, 0);
        unsafe {
            core::ptr::write_bytes(region.as_ptr(), 0xA5, 2 * PAGE_SIZE);
            HEAP_ARENA.release(region, 2 * PAGE_SIZE);
        }
    }
}
