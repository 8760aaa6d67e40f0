//! Per-CPU identity for the allocator fast paths.
//!
//! The scheduler and architecture layer live outside this crate; they
//! install a CPU-id source at bring-up. Until then everything runs as CPU
//! 0. Per-CPU slot arrays are sized for `MAX_CPUS` and each element is
//! padded to its own cache line to avoid false sharing.

use crate::config::MAX_CPUS;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Once;
use static_assertions::const_assert;

pub type CpuIdFn = fn() -> usize;

static CPU_ID_SOURCE: Once<CpuIdFn> = Once::new();
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Install the platform's CPU-id hook. Called once during bring-up, after
/// secondary CPUs are counted.
pub fn set_cpu_id_source(f: CpuIdFn, count: usize) {
    CPU_COUNT.store(count.clamp(1, MAX_CPUS), Ordering::Release);
    CPU_ID_SOURCE.call_once(|| f);
}

pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Id of the CPU this thread is running on.
pub fn current_cpu() -> usize {
    match CPU_ID_SOURCE.get() {
        Some(f) => f() % MAX_CPUS,
        None => default_cpu(),
    }
}

#[cfg(not(test))]
fn default_cpu() -> usize {
    0
}

/// Test builds have no platform hook; spread threads over the slot space
/// so the magazine layer sees real contention.
#[cfg(test)]
fn default_cpu() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    std::thread_local! {
        static SLOT: usize = NEXT.fetch_add(1, Ordering::Relaxed) % MAX_CPUS;
    }
    SLOT.with(|s| *s)
}

/// Pads its contents to a cache line.
#[repr(align(64))]
#[derive(Default)]
pub struct CacheAligned<T>(pub T);

const_assert!(core::mem::align_of::<CacheAligned<u8>>() == 64);

impl<T> Deref for CacheAligned<T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CacheAligned<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_cpu_is_stable_per_thread() {
        let a = current_cpu();
        let b = current_cpu();
        assert_eq!(a, b);
        assert!(a < MAX_CPUS);
    }

    #[test]
    fn aligned_slots_do_not_share_lines() {
        let slots: [CacheAligned<u8>; 4] = Default::default();
        let base = &slots[0] as *const _ as usize;
        let next = &slots[1] as *const _ as usize;
        assert!(next - base >= 64);
    }
}
