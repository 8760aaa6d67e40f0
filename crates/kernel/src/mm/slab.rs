//! Object caches for fixed-size kernel allocations.
//!
//! Design follows Bonwick's slab allocator with the magazine extension:
//!
//! - The **slab layer** carves page-multiple regions from the backing
//!   arena into equal objects. Small objects keep their metadata inside
//!   the region (free-list links live in the objects themselves, the slab
//!   header sits at the end of the page). Large objects get off-slab
//!   headers and per-object buffer-control records indexed by an in-cache
//!   hash table.
//! - The **magazine layer** keeps per-CPU stacks of ready objects so the
//!   common alloc/free pair never touches a shared lock. Magazines cycle
//!   through a per-cache depot; a reaper ages idle magazines back into
//!   the slab layer.
//!
//! Lock ordering inside one cache: the depot lock and the slab lock are
//! never held together, and slab creation drops the slab lock across the
//! arena call. A cache may allocate from another cache (magazine and
//! metadata caches); no cache ever calls into itself.

use crate::config::{
    MAG_CAPACITY, MAG_EMPTY_AGE_MS, MAG_FULL_AGE_MS, MAX_CPUS, MIN_ALIGN, PAGE_SIZE,
    REAP_INTERVAL_MS, SLAB_HASH_BUCKETS, SLAB_LARGE_DIVISOR,
};
use crate::cpu::{self, CacheAligned};
use crate::fatal;
use crate::klib::error::{Result, Status};
use crate::mm::{arena, AllocPolicy};
use crate::time;
use crate::util::random::{Mt19937_64, Random};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::mem::{align_of, size_of};
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

bitflags! {
    /// Cache behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Serve every request from the slab layer. Mandatory for the
        /// magazine cache itself.
        const NO_MAGAZINE = 1 << 0;
        /// Force the off-slab (large object) layout.
        const LARGE = 1 << 1;
        /// Magazine layer requested before the CPU count was known; the
        /// allocator enables it during init.
        const LATE_MAGAZINE = 1 << 2;
    }
}

/// Object constructor, run once when an object leaves the slab layer.
/// The second argument is the `data` word given to `Cache::create`.
pub type CtorFn = fn(*mut u8, usize);
/// Object destructor, run when an object returns to the slab layer.
pub type DtorFn = fn(*mut u8, usize);

/// Free-list link overlaid on the first word of a free small object.
#[repr(C)]
struct FreeObject {
    next: Option<NonNull<FreeObject>>,
}

/// Per-object record for large caches. Free records chain through `next`
/// on their slab's free list; allocated records chain through `next` in
/// the cache's allocation hash table.
#[repr(C)]
struct Bufctl {
    next: Option<NonNull<Bufctl>>,
    object: *mut u8,
    slab: *mut Slab,
}

/// One contiguous arena region carved into objects. For small caches the
/// structure itself lives at the tail of the region; for large caches it
/// comes from the metadata cache.
#[repr(C)]
struct Slab {
    base: *mut u8,
    cache: *const Cache,
    small_free: Option<NonNull<FreeObject>>,
    large_free: Option<NonNull<Bufctl>>,
    refcount: usize,
    color: usize,
}

/// Fixed-capacity stack of object pointers.
struct Magazine {
    rounds: heapless::Vec<*mut u8, MAG_CAPACITY>,
    last_used: u64,
}

unsafe impl Send for Magazine {}

/// Per-CPU magazine pair. The slot mutex stands in for preemption
/// disable: the holder is "running on" this CPU as far as the cache is
/// concerned. `version` detects another thread using the slot while we
/// were suspended in the depot.
#[derive(Default)]
struct PerCpu {
    loaded: Option<NonNull<Magazine>>,
    previous: Option<NonNull<Magazine>>,
    version: u64,
}

unsafe impl Send for PerCpu {}

/// Depot lists. Magazines in the depot are always entirely full or
/// entirely empty.
#[derive(Default)]
struct Depot {
    full: Vec<NonNull<Magazine>>,
    empty: Vec<NonNull<Magazine>>,
}

unsafe impl Send for Depot {}

/// Slab-layer state, guarded by the slab lock.
struct SlabLayer {
    partial: Vec<NonNull<Slab>>,
    full: Vec<NonNull<Slab>>,
    /// Offset of the next slab's first object, stepped by the alignment
    /// and wrapped at `color_max`.
    color_next: usize,
    /// Allocation hash table, large caches only.
    hash: Option<Vec<Option<NonNull<Bufctl>>>>,
    slab_count: usize,
    /// Objects handed out by the slab layer and not yet returned. Counts
    /// rounds resting in magazines.
    live: usize,
}

unsafe impl Send for SlabLayer {}

/// An object cache.
pub struct Cache {
    name: &'static str,
    obj_size: usize,
    align: usize,
    slab_size: usize,
    objs_per_slab: usize,
    color_max: usize,
    large: bool,
    priority: u8,
    ctor: Option<CtorFn>,
    dtor: Option<DtorFn>,
    data: usize,
    flags: CacheFlags,
    mag_enabled: AtomicBool,
    depot: Mutex<Depot>,
    slabs: Mutex<SlabLayer>,
    cpu_slots: Vec<CacheAligned<Mutex<PerCpu>>>,
    destroyed: AtomicBool,
}

unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

/// Point-in-time view of a cache, for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub name: &'static str,
    pub obj_size: usize,
    pub slab_size: usize,
    pub objs_per_slab: usize,
    pub slab_count: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    /// Objects out of the slab layer, including rounds held in magazines.
    pub live_objects: usize,
    pub depot_full: usize,
    pub depot_empty: usize,
}

static MAGAZINES_READY: AtomicBool = AtomicBool::new(false);
static LAST_REAP_MS: AtomicU64 = AtomicU64::new(0);

const INTERNAL_PRIORITY: u8 = 200;
const DEFAULT_PRIORITY: u8 = 128;

lazy_static! {
    /// All caches, ordered by reclaim priority (lower reclaims first).
    static ref CACHES: Mutex<Vec<Arc<Cache>>> = Mutex::new(Vec::new());

    /// Jitter source for slab coloring and reap scheduling.
    static ref SLAB_RNG: Mutex<Mt19937_64> = Mutex::new(Mt19937_64::new(0x51ab_c01d));

    /// Magazine structures. Must bypass the magazine layer itself.
    static ref MAGAZINE_CACHE: Arc<Cache> = Cache::internal(
        "magazine",
        size_of::<Magazine>(),
        align_of::<Magazine>(),
    );

    /// Off-slab headers for large caches.
    static ref SLAB_META_CACHE: Arc<Cache> = Cache::internal(
        "slab_meta",
        size_of::<Slab>(),
        align_of::<Slab>(),
    );

    /// Buffer-control records for large caches.
    static ref BUFCTL_CACHE: Arc<Cache> = Cache::internal(
        "bufctl",
        size_of::<Bufctl>(),
        align_of::<Bufctl>(),
    );
}

/// FNV-1a over the object address, used to bucket bufctls.
fn fnv1a32(addr: usize) -> u32 {
    let mut hash = 0x811c_9dc5u32;
    for byte in addr.to_ne_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Offset of the embedded slab header within a small-cache region.
fn small_header_offset() -> usize {
    (PAGE_SIZE - size_of::<Slab>()) & !(align_of::<Slab>() - 1)
}

impl Cache {
    /// Create an object cache and register it globally.
    ///
    /// `data` is passed through to the constructor and destructor.
    /// `priority` orders reclaim: lower values are reclaimed first.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        name: &'static str,
        size: usize,
        align: usize,
        ctor: Option<CtorFn>,
        dtor: Option<DtorFn>,
        data: usize,
        priority: u8,
        flags: CacheFlags,
        _mmflag: AllocPolicy,
    ) -> Result<Arc<Cache>> {
        if size == 0 || name.is_empty() {
            return Err(Status::InvalidArg);
        }
        if align != 0 && !align.is_power_of_two() {
            return Err(Status::InvalidArg);
        }
        let align = align.max(MIN_ALIGN);
        let obj_size = round_up(size, align);

        let large =
            flags.contains(CacheFlags::LARGE) || obj_size >= PAGE_SIZE / SLAB_LARGE_DIVISOR;

        let (slab_size, objs_per_slab, color_max) = if large {
            let mut slab_size = round_up(obj_size, PAGE_SIZE);
            loop {
                let objs = slab_size / obj_size;
                let waste = slab_size - objs * obj_size;
                if waste <= slab_size / SLAB_LARGE_DIVISOR {
                    break (slab_size, objs, waste);
                }
                slab_size += PAGE_SIZE;
            }
        } else {
            let usable = small_header_offset();
            let objs = usable / obj_size;
            (PAGE_SIZE, objs, usable - objs * obj_size)
        };

        let mut flags = flags;
        if large {
            flags |= CacheFlags::LARGE;
        }
        let mut mag_enabled = !flags.contains(CacheFlags::NO_MAGAZINE);
        if mag_enabled && !MAGAZINES_READY.load(Ordering::Acquire) {
            flags |= CacheFlags::LATE_MAGAZINE;
            mag_enabled = false;
        }

        // Start the color sequence at a random multiple of the alignment
        // so caches created together do not collide on the same sets.
        let color_next = if color_max == 0 {
            0
        } else {
            let steps = (color_max / align) as u64 + 1;
            SLAB_RNG.lock().next_bounded(steps) as usize * align
        };

        let cache = Arc::new(Cache {
            name,
            obj_size,
            align,
            slab_size,
            objs_per_slab,
            color_max,
            large,
            priority,
            ctor,
            dtor,
            data,
            flags,
            mag_enabled: AtomicBool::new(mag_enabled),
            depot: Mutex::new(Depot::default()),
            slabs: Mutex::new(SlabLayer {
                partial: Vec::new(),
                full: Vec::new(),
                color_next,
                hash: large.then(|| alloc::vec![None; SLAB_HASH_BUCKETS]),
                slab_count: 0,
                live: 0,
            }),
            cpu_slots: (0..MAX_CPUS)
                .map(|_| CacheAligned(Mutex::new(PerCpu::default())))
                .collect(),
            destroyed: AtomicBool::new(false),
        });

        let mut caches = CACHES.lock();
        let pos = caches
            .iter()
            .position(|c| c.priority > priority)
            .unwrap_or(caches.len());
        caches.insert(pos, cache.clone());
        drop(caches);

        kdebug_created(&cache);
        Ok(cache)
    }

    fn internal(name: &'static str, size: usize, align: usize) -> Arc<Cache> {
        match Cache::create(
            name,
            size,
            align,
            None,
            None,
            0,
            INTERNAL_PRIORITY,
            CacheFlags::NO_MAGAZINE,
            AllocPolicy::BOOT,
        ) {
            Ok(cache) => cache,
            Err(_) => fatal!("slab: cannot create internal cache {}", name),
        }
    }

    /// Create a cache with default priority and no callbacks.
    pub fn create_simple(name: &'static str, size: usize) -> Result<Arc<Cache>> {
        Cache::create(
            name,
            size,
            0,
            None,
            None,
            0,
            DEFAULT_PRIORITY,
            CacheFlags::empty(),
            AllocPolicy::KERNEL,
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.obj_size
    }

    fn magazines_enabled(&self) -> bool {
        self.mag_enabled.load(Ordering::Acquire)
    }

    // ----- public allocation interface -------------------------------

    /// Allocate one object.
    pub fn alloc(&self, policy: AllocPolicy) -> Option<NonNull<u8>> {
        let obj = if self.magazines_enabled() {
            self.magazine_alloc()
                .or_else(|| self.slab_alloc(policy))
        } else {
            self.slab_alloc(policy)
        };
        if obj.is_none() && policy.contains(AllocPolicy::NO_FAIL) {
            fatal!(
                "cache {}: failed {}-byte allocation marked NO_FAIL",
                self.name,
                self.obj_size
            );
        }
        obj
    }

    /// Free one object.
    ///
    /// # Safety
    ///
    /// `obj` must have come from `alloc` on this cache and not have been
    /// freed since.
    pub unsafe fn free(&self, obj: NonNull<u8>) {
        if self.magazines_enabled() && self.magazine_free(obj) {
            return;
        }
        self.slab_free(obj);
    }

    pub fn stats(&self) -> CacheStats {
        let layer = self.slabs.lock();
        let depot = self.depot.lock();
        CacheStats {
            name: self.name,
            obj_size: self.obj_size,
            slab_size: self.slab_size,
            objs_per_slab: self.objs_per_slab,
            slab_count: layer.slab_count,
            partial_slabs: layer.partial.len(),
            full_slabs: layer.full.len(),
            live_objects: layer.live,
            depot_full: depot.full.len(),
            depot_empty: depot.empty.len(),
        }
    }

    /// Destroy a cache. Aborts if any allocation is still outstanding.
    pub fn destroy(this: &Arc<Cache>) {
        this.purge_magazines();
        {
            let layer = this.slabs.lock();
            if layer.live != 0 {
                fatal!(
                    "cache {}: destroyed with {} live objects",
                    this.name,
                    layer.live
                );
            }
            debug_assert!(layer.partial.is_empty() && layer.full.is_empty());
        }
        this.destroyed.store(true, Ordering::Release);
        CACHES.lock().retain(|c| !Arc::ptr_eq(c, this));
    }

    /// Move every magazine-held round back into the slab layer. Used by
    /// destroy and by CPU offline paths.
    pub fn drain(&self) {
        self.purge_magazines();
    }

    // ----- magazine layer --------------------------------------------

    fn magazine_alloc(&self) -> Option<NonNull<u8>> {
        'restart: loop {
            let cpu = cpu::current_cpu();
            let slot_lock = &self.cpu_slots[cpu].0;
            // Holding the slot lock is this crate's preemption disable:
            // the slot belongs to us until the guard drops.
            let mut guard = slot_lock.lock();
            {
                let slot = &mut *guard;
                loop {
                    if let Some(mut mag) = slot.loaded {
                        if let Some(obj) = unsafe { mag.as_mut() }.rounds.pop() {
                            slot.version = slot.version.wrapping_add(1);
                            return NonNull::new(obj);
                        }
                    }
                    let previous_has_rounds = slot
                        .previous
                        .map(|m| !unsafe { m.as_ref() }.rounds.is_empty())
                        .unwrap_or(false);
                    if previous_has_rounds {
                        core::mem::swap(&mut slot.loaded, &mut slot.previous);
                        continue;
                    }
                    break;
                }
            }

            // Both magazines are empty. The depot call below may suspend,
            // so release the slot and detect interleaving afterwards.
            let version = guard.version;
            drop(guard);

            let full = self.depot.lock().full.pop();

            let mut guard = slot_lock.lock();
            if guard.version != version {
                // Another thread used this CPU while we were away; its
                // magazines may have rounds again. Put ours back.
                if let Some(mag) = full {
                    self.depot_put_full(mag);
                }
                continue 'restart;
            }

            let Some(mut mag) = full else {
                // Depot exhausted; the caller falls back to the slab
                // layer.
                return None;
            };

            let slot = &mut *guard;
            let displaced = core::mem::replace(&mut slot.previous, slot.loaded.take());
            slot.loaded = Some(mag);
            let obj = unsafe { mag.as_mut() }.rounds.pop().unwrap_or_else(|| {
                fatal!("cache {}: empty magazine on depot full list", self.name)
            });
            slot.version = slot.version.wrapping_add(1);
            drop(guard);

            // Deferred because the depot lock may block again.
            if let Some(empty) = displaced {
                self.depot_put_empty(empty);
            }
            return NonNull::new(obj);
        }
    }

    /// Returns false when the object could not be parked in a magazine
    /// and must go back to the slab layer.
    fn magazine_free(&self, obj: NonNull<u8>) -> bool {
        'restart: loop {
            let cpu = cpu::current_cpu();
            let slot_lock = &self.cpu_slots[cpu].0;
            let mut guard = slot_lock.lock();
            {
                let slot = &mut *guard;
                loop {
                    if let Some(mut mag) = slot.loaded {
                        let mag = unsafe { mag.as_mut() };
                        if mag.rounds.len() < MAG_CAPACITY {
                            if mag.rounds.push(obj.as_ptr()).is_err() {
                                fatal!("cache {}: magazine overflow", self.name);
                            }
                            slot.version = slot.version.wrapping_add(1);
                            return true;
                        }
                    }
                    let previous_has_space = slot
                        .previous
                        .map(|m| unsafe { m.as_ref() }.rounds.len() < MAG_CAPACITY)
                        .unwrap_or(false);
                    if previous_has_space {
                        core::mem::swap(&mut slot.loaded, &mut slot.previous);
                        continue;
                    }
                    break;
                }
            }

            let version = guard.version;
            drop(guard);

            // Prefer a recycled empty magazine; fall back to constructing
            // a fresh one. Under memory pressure the atomic allocation
            // fails and the object goes straight to the slab layer.
            let empty = self
                .depot_get_empty()
                .or_else(|| mag_alloc(AllocPolicy::ATOMIC));

            let mut guard = slot_lock.lock();
            if guard.version != version {
                if let Some(mag) = empty {
                    self.depot_put_empty(mag);
                }
                continue 'restart;
            }

            let Some(mut mag) = empty else {
                return false;
            };

            let slot = &mut *guard;
            let displaced = core::mem::replace(&mut slot.previous, slot.loaded.take());
            slot.loaded = Some(mag);
            if unsafe { mag.as_mut() }.rounds.push(obj.as_ptr()).is_err() {
                fatal!("cache {}: fresh magazine not empty", self.name);
            }
            slot.version = slot.version.wrapping_add(1);
            drop(guard);

            if let Some(full) = displaced {
                self.depot_put_full(full);
            }
            return true;
        }
    }

    fn depot_get_empty(&self) -> Option<NonNull<Magazine>> {
        self.depot.lock().empty.pop()
    }

    fn depot_put_full(&self, mut mag: NonNull<Magazine>) {
        let m = unsafe { mag.as_mut() };
        debug_assert_eq!(m.rounds.len(), MAG_CAPACITY);
        m.last_used = time::now_ms();
        self.depot.lock().full.push(mag);
    }

    fn depot_put_empty(&self, mut mag: NonNull<Magazine>) {
        let m = unsafe { mag.as_mut() };
        debug_assert!(m.rounds.is_empty());
        m.last_used = time::now_ms();
        self.depot.lock().empty.push(mag);
    }

    /// Free a magazine and return its rounds to the slab layer.
    fn magazine_destroy(&self, mut mag: NonNull<Magazine>) {
        while let Some(obj) = unsafe { mag.as_mut() }.rounds.pop() {
            if let Some(obj) = NonNull::new(obj) {
                self.slab_free(obj);
            }
        }
        mag_free(mag);
    }

    fn purge_magazines(&self) {
        for slot_lock in &self.cpu_slots {
            let (loaded, previous) = {
                let mut guard = slot_lock.0.lock();
                let slot = &mut *guard;
                slot.version = slot.version.wrapping_add(1);
                (slot.loaded.take(), slot.previous.take())
            };
            if let Some(mag) = loaded {
                self.magazine_destroy(mag);
            }
            if let Some(mag) = previous {
                self.magazine_destroy(mag);
            }
        }
        loop {
            let mag = {
                let mut depot = self.depot.lock();
                depot.full.pop().or_else(|| depot.empty.pop())
            };
            match mag {
                Some(mag) => self.magazine_destroy(mag),
                None => break,
            }
        }
    }

    /// Age idle magazines out of the depot.
    fn reap(&self, now: u64) {
        let mut aged: Vec<NonNull<Magazine>> = Vec::new();
        {
            let mut depot = self.depot.lock();
            depot.full.retain(|&mag| {
                let idle = now.saturating_sub(unsafe { mag.as_ref() }.last_used);
                if idle >= MAG_FULL_AGE_MS {
                    aged.push(mag);
                    false
                } else {
                    true
                }
            });
            depot.empty.retain(|&mag| {
                let idle = now.saturating_sub(unsafe { mag.as_ref() }.last_used);
                if idle >= MAG_EMPTY_AGE_MS {
                    aged.push(mag);
                    false
                } else {
                    true
                }
            });
        }
        // Slab locks are only taken after the depot lock is gone.
        for mag in aged {
            self.magazine_destroy(mag);
        }
    }

    // ----- slab layer ------------------------------------------------

    fn slab_alloc(&self, policy: AllocPolicy) -> Option<NonNull<u8>> {
        loop {
            let mut layer = self.slabs.lock();
            if let Some(&slab) = layer.partial.last() {
                let obj = self.slab_pop(slab, &mut layer);
                drop(layer);
                if let Some(ctor) = self.ctor {
                    // Constructors run outside the slab lock; they may
                    // allocate from other caches.
                    ctor(obj.as_ptr(), self.data);
                }
                return Some(obj);
            }
            drop(layer);

            let slab = self.slab_create(policy)?;
            let mut layer = self.slabs.lock();
            layer.partial.push(slab);
            layer.slab_count += 1;
            // Loop: another CPU may drain the new slab before we re-take
            // the lock, in which case we create again.
        }
    }

    /// Pop one object off a partial slab. Caller holds the slab lock.
    fn slab_pop(&self, mut slab: NonNull<Slab>, layer: &mut SlabLayer) -> NonNull<u8> {
        let s = unsafe { slab.as_mut() };
        let obj = if self.large {
            let Some(mut ctl) = s.large_free else {
                fatal!("cache {}: partial slab with no free objects", self.name);
            };
            let ctl_ref = unsafe { ctl.as_mut() };
            s.large_free = ctl_ref.next;
            let obj = ctl_ref.object;
            // Move the bufctl onto its hash chain.
            let hash = layer.hash.as_mut().expect("large cache has a hash table");
            let bucket = fnv1a32(obj as usize) as usize % SLAB_HASH_BUCKETS;
            ctl_ref.next = hash[bucket];
            hash[bucket] = Some(ctl);
            obj
        } else {
            let Some(head) = s.small_free else {
                fatal!("cache {}: partial slab with no free objects", self.name);
            };
            s.small_free = unsafe { head.as_ref() }.next;
            head.as_ptr() as *mut u8
        };

        s.refcount += 1;
        layer.live += 1;
        if s.refcount == self.objs_per_slab {
            move_slab(&mut layer.partial, &mut layer.full, slab, self.name);
        }
        NonNull::new(obj).unwrap_or_else(|| fatal!("cache {}: null object on free list", self.name))
    }

    fn slab_free(&self, obj: NonNull<u8>) {
        if let Some(dtor) = self.dtor {
            dtor(obj.as_ptr(), self.data);
        }

        let mut layer = self.slabs.lock();
        let mut slab = if self.large {
            self.hash_remove(obj, &mut layer)
        } else {
            self.small_locate(obj, &layer)
        };

        let s = unsafe { slab.as_mut() };
        if s.refcount == 0 {
            fatal!("cache {}: free of {:p} underflows its slab", self.name, obj);
        }
        let was_full = s.refcount == self.objs_per_slab;
        s.refcount -= 1;
        layer.live -= 1;

        let destroy = s.refcount == 0;
        if destroy {
            let list = if was_full {
                &mut layer.full
            } else {
                &mut layer.partial
            };
            remove_slab(list, slab, self.name);
            layer.slab_count -= 1;
        } else if was_full {
            let layer = &mut *layer;
            move_slab(&mut layer.full, &mut layer.partial, slab, self.name);
        }
        drop(layer);

        if destroy {
            self.slab_destroy(slab);
        }
    }

    /// Unlink the bufctl for `obj` from the hash table and thread it back
    /// onto its slab's free list. Aborts on unknown pointers, which also
    /// catches double frees.
    fn hash_remove(&self, obj: NonNull<u8>, layer: &mut SlabLayer) -> NonNull<Slab> {
        let hash = layer.hash.as_mut().expect("large cache has a hash table");
        let bucket = fnv1a32(obj.as_ptr() as usize) as usize % SLAB_HASH_BUCKETS;
        let mut cursor = hash[bucket];
        let mut prev: Option<NonNull<Bufctl>> = None;
        while let Some(mut ctl) = cursor {
            let ctl_ref = unsafe { ctl.as_mut() };
            if ctl_ref.object == obj.as_ptr() {
                match prev {
                    Some(mut p) => unsafe { p.as_mut() }.next = ctl_ref.next,
                    None => hash[bucket] = ctl_ref.next,
                }
                let mut slab = NonNull::new(ctl_ref.slab).unwrap_or_else(|| {
                    fatal!("cache {}: bufctl for {:p} has no slab", self.name, obj)
                });
                let s = unsafe { slab.as_mut() };
                if s.cache != self as *const Cache {
                    fatal!(
                        "cache {}: object {:p} belongs to another cache",
                        self.name,
                        obj
                    );
                }
                ctl_ref.next = s.large_free;
                s.large_free = Some(ctl);
                return slab;
            }
            prev = Some(ctl);
            cursor = ctl_ref.next;
        }
        fatal!(
            "cache {}: invalid or double free of object {:p}",
            self.name,
            obj
        );
    }

    /// Locate the owning slab of a small object, validate it, and push
    /// the object onto the free list. Caller holds the slab lock.
    fn small_locate(&self, obj: NonNull<u8>, _layer: &SlabLayer) -> NonNull<Slab> {
        let base = obj.as_ptr() as usize & !(PAGE_SIZE - 1);
        let header = (base + small_header_offset()) as *mut Slab;
        let mut slab = NonNull::new(header)
            .unwrap_or_else(|| fatal!("cache {}: bad object address {:p}", self.name, obj));
        let s = unsafe { slab.as_mut() };
        if s.cache != self as *const Cache {
            fatal!(
                "cache {}: object {:p} belongs to another cache or was corrupted",
                self.name,
                obj
            );
        }

        // Walk the free list to catch double frees before they corrupt
        // the chain.
        let mut cursor = s.small_free;
        while let Some(link) = cursor {
            if link.as_ptr() as *mut u8 == obj.as_ptr() {
                fatal!("cache {}: double free of object {:p}", self.name, obj);
            }
            cursor = unsafe { link.as_ref() }.next;
        }

        let link = obj.as_ptr() as *mut FreeObject;
        unsafe {
            link.write(FreeObject { next: s.small_free });
            s.small_free = Some(NonNull::new_unchecked(link));
        }
        slab
    }

    /// Allocate and initialize a new slab. Called without the slab lock;
    /// only the color step takes it briefly.
    fn slab_create(&self, policy: AllocPolicy) -> Option<NonNull<Slab>> {
        let base = arena::arena().allocate(self.slab_size, policy)?;

        let color = {
            let mut layer = self.slabs.lock();
            let color = layer.color_next;
            let next = color + self.align;
            layer.color_next = if next > self.color_max { 0 } else { next };
            color
        };

        if self.large {
            self.slab_create_large(base, color, policy)
        } else {
            Some(self.slab_create_small(base, color))
        }
    }

    fn slab_create_small(&self, base: NonNull<u8>, color: usize) -> NonNull<Slab> {
        let header = unsafe { base.as_ptr().add(small_header_offset()) } as *mut Slab;
        // Thread the free list through the objects, last first, so
        // allocation hands them out in address order.
        let mut next: Option<NonNull<FreeObject>> = None;
        for i in (0..self.objs_per_slab).rev() {
            let obj = unsafe { base.as_ptr().add(color + i * self.obj_size) } as *mut FreeObject;
            unsafe {
                obj.write(FreeObject { next });
                next = Some(NonNull::new_unchecked(obj));
            }
        }
        unsafe {
            header.write(Slab {
                base: base.as_ptr(),
                cache: self as *const Cache,
                small_free: next,
                large_free: None,
                refcount: 0,
                color,
            });
            NonNull::new_unchecked(header)
        }
    }

    fn slab_create_large(
        &self,
        base: NonNull<u8>,
        color: usize,
        policy: AllocPolicy,
    ) -> Option<NonNull<Slab>> {
        let header = match SLAB_META_CACHE.alloc(policy) {
            Some(raw) => raw.cast::<Slab>(),
            None => {
                unsafe { arena::arena().release(base, self.slab_size) };
                return None;
            }
        };
        unsafe {
            header.as_ptr().write(Slab {
                base: base.as_ptr(),
                cache: self as *const Cache,
                small_free: None,
                large_free: None,
                refcount: 0,
                color,
            });
        }

        for i in 0..self.objs_per_slab {
            let ctl = match BUFCTL_CACHE.alloc(policy) {
                Some(raw) => raw.cast::<Bufctl>(),
                None => {
                    // Roll back everything built so far.
                    self.release_bufctls(header);
                    unsafe {
                        SLAB_META_CACHE.free(header.cast());
                        arena::arena().release(base, self.slab_size);
                    }
                    return None;
                }
            };
            unsafe {
                let s = header.as_ptr();
                ctl.as_ptr().write(Bufctl {
                    next: (*s).large_free,
                    object: base.as_ptr().add(color + i * self.obj_size),
                    slab: s,
                });
                (*s).large_free = Some(ctl);
            }
        }
        Some(header)
    }

    fn release_bufctls(&self, header: NonNull<Slab>) {
        let mut cursor = unsafe { header.as_ref() }.large_free;
        while let Some(ctl) = cursor {
            cursor = unsafe { ctl.as_ref() }.next;
            unsafe { BUFCTL_CACHE.free(ctl.cast()) };
        }
    }

    /// Return an empty slab's region to the arena. Caller has already
    /// unlinked it; no locks are held.
    fn slab_destroy(&self, header: NonNull<Slab>) {
        let base = unsafe { header.as_ref() }.base;
        debug_assert_eq!(unsafe { header.as_ref() }.refcount, 0);
        if self.large {
            self.release_bufctls(header);
            unsafe { SLAB_META_CACHE.free(header.cast()) };
        }
        let base = NonNull::new(base)
            .unwrap_or_else(|| fatal!("cache {}: slab with null base", self.name));
        unsafe { arena::arena().release(base, self.slab_size) };
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        // Dropping a live cache without destroy() leaks its slabs; log
        // loudly but do not abort inside drop.
        let live = self.slabs.lock().live;
        if live != 0 {
            log::error!("cache {}: dropped with {} live objects", self.name, live);
        }
    }
}

fn move_slab(
    from: &mut Vec<NonNull<Slab>>,
    to: &mut Vec<NonNull<Slab>>,
    slab: NonNull<Slab>,
    name: &str,
) {
    remove_slab(from, slab, name);
    to.push(slab);
}

fn remove_slab(list: &mut Vec<NonNull<Slab>>, slab: NonNull<Slab>, name: &str) {
    match list.iter().position(|&s| s == slab) {
        Some(pos) => {
            list.swap_remove(pos);
        }
        None => fatal!("cache {}: slab list corruption", name),
    }
}

fn kdebug_created(cache: &Cache) {
    log::debug!(
        "slab: created cache {} (size {}, slab {}, {} objects/slab, {})",
        cache.name,
        cache.obj_size,
        cache.slab_size,
        cache.objs_per_slab,
        if cache.large { "large" } else { "small" },
    );
}

/// Allocate and construct an empty magazine.
fn mag_alloc(policy: AllocPolicy) -> Option<NonNull<Magazine>> {
    let raw = MAGAZINE_CACHE.alloc(policy)?;
    let mag = raw.cast::<Magazine>();
    unsafe {
        mag.as_ptr().write(Magazine {
            rounds: heapless::Vec::new(),
            last_used: time::now_ms(),
        });
    }
    Some(mag)
}

fn mag_free(mag: NonNull<Magazine>) {
    debug_assert!(unsafe { mag.as_ref() }.rounds.is_empty());
    unsafe {
        core::ptr::drop_in_place(mag.as_ptr());
        MAGAZINE_CACHE.free(mag.cast());
    }
}

/// Enable the magazine layer. Called once the CPU count is known; caches
/// created earlier asked for magazines with `LATE_MAGAZINE` and are
/// switched on here.
pub fn init() {
    MAGAZINES_READY.store(true, Ordering::Release);
    let caches: Vec<Arc<Cache>> = CACHES.lock().clone();
    for cache in caches {
        if cache.flags.contains(CacheFlags::LATE_MAGAZINE)
            && !cache.flags.contains(CacheFlags::NO_MAGAZINE)
        {
            cache.mag_enabled.store(true, Ordering::Release);
        }
    }
}

/// Periodic maintenance, driven from the timer path roughly every tick.
/// Ages idle magazines out of every depot; effective cadence is
/// `REAP_INTERVAL_MS` with a little jitter so CPUs do not gang up.
pub fn reaper_tick() {
    let now = time::now_ms();
    let last = LAST_REAP_MS.load(Ordering::Acquire);
    let jitter = SLAB_RNG.lock().next_bounded(REAP_INTERVAL_MS / 8);
    if now.saturating_sub(last) < REAP_INTERVAL_MS + jitter {
        return;
    }
    if LAST_REAP_MS
        .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    let caches: Vec<Arc<Cache>> = CACHES.lock().clone();
    for cache in caches {
        cache.reap(now);
    }
}

/// Run `f` over every registered cache in reclaim-priority order.
pub fn for_each_cache(mut f: impl FnMut(&CacheStats)) {
    let caches: Vec<Arc<Cache>> = CACHES.lock().clone();
    for cache in caches {
        f(&cache.stats());
    }
}

// ---------------------------------------------------------------------
// CacheBox: owning typed pointer into a cache
// ---------------------------------------------------------------------

/// A value allocated from a cache, freed back on drop.
///
/// Only valid on caches without constructor or destructor callbacks; the
/// box fully initializes and drops its contents itself.
pub struct CacheBox<T> {
    ptr: NonNull<T>,
    cache: Arc<Cache>,
}

unsafe impl<T: Send> Send for CacheBox<T> {}
unsafe impl<T: Sync> Sync for CacheBox<T> {}

impl<T> CacheBox<T> {
    pub fn new(cache: &Arc<Cache>, value: T, policy: AllocPolicy) -> Result<CacheBox<T>> {
        if size_of::<T>() > cache.obj_size
            || align_of::<T>() > cache.align
            || cache.ctor.is_some()
            || cache.dtor.is_some()
        {
            return Err(Status::InvalidArg);
        }
        let raw = cache.alloc(policy).ok_or(Status::NoMemory)?;
        let ptr = raw.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(CacheBox {
            ptr,
            cache: cache.clone(),
        })
    }
}

impl<T> Deref for CacheBox<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for CacheBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for CacheBox<T> {
    fn drop(&mut self) {
        unsafe {
            core::ptr::drop_in_place(self.ptr.as_ptr());
            self.cache.free(self.ptr.cast());
        }
    }
}
