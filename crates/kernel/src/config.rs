// Compile-time tunables for the memory and filesystem cores.

/// Base page size used by the backing arena. Slab sizes are always a
/// multiple of this.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Highest CPU id + 1. Per-CPU slot arrays are sized statically.
pub const MAX_CPUS: usize = 16;

/// Minimum allocation alignment handed out by any cache.
pub const MIN_ALIGN: usize = 16;

/// Rounds held by one magazine. Power of two, at least 8.
pub const MAG_CAPACITY: usize = 16;

/// Bucket count of the per-cache allocation hash table (large caches only).
pub const SLAB_HASH_BUCKETS: usize = 64;

/// Object size threshold (as a fraction of the slab) above which metadata
/// moves off-slab.
pub const SLAB_LARGE_DIVISOR: usize = 8;

/// Magazine reaper cadence and age thresholds.
pub const REAP_INTERVAL_MS: u64 = 500;
pub const MAG_FULL_AGE_MS: u64 = 5_000;
pub const MAG_EMPTY_AGE_MS: u64 = 20_000;

/// kmalloc size classes. Requests above the last class go straight to the
/// backing arena.
pub const KMALLOC_SIZES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Longest accepted pathname, including the terminator byte.
pub const PATH_MAX: usize = 4096;

/// Longest single path component.
pub const NAME_MAX: usize = 255;

/// Symbolic link nesting allowed during one lookup.
pub const SYMLINK_MAX: u32 = 16;

/// Handles one I/O context may hold open at once.
pub const HANDLE_MAX: u32 = 1024;
