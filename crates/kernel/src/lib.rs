//! Memory-management and filesystem core of the silica kernel.
//!
//! Two subsystems live here, with the small utility layers they depend
//! on:
//!
//! - [`mm`]: magazine-enabled slab object caches over an abstract page
//!   arena, plus the kmalloc size-class layer.
//! - [`fs`]: the filesystem node cache and VFS glue: mount tree, path
//!   lookup with symbolic links, handles, and pressure-driven node
//!   reclaim.
//!
//! Architecture bring-up, the scheduler, the block layer, and concrete
//! on-disk filesystems live in their own crates and reach this one
//! through the trait seams (`PageArena`, `FsDriver`, `NodeOps`,
//! `PageObject`) and the hooks in [`cpu`], [`time`] and [`lrm`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Core library (error handling, logging, string helpers)
pub mod klib;
// Compile-time tunables
pub mod config;
// Per-CPU identity and padding
pub mod cpu;
// Monotonic clock facade
pub mod time;
// Low-resource manager facade
pub mod lrm;
// Shared small data structures
pub mod util;
// Memory management
pub mod mm;
// Virtual filesystem
pub mod fs;
// System call interface
pub mod syscall;

pub use klib::error::{Result, Status};

/// Bring the memory and filesystem cores up. Idempotent; the platform
/// layer calls this once the CPU count and timer are known.
pub fn init() {
    static INIT: spin::Once<()> = spin::Once::new();
    INIT.call_once(|| {
        mm::init();
        fs::init();
        crate::kinfo!("core: memory and filesystem subsystems initialized");
    });
}
