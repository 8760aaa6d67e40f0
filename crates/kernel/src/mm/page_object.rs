//! Cached data object facade.
//!
//! A filesystem driver's `get_cache` callback hands one of these to the
//! memory-mapping layer: a page-granular view of a file's data. Only the
//! trivial fetch and flush operations are defined here; policy (eviction,
//! write-back scheduling) belongs to the consumer.

use crate::config::PAGE_SIZE;
use crate::klib::error::Result;

pub trait PageObject: Send + Sync {
    /// Current size of the object in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` (one page) with the page at `index`. Short objects zero
    /// the tail.
    fn read_page(&self, index: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<()>;

    /// Write one page back at `index`.
    fn write_page(&self, index: u64, buf: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Flush any dirty state to the backing store.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
