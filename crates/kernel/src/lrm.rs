//! Low-resource manager facade.
//!
//! Subsystems that can give memory back register a callback here; the
//! platform's memory monitor calls `notify` with an escalating pressure
//! level. Callbacks run outside the registry lock so a reclaimer may
//! register or unregister others.

use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Pressure {
    /// Memory is getting tight; trim opportunistically.
    Advisory,
    /// Allocations are failing intermittently.
    Low,
    /// The system is about to stall; release everything reclaimable.
    Critical,
}

pub type ReclaimFn = fn(Pressure);

struct Handler {
    name: &'static str,
    func: ReclaimFn,
}

lazy_static! {
    static ref HANDLERS: Mutex<Vec<Handler>> = Mutex::new(Vec::new());
}

/// Register a reclaim callback under a unique name. Re-registering a name
/// replaces the previous callback.
pub fn register(name: &'static str, func: ReclaimFn) {
    let mut handlers = HANDLERS.lock();
    if let Some(h) = handlers.iter_mut().find(|h| h.name == name) {
        h.func = func;
        return;
    }
    handlers.push(Handler { name, func });
}

pub fn unregister(name: &'static str) {
    HANDLERS.lock().retain(|h| h.name != name);
}

/// Dispatch a pressure notification to every registered handler.
pub fn notify(level: Pressure) {
    let snapshot: Vec<ReclaimFn> = HANDLERS.lock().iter().map(|h| h.func).collect();
    for func in snapshot {
        func(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static HITS: AtomicU32 = AtomicU32::new(0);

    fn count_hits(_level: Pressure) {
        HITS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn register_notify_unregister() {
        register("test-hits", count_hits);
        let before = HITS.load(Ordering::Relaxed);
        notify(Pressure::Advisory);
        assert_eq!(HITS.load(Ordering::Relaxed), before + 1);

        // Replacement does not duplicate the handler.
        register("test-hits", count_hits);
        notify(Pressure::Critical);
        assert_eq!(HITS.load(Ordering::Relaxed), before + 2);

        unregister("test-hits");
        notify(Pressure::Low);
        assert_eq!(HITS.load(Ordering::Relaxed), before + 2);
    }
}
