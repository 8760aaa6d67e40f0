//! Monotonic kernel clock.
//!
//! The platform timer advances a single atomic tick counter; consumers
//! only ever read it. Test suites drive the clock by hand, which keeps the
//! magazine aging paths deterministic.

use core::sync::atomic::{AtomicU64, Ordering};

static CLOCK_MS: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since boot.
pub fn now_ms() -> u64 {
    CLOCK_MS.load(Ordering::Acquire)
}

/// Advance the clock. Called from the timer interrupt path.
pub fn advance_ms(delta: u64) {
    CLOCK_MS.fetch_add(delta, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_moves_forward() {
        let before = now_ms();
        advance_ms(25);
        assert!(now_ms() >= before + 25);
    }
}
