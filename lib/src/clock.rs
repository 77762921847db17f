//! Global tick counter.
//!
//! The timer interrupt advances one global tick count; everything with a
//! timeout (semaphores, reassembly contexts, TCP retransmission) measures
//! time in these ticks. The tick rate is [`crate::ports::TICK_FREQUENCY_HZ`].

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Advance the clock by one tick. Called from the timer interrupt only.
#[inline]
pub fn tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Ticks since boot.
#[inline]
pub fn uptime_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Reset the clock. Test hook only.
pub fn reset_for_tests() {
    TICKS.store(0, Ordering::Relaxed);
}
