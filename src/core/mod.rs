pub mod clock;
pub mod config;
pub mod console;

// Emulated instruction rate used to convert host time into simulation
// cycles. Both processor models are metered against this clock.
pub const SIM_CLOCK_HZ: u64 = 1_000_000;

// Host interval tick: 10 ms (100 jiffies per second), the rate both the
// KS10 time base and the VAX interval timer advance at.
pub const JIFFY_MS: u64 = 10;
pub const JIFFIES_PER_SEC: u64 = 100;
