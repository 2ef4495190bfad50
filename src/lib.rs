//! Recurring-timer scheduling engine on a hierarchical bit-mapped wheel.
//!
//! Callers register a callback together with a [`Schedule`] — a pure
//! policy mapping the previous fire time to the next — and the engine
//! re-arms the timer after every fire until cancellation:
//!
//! ```no_run
//! use std::time::Duration;
//! use rewheel::{Every, WheelEngine};
//!
//! let mut engine: WheelEngine = WheelEngine::start();
//!
//! let handle = engine
//!     .schedule_fn(Every::new(Duration::from_secs(1)), || println!("tick"))
//!     .unwrap();
//!
//! // A self-rearming timer is stopped by retrying until cancel reports
//! // success; see TimerHandle::cancel for why a single call is not enough.
//! while !handle.cancel() {}
//! engine.stop();
//! ```
//!
//! Callbacks run on their own fire threads, never on the driver: a slow or
//! stuck callback delays only its own timer. Cancellation is lock-free and
//! never waits on an in-flight callback.

mod engine;
mod gear;
mod schedule;
mod slot;
mod timer;
mod wheel;

pub use engine::{EngineError, WheelEngine};
pub use schedule::{Backoff, Every, Schedule};
pub use timer::TimerHandle;
pub use wheel::{
    DEFAULT_GEARS, DEFAULT_MAX_PROBES, DEFAULT_RESOLUTION_MS, DEFAULT_SLOT_CAP, Wheel,
};

// ============================================================
// Curated engine configurations
// ============================================================

/// Default: 1ms resolution, four gears (~4.6 hour range). ~100KB idle.
pub type PreciseEngine = WheelEngine<4, 1, 32, 8>;

/// Coarse: 16ms resolution, four gears (~3 day range). Heartbeats,
/// session sweeps, anything where millisecond precision is wasted.
pub type CoarseEngine = WheelEngine<4, 16, 16, 8>;

#[macro_export]
macro_rules! define_engine {
    ($name:ident, $num_gears:expr, $resolution_ms:expr, $slot_cap:expr, $max_probes:expr) => {
        pub type $name = $crate::WheelEngine<$num_gears, $resolution_ms, $slot_cap, $max_probes>;
    };
}
