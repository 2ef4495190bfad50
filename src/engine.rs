use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::schedule::Schedule;
use crate::timer::{BoxedSchedule, Callback, TimerCore, TimerHandle};
use crate::wheel::{
    DEFAULT_GEARS, DEFAULT_MAX_PROBES, DEFAULT_RESOLUTION_MS, DEFAULT_SLOT_CAP, Wheel,
};

/// Longest the driver parks while the wheel is idle. A new registration
/// wakes it through the channel regardless.
const MAX_PARK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Scheduling against a stopped engine is fatal misuse, surfaced
    /// immediately and never retried internally.
    #[error("engine is not running")]
    NotRunning,
}

enum Command {
    Register { core: Arc<TimerCore>, when: Instant },
    Shutdown,
}

struct EngineShared {
    tx: Sender<Command>,
    running: AtomicBool,
}

impl EngineShared {
    fn register(&self, core: Arc<TimerCore>, when: Instant) -> Result<(), EngineError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }

        self.tx
            .send(Command::Register { core, when })
            .map_err(|_| EngineError::NotRunning)
    }
}

/// Recurring-timer scheduling engine.
///
/// Owns a hierarchical [`Wheel`] on a dedicated driver thread. The driver
/// parks until the next deadline (or an incoming registration), advances
/// the wheel, and dispatches each due, still-live timer onto its own fire
/// thread — callbacks never run on, and never block, the driver.
///
/// Engines are explicit instances: construct as many as needed, stop each
/// independently. Dropping an engine shuts its driver down.
///
/// ```ignore
/// let engine: WheelEngine = WheelEngine::start();
/// let handle = engine.schedule_fn(Every::new(Duration::from_secs(1)), || {
///     println!("tick");
/// })?;
/// // ...
/// while !handle.cancel() {}
/// ```
pub struct WheelEngine<
    const NUM_GEARS: usize = DEFAULT_GEARS,
    const RESOLUTION_MS: u64 = DEFAULT_RESOLUTION_MS,
    const SLOT_CAP: usize = DEFAULT_SLOT_CAP,
    const MAX_PROBES: usize = DEFAULT_MAX_PROBES,
> {
    shared: Arc<EngineShared>,
    driver: Option<JoinHandle<()>>,
}

impl<
    const NUM_GEARS: usize,
    const RESOLUTION_MS: u64,
    const SLOT_CAP: usize,
    const MAX_PROBES: usize,
> WheelEngine<NUM_GEARS, RESOLUTION_MS, SLOT_CAP, MAX_PROBES>
{
    /// Start an engine whose wheel epoch is "now".
    pub fn start() -> Self {
        Self::start_with_epoch(Instant::now())
    }

    pub fn start_with_epoch(epoch: Instant) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(EngineShared {
            tx,
            running: AtomicBool::new(true),
        });

        let driver_shared = Arc::clone(&shared);
        let driver = thread::Builder::new()
            .name("rewheel-driver".into())
            .spawn(move || Self::drive(epoch, rx, driver_shared))
            .expect("failed to spawn rewheel driver thread");

        Self {
            shared,
            driver: Some(driver),
        }
    }

    /// Register `callback` to fire according to `schedule`.
    ///
    /// The first fire time is `schedule.next(now)`; after each fire the
    /// timer re-arms itself from its last scheduled time until the
    /// returned handle reports a successful [`cancel`](TimerHandle::cancel).
    pub fn schedule_fn<S, F>(&self, schedule: S, callback: F) -> Result<TimerHandle, EngineError>
    where
        S: Schedule + Send + Sync + 'static,
        F: FnMut() + Send + 'static,
    {
        self.schedule_boxed(Box::new(schedule), Box::new(callback))
    }

    fn schedule_boxed(
        &self,
        schedule: BoxedSchedule,
        callback: Callback,
    ) -> Result<TimerHandle, EngineError> {
        let first = schedule.next(Instant::now());
        let core = TimerCore::new(schedule, callback, first);

        self.shared.register(Arc::clone(&core), first)?;
        Ok(TimerHandle::new(core))
    }

    /// Stop the driver and wait for it to exit.
    ///
    /// Pending timers are dropped; in-flight callbacks run to completion
    /// on their fire threads and their re-arm registrations are rejected.
    /// Idempotent; scheduling afterwards reports
    /// [`EngineError::NotRunning`].
    pub fn stop(&mut self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            let _ = self.shared.tx.send(Command::Shutdown);
        }

        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
    }

    fn drive(epoch: Instant, rx: Receiver<Command>, shared: Arc<EngineShared>) {
        let mut wheel: Wheel<Arc<TimerCore>, NUM_GEARS, RESOLUTION_MS, SLOT_CAP, MAX_PROBES> =
            Wheel::with_epoch(epoch);

        debug!("timer driver started");

        loop {
            let park = wheel.duration_until_next().unwrap_or(MAX_PARK).min(MAX_PARK);

            match rx.recv_timeout(park) {
                Ok(Command::Register { core, when }) => {
                    if core.is_cancelled() {
                        trace!("dropping registration of cancelled timer");
                    } else {
                        wheel.insert(when, core);
                    }
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let fired = wheel.poll(Instant::now(), |core| Self::dispatch(core, &shared));
            if fired > 0 {
                trace!(fired, "dispatched due timers");
            }
        }

        debug!(pending = wheel.len(), "timer driver stopped");
    }

    /// Claim a due timer and hand it to its own fire thread.
    fn dispatch(core: Arc<TimerCore>, shared: &Arc<EngineShared>) {
        if !core.claim() {
            // Lazy deletion: a cancel won while the entry sat in the wheel.
            trace!("skipping cancelled timer at dispatch");
            return;
        }

        let shared = Arc::clone(shared);
        thread::Builder::new()
            .name("rewheel-fire".into())
            .spawn(move || {
                if let Some(next) = core.fire() {
                    if shared.register(core, next).is_err() {
                        debug!("engine stopped; timer will not re-arm");
                    }
                }
            })
            .expect("failed to spawn rewheel fire thread");
    }
}

impl<
    const NUM_GEARS: usize,
    const RESOLUTION_MS: u64,
    const SLOT_CAP: usize,
    const MAX_PROBES: usize,
> Drop for WheelEngine<NUM_GEARS, RESOLUTION_MS, SLOT_CAP, MAX_PROBES>
{
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicUsize;

    use crate::schedule::Every;

    fn counting<F>(count: &Arc<AtomicUsize>, mut extra: F) -> impl FnMut() + Send + 'static
    where
        F: FnMut(usize) + Send + 'static,
    {
        let count = Arc::clone(count);
        move || {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            extra(n);
        }
    }

    // ==================== Cancel Before First Fire ====================

    #[test]
    fn cancel_before_first_fire_never_runs_callback() {
        let mut engine: WheelEngine = WheelEngine::start();
        let count = Arc::new(AtomicUsize::new(0));

        let handle = engine
            .schedule_fn(Every::new(Duration::from_millis(50)), counting(&count, |_| {}))
            .unwrap();

        while !handle.cancel() {}

        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        engine.stop();
    }

    // ==================== Recurring Fires ====================

    #[test]
    fn fires_repeatedly_until_cancelled() {
        let mut engine: WheelEngine = WheelEngine::start();
        let (fire_tx, fire_rx) = crossbeam_channel::unbounded();
        let count = Arc::new(AtomicUsize::new(0));

        let interval = Duration::from_millis(50);
        let handle = engine
            .schedule_fn(
                Every::new(interval),
                counting(&count, move |_| {
                    let _ = fire_tx.send(Instant::now());
                }),
            )
            .unwrap();

        // Observe exactly three fires, then stop the timer.
        for _ in 0..3 {
            fire_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("timer failed to fire");
        }
        while !handle.cancel() {}

        // No fourth fire within five further intervals.
        assert!(
            fire_rx.recv_timeout(interval * 5).is_err(),
            "callback fired after cancel returned true"
        );
        assert!(handle.is_cancelled());

        engine.stop();
    }

    #[test]
    fn fires_never_run_early() {
        let mut engine: WheelEngine = WheelEngine::start();
        let (fire_tx, fire_rx) = crossbeam_channel::unbounded();

        let interval = Duration::from_millis(20);
        let start = Instant::now();
        let handle = engine
            .schedule_fn(Every::new(interval), move || {
                let _ = fire_tx.send(Instant::now());
            })
            .unwrap();

        // Occurrence n is scheduled no earlier than start + n * interval.
        // Fire ticks are quantized to the wheel resolution, so allow one
        // tick of slack.
        for n in 1..=3u32 {
            let observed = fire_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(
                observed + Duration::from_millis(1) >= start + interval * n,
                "fire {n} ran before its scheduled time"
            );
        }

        while !handle.cancel() {}
        engine.stop();
    }

    // ==================== Cancel Contract ====================

    #[test]
    fn cancel_of_cancelled_timer_returns_false() {
        let mut engine: WheelEngine = WheelEngine::start();

        let handle = engine
            .schedule_fn(Every::new(Duration::from_millis(50)), || {})
            .unwrap();

        while !handle.cancel() {}
        assert!(!handle.cancel());
        assert!(!handle.cancel());

        engine.stop();
    }

    #[test]
    fn cancel_loop_terminates_under_rearm_pressure() {
        let mut engine: WheelEngine = WheelEngine::start();
        let count = Arc::new(AtomicUsize::new(0));

        let handle = engine
            .schedule_fn(Every::new(Duration::from_millis(1)), counting(&count, |_| {}))
            .unwrap();

        // Let the timer re-arm actively before racing the cancel.
        thread::sleep(Duration::from_millis(20));

        let mut attempts = 0usize;
        while !handle.cancel() {
            attempts += 1;
            assert!(attempts < 10_000_000, "cancel loop failed to terminate");
        }

        // An invocation dispatched before the cancel may still complete;
        // after it settles the count must freeze.
        thread::sleep(Duration::from_millis(20));
        let frozen = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), frozen);

        engine.stop();
    }

    #[test]
    fn callback_cancels_its_own_timer() {
        let mut engine: WheelEngine = WheelEngine::start();
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<OnceLock<TimerHandle>> = Arc::new(OnceLock::new());

        let seen = Arc::clone(&slot);
        let handle = engine
            .schedule_fn(
                Every::new(Duration::from_millis(20)),
                counting(&count, move |n| {
                    if n >= 2 {
                        let handle = seen.get().expect("handle published before first fire");
                        while !handle.cancel() {}
                    }
                }),
            )
            .unwrap();
        slot.set(handle).ok();

        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        engine.stop();
    }

    // ==================== Timer Independence ====================

    #[test]
    fn blocked_callback_does_not_stall_other_timers() {
        let mut engine: WheelEngine = WheelEngine::start();
        let count = Arc::new(AtomicUsize::new(0));

        let slow = engine
            .schedule_fn(Every::new(Duration::from_millis(10)), || {
                thread::sleep(Duration::from_millis(500));
            })
            .unwrap();
        let fast = engine
            .schedule_fn(Every::new(Duration::from_millis(10)), counting(&count, |_| {}))
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(
            count.load(Ordering::SeqCst) >= 3,
            "fast timer starved by a slow sibling"
        );

        while !fast.cancel() {}
        while !slow.cancel() {}
        engine.stop();
    }

    // ==================== Engine Lifecycle ====================

    #[test]
    fn scheduling_on_stopped_engine_errors() {
        let mut engine: WheelEngine = WheelEngine::start();
        engine.stop();

        let result = engine.schedule_fn(Every::new(Duration::from_millis(10)), || {});
        assert_eq!(result.unwrap_err(), EngineError::NotRunning);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut engine: WheelEngine = WheelEngine::start();
        engine.stop();
        engine.stop();
    }

    #[test]
    fn stop_drops_pending_timers() {
        let mut engine: WheelEngine = WheelEngine::start();
        let count = Arc::new(AtomicUsize::new(0));

        let _handle = engine
            .schedule_fn(Every::new(Duration::from_millis(30)), counting(&count, |_| {}))
            .unwrap();

        engine.stop();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn independent_engines_coexist() {
        let mut a: WheelEngine = WheelEngine::start();
        let mut b: WheelEngine = WheelEngine::start();
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));

        let ha = a
            .schedule_fn(Every::new(Duration::from_millis(10)), counting(&count_a, |_| {}))
            .unwrap();
        let hb = b
            .schedule_fn(Every::new(Duration::from_millis(10)), counting(&count_b, |_| {}))
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        a.stop();

        // Stopping one engine must not touch the other's timers.
        let frozen_b = count_b.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert!(count_b.load(Ordering::SeqCst) > frozen_b);

        while !ha.cancel() {}
        while !hb.cancel() {}
        b.stop();
    }

    #[test]
    fn custom_wheel_configuration_runs() {
        // Coarse 4ms resolution, two gears, small slots.
        let mut engine: WheelEngine<2, 4, 8, 4> = WheelEngine::start();
        let (fire_tx, fire_rx) = crossbeam_channel::unbounded();

        let handle = engine
            .schedule_fn(Every::new(Duration::from_millis(40)), move || {
                let _ = fire_tx.send(());
            })
            .unwrap();

        fire_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("timer failed to fire on coarse wheel");

        while !handle.cancel() {}
        engine.stop();
    }
}
