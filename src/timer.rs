use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::schedule::Schedule;

/// Scheduled in the wheel, waiting to come due.
const PENDING: u8 = 0;
/// Claimed by dispatch; the callback is running or its re-arm decision is
/// still outstanding.
const FIRING: u8 = 1;
/// Terminal. No further scheduling occurs.
const CANCELLED: u8 = 2;

pub(crate) type Callback = Box<dyn FnMut() + Send + 'static>;
pub(crate) type BoxedSchedule = Box<dyn Schedule + Send + Sync + 'static>;

/// Shared core of one recurring timer.
///
/// The state word is the only coordination point between the three parties
/// that touch a timer: the driver (claims Pending entries at dispatch),
/// the fire thread (runs the callback, then re-arms), and any number of
/// handle holders calling [`TimerHandle::cancel`]. `scheduled_at` is
/// written only with the Firing claim held (or before first registration),
/// so the mutex around it is uncontended in practice.
pub(crate) struct TimerCore {
    schedule: BoxedSchedule,
    callback: Mutex<Callback>,
    state: AtomicU8,
    scheduled_at: Mutex<Instant>,
}

impl TimerCore {
    pub(crate) fn new(schedule: BoxedSchedule, callback: Callback, first: Instant) -> Arc<Self> {
        Arc::new(Self {
            schedule,
            callback: Mutex::new(callback),
            state: AtomicU8::new(PENDING),
            scheduled_at: Mutex::new(first),
        })
    }

    /// Claim a due timer for dispatch: Pending → Firing.
    ///
    /// A failed claim means a cancel won while the entry sat in the wheel;
    /// the caller drops the entry without firing (lazy deletion).
    #[inline]
    pub(crate) fn claim(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run the callback, then evaluate re-arm.
    ///
    /// Must only be called after a successful [`claim`](Self::claim); the
    /// Firing state is the mutual-exclusion gate that keeps fires for one
    /// timer strictly sequential.
    ///
    /// Returns the next fire time if the timer re-entered Pending, `None`
    /// if a cancel landed and the timer is terminal. A panicking callback
    /// does not skip the re-arm evaluation: the panic is caught, the
    /// re-arm decision runs, and the panic resumes on this thread.
    pub(crate) fn fire(&self) -> Option<Instant> {
        let caught = {
            let mut callback = self.callback.lock();
            panic::catch_unwind(AssertUnwindSafe(|| (*callback)()))
        };

        let rearmed = self.rearm();

        if let Err(payload) = caught {
            panic::resume_unwind(payload);
        }

        rearmed
    }

    /// Re-arm decision, read after the callback has completed.
    fn rearm(&self) -> Option<Instant> {
        let mut scheduled_at = self.scheduled_at.lock();
        let next = self.schedule.next(*scheduled_at);

        // A cancel may land between the callback returning and this CAS;
        // losing here means the cancel's guarantee stands and the timer
        // never re-enters the wheel.
        if self
            .state
            .compare_exchange(FIRING, PENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        *scheduled_at = next;
        Some(next)
    }

    /// Best-effort cancellation: one load, one CAS from the observed state.
    ///
    /// See [`TimerHandle::cancel`] for the contract.
    pub(crate) fn cancel(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CANCELLED => false,
            observed => self
                .state
                .compare_exchange(observed, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        }
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    #[cfg(test)]
    pub(crate) fn scheduled_at(&self) -> Instant {
        *self.scheduled_at.lock()
    }
}

/// Caller-visible capability to cancel a recurring timer.
///
/// Handles are cheap to clone; cloning is how a callback gets to cancel
/// its own timer. Every clone refers to the same timer, and all of them
/// stay valid across re-arms — a re-arm is a re-entry into Pending, not a
/// new timer identity.
#[derive(Clone)]
pub struct TimerHandle {
    core: Arc<TimerCore>,
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle").finish_non_exhaustive()
    }
}

impl TimerHandle {
    pub(crate) fn new(core: Arc<TimerCore>) -> Self {
        Self { core }
    }

    /// Request cancellation. Never blocks, never errors.
    ///
    /// Returns `true` when this call is the one that took the timer off
    /// the re-arm path: no callback invocation will begin after this call
    /// returns. An invocation already dispatched is not preempted — it
    /// runs to completion, but its re-arm is reliably suppressed.
    ///
    /// Returns `false` when this call cannot claim that guarantee: the
    /// timer was already cancelled, or it moved between this call reading
    /// its state and the cancellation taking effect (typically a re-arm
    /// that just re-entered Pending with a new occurrence). The documented
    /// usage pattern for stopping a self-rearming timer is therefore a
    /// retry loop:
    ///
    /// ```ignore
    /// while !handle.cancel() {}
    /// ```
    ///
    /// The loop terminates: each `false` under contention means the state
    /// moved, and the window in which it can keep moving is one fire
    /// cycle.
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    /// Whether the timer has reached the terminal state.
    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }
}
