use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::bucket::WheelBucket;
use crate::task::TimerTask;
use crate::timer::{TimerShared, WheelTimer};
use crate::utils::elapsed_nanos;

/// Lifecycle states of a scheduled timeout.
///
/// Transitions are monotonic: `Init -> Cancelled` or `Init -> Expired`,
/// nothing else.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimeoutState {
    Init = 0,
    Cancelled = 1,
    Expired = 2,
}

impl TimeoutState {
    #[inline(always)]
    fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TimeoutState::Init,
            1 => TimeoutState::Cancelled,
            2 => TimeoutState::Expired,
            other => {
                debug_assert!(false, "unexpected timeout state {other}");
                TimeoutState::Init
            }
        }
    }
}

/// Shared per-timeout record.
///
/// The atomic `state` and the cancelled-queue handoff are the only fields
/// producers touch. The intrusive `prev`/`next`/`bucket` links belong to the
/// worker thread exclusively; they are atomics only so the type stays `Sync`
/// without an unsafe cell.
pub(crate) struct TimeoutInner {
    timer: Weak<TimerShared>,
    task: Box<dyn TimerTask>,
    deadline: i64,
    remaining_rounds: AtomicI64,
    state: AtomicU8,
    prev: AtomicPtr<TimeoutInner>,
    next: AtomicPtr<TimeoutInner>,
    bucket: AtomicPtr<WheelBucket>,
    /// Guards the pending-counter decrement: exactly one per timeout.
    released: AtomicBool,
}

impl TimeoutInner {
    pub(crate) fn new(timer: Weak<TimerShared>, task: Box<dyn TimerTask>, deadline: i64) -> Self {
        Self {
            timer,
            task,
            deadline,
            remaining_rounds: AtomicI64::new(0),
            state: AtomicU8::new(TimeoutState::Init.as_u8()),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            bucket: AtomicPtr::new(ptr::null_mut()),
            released: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub(crate) fn state(&self) -> TimeoutState {
        TimeoutState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    fn compare_exchange_state(&self, current: TimeoutState, new: TimeoutState) -> bool {
        self.state
            .compare_exchange(
                current.as_u8(),
                new.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline(always)]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.state() == TimeoutState::Cancelled
    }

    #[inline(always)]
    pub(crate) fn is_expired(&self) -> bool {
        self.state() == TimeoutState::Expired
    }

    #[inline(always)]
    pub(crate) fn deadline(&self) -> i64 {
        self.deadline
    }

    #[inline(always)]
    pub(crate) fn remaining_rounds(&self) -> i64 {
        self.remaining_rounds.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn set_remaining_rounds(&self, rounds: i64) {
        self.remaining_rounds.store(rounds, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn decrement_rounds(&self) {
        self.remaining_rounds.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn prev_ptr(&self) -> *mut TimeoutInner {
        self.prev.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn next_ptr(&self) -> *mut TimeoutInner {
        self.next.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn bucket_ptr(&self) -> *mut WheelBucket {
        self.bucket.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn set_prev(&self, prev: *mut TimeoutInner) {
        self.prev.store(prev, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn set_next(&self, next: *mut TimeoutInner) {
        self.next.store(next, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn set_bucket(&self, bucket: *mut WheelBucket) {
        self.bucket.store(bucket, Ordering::Relaxed);
    }

    pub(crate) fn clear_links(&self) {
        self.set_prev(ptr::null_mut());
        self.set_next(ptr::null_mut());
        self.set_bucket(ptr::null_mut());
    }

    /// Decrements the owning timer's pending counter, at most once.
    pub(crate) fn release_pending(&self, shared: &TimerShared) {
        if !self.released.swap(true, Ordering::AcqRel) {
            shared.decrement_pending();
        }
    }

    /// Worker-only: fires the timeout. Loses to a concurrent `cancel`.
    pub(crate) fn expire(self: &Arc<Self>, shared: &Arc<TimerShared>) {
        if !self.compare_exchange_state(TimeoutState::Init, TimeoutState::Expired) {
            return;
        }

        let timeout = Timeout::from_inner(Arc::clone(self));
        let shared_for_thunk = Arc::clone(shared);
        shared.executor().execute(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                timeout.inner.task.run(&timeout)
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "timer task failed"),
                Err(payload) => (shared_for_thunk.panic_handler())(payload),
            }
        }));
    }
}

/// Caller-visible handle to a scheduled task.
///
/// Cheap to clone; all clones observe the same state.
#[derive(Clone)]
pub struct Timeout {
    pub(crate) inner: Arc<TimeoutInner>,
}

impl Timeout {
    pub(crate) fn from_inner(inner: Arc<TimeoutInner>) -> Self {
        Self { inner }
    }

    /// The timer that created this timeout, if it is still alive.
    pub fn timer(&self) -> Option<WheelTimer> {
        self.inner.timer.upgrade().map(WheelTimer::from_shared)
    }

    /// The task associated with this timeout.
    pub fn task(&self) -> &dyn TimerTask {
        self.inner.task.as_ref()
    }

    pub fn is_expired(&self) -> bool {
        self.inner.is_expired()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Attempts to cancel the task. Returns `true` iff this call performed
    /// the `Init -> Cancelled` transition; the task will then never run.
    ///
    /// Unlinking from the wheel is deferred to the worker through the
    /// cancelled queue.
    pub fn cancel(&self) -> bool {
        if !self
            .inner
            .compare_exchange_state(TimeoutState::Init, TimeoutState::Cancelled)
        {
            return false;
        }
        if let Some(shared) = self.inner.timer.upgrade() {
            // A failed enqueue means the worker has already shut down; the
            // stop() path observes this handle instead, so the error is
            // intentionally dropped.
            let _ = shared.cancelled_queue().put(Arc::clone(&self.inner));
        }
        true
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("deadline_ns", &self.inner.deadline)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self
            .inner
            .timer
            .upgrade()
            .and_then(|shared| shared.start_time());
        match start {
            Some(start) => {
                let remaining = self.inner.deadline - elapsed_nanos(start);
                if remaining > 0 {
                    write!(f, "(deadline: {remaining} ns later")?;
                } else if remaining < 0 {
                    write!(f, "(deadline: {} ns ago", -remaining)?;
                } else {
                    write!(f, "(deadline: now")?;
                }
            }
            None => write!(f, "(deadline: {} ns after start", self.inner.deadline)?,
        }
        match self.inner.state() {
            TimeoutState::Init => {}
            TimeoutState::Cancelled => write!(f, ", cancelled")?,
            TimeoutState::Expired => write!(f, ", expired")?,
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskError, TimerTaskFn};

    fn detached_timeout(deadline: i64) -> Timeout {
        let task = TimerTaskFn::new(|_timeout: &Timeout| -> Result<(), TaskError> { Ok(()) });
        Timeout::from_inner(Arc::new(TimeoutInner::new(
            Weak::new(),
            Box::new(task),
            deadline,
        )))
    }

    #[test]
    fn state_round_trip() {
        for value in 0u8..=2u8 {
            assert_eq!(TimeoutState::from_u8(value).as_u8(), value);
        }
    }

    #[test]
    fn cancel_is_idempotent() {
        let timeout = detached_timeout(1_000);
        assert!(!timeout.is_cancelled());
        assert!(timeout.cancel());
        assert!(timeout.is_cancelled());
        assert!(!timeout.cancel());
        assert!(!timeout.is_expired());
    }

    #[test]
    fn display_names_terminal_states() {
        let timeout = detached_timeout(42);
        assert_eq!(format!("{timeout}"), "(deadline: 42 ns after start)");
        timeout.cancel();
        assert_eq!(format!("{timeout}"), "(deadline: 42 ns after start, cancelled)");
    }
}
