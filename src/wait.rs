use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// The bounded wait elapsed before a signal arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait timed out")]
pub struct WaitTimeout;

/// Strategy for parking a consumer until an item may be available.
///
/// The timing wheel never depends on which strategy is configured; a
/// strategy only trades CPU for wake-up latency on the blocking poll path.
/// `None` waits without bound.
pub trait WaitStrategy: Send + Sync {
    fn wait_for(&self, timeout: Option<Duration>) -> Result<(), WaitTimeout>;

    /// Wakes every parked waiter. A no-op for strategies that never park.
    fn signal_all(&self);
}

/// Relinquishes the scheduler slice and returns immediately.
#[derive(Debug, Default)]
pub struct YieldingWaitStrategy;

impl YieldingWaitStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(&self, _timeout: Option<Duration>) -> Result<(), WaitTimeout> {
        thread::yield_now();
        Ok(())
    }

    fn signal_all(&self) {}
}

/// Sleeps in `sleep_time`-sized chunks bounded by the caller's timeout.
///
/// Sub-100us sleep times busy-spin with periodic yields instead, since
/// sleeps that short are not portably precise.
#[derive(Debug)]
pub struct SleepingWaitStrategy {
    sleep_time: Duration,
}

const SPIN_THRESHOLD: Duration = Duration::from_micros(100);

impl SleepingWaitStrategy {
    pub fn new(sleep_time: Duration) -> Self {
        Self { sleep_time }
    }

    fn spin_wait(&self, timeout: Duration) -> Result<(), WaitTimeout> {
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(WaitTimeout);
            }
            if elapsed >= self.sleep_time {
                return Ok(());
            }
            thread::yield_now();
        }
    }

    fn sleep_wait(&self, timeout: Duration) -> Result<(), WaitTimeout> {
        if timeout.is_zero() {
            return Err(WaitTimeout);
        }
        let start = Instant::now();
        thread::sleep(self.sleep_time.min(timeout));
        if start.elapsed() >= timeout {
            Err(WaitTimeout)
        } else {
            Ok(())
        }
    }
}

impl WaitStrategy for SleepingWaitStrategy {
    fn wait_for(&self, timeout: Option<Duration>) -> Result<(), WaitTimeout> {
        let Some(timeout) = timeout else {
            thread::sleep(self.sleep_time);
            return Ok(());
        };
        if self.sleep_time < SPIN_THRESHOLD {
            self.spin_wait(timeout)
        } else {
            self.sleep_wait(timeout)
        }
    }

    fn signal_all(&self) {}
}

/// Parks on a condvar; `signal_all` wakes all parked waiters.
///
/// An epoch counter distinguishes signals that raced ahead of the park from
/// spurious wake-ups, so a signal is never lost between the registration
/// and the wait.
#[derive(Debug, Default)]
pub struct BlockingWaitStrategy {
    epoch: Mutex<u64>,
    cv: Condvar,
}

impl BlockingWaitStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait_for(&self, timeout: Option<Duration>) -> Result<(), WaitTimeout> {
        let mut epoch = self.epoch.lock().unwrap();
        let seen = *epoch;
        match timeout.and_then(|t| Instant::now().checked_add(t)) {
            None => {
                while *epoch == seen {
                    epoch = self.cv.wait(epoch).unwrap();
                }
                Ok(())
            }
            Some(deadline) => {
                while *epoch == seen {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WaitTimeout);
                    }
                    let (guard, _result) = self.cv.wait_timeout(epoch, deadline - now).unwrap();
                    epoch = guard;
                }
                Ok(())
            }
        }
    }

    fn signal_all(&self) {
        let mut epoch = self.epoch.lock().unwrap();
        *epoch = epoch.wrapping_add(1);
        self.cv.notify_all();
    }
}
