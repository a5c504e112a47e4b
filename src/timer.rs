use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bucket::{WheelBucket, new_wheel};
use crate::error::TimerError;
use crate::ring::{PushError, RingBuffer};
use crate::task::{
    Executor, PanicHandler, PanicPayload, SpawnExecutor, TimerTask, default_panic_handler,
};
use crate::timeout::{Timeout, TimeoutInner};
use crate::utils::{ceil_div, elapsed_nanos, next_positive_power_of_two};
use crate::wait::{WaitStrategy, YieldingWaitStrategy};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Cap on incoming transfers per tick so a hot producer cannot starve
/// expiry processing.
const MAX_TRANSFERS_PER_TICK: usize = 100_000;

pub(crate) const DEFAULT_MAX_PENDING_TIMEOUTS: i64 = 512;
pub(crate) const DEFAULT_RING_BUFFER_SIZE: usize = 1024;

/// Worker lifecycle. Monotonic: `Init -> Started -> Shutdown`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    Init = 0,
    Started = 1,
    Shutdown = 2,
}

impl WorkerState {
    #[inline(always)]
    fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Init,
            1 => WorkerState::Started,
            2 => WorkerState::Shutdown,
            other => {
                debug_assert!(false, "unexpected worker state {other}");
                WorkerState::Shutdown
            }
        }
    }
}

/// One-shot barrier carrying the worker's start instant.
///
/// Written once by the worker; any caller that needs a deadline relative to
/// the start instant waits here until it is published.
struct StartGate {
    instant: OnceLock<Instant>,
    opened: Mutex<bool>,
    cv: Condvar,
}

impl StartGate {
    fn new() -> Self {
        Self {
            instant: OnceLock::new(),
            opened: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn open(&self, at: Instant) {
        let _ = self.instant.set(at);
        let mut opened = self.opened.lock().unwrap();
        *opened = true;
        self.cv.notify_all();
    }

    fn wait(&self) -> Instant {
        if let Some(at) = self.instant.get() {
            return *at;
        }
        let mut opened = self.opened.lock().unwrap();
        while !*opened {
            opened = self.cv.wait(opened).unwrap();
        }
        *self.instant.get().expect("start gate opened without instant")
    }

    fn get(&self) -> Option<Instant> {
        self.instant.get().copied()
    }
}

/// State shared between the façade, the worker thread and every timeout.
pub(crate) struct TimerShared {
    tick_duration_ns: i64,
    wheel_len: i64,
    max_pending_timeouts: i64,
    worker_state: AtomicU8,
    start_gate: StartGate,
    pending_timeouts: AtomicI64,
    incoming: RingBuffer<Arc<TimeoutInner>>,
    cancelled: RingBuffer<Arc<TimeoutInner>>,
    executor: Box<dyn Executor>,
    panic_handler: PanicHandler,
    worker: Mutex<Option<JoinHandle<Vec<Timeout>>>>,
}

impl TimerShared {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.worker_state.load(Ordering::Acquire))
    }

    fn cas_state(&self, current: WorkerState, new: WorkerState) -> bool {
        self.worker_state
            .compare_exchange(
                current.as_u8(),
                new.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn decrement_pending(&self) {
        self.pending_timeouts.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn cancelled_queue(&self) -> &RingBuffer<Arc<TimeoutInner>> {
        &self.cancelled
    }

    pub(crate) fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    pub(crate) fn panic_handler(&self) -> impl Fn(PanicPayload) + '_ {
        |payload| (self.panic_handler)(payload)
    }

    pub(crate) fn start_time(&self) -> Option<Instant> {
        self.start_gate.get()
    }

    #[cfg(test)]
    pub(crate) fn tick_duration_ns(&self) -> i64 {
        self.tick_duration_ns
    }
}

/// Configures and builds a [`WheelTimer`].
pub struct WheelTimerBuilder {
    tick_duration: Duration,
    ticks_per_wheel: u32,
    max_pending_timeouts: i64,
    ring_buffer_size: usize,
    executor: Box<dyn Executor>,
    panic_handler: PanicHandler,
    wait_strategy: Arc<dyn WaitStrategy>,
}

impl WheelTimerBuilder {
    fn new(tick_duration: Duration, ticks_per_wheel: u32) -> Self {
        Self {
            tick_duration,
            ticks_per_wheel,
            max_pending_timeouts: DEFAULT_MAX_PENDING_TIMEOUTS,
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            executor: Box::new(SpawnExecutor::new()),
            panic_handler: default_panic_handler(),
            wait_strategy: Arc::new(YieldingWaitStrategy::new()),
        }
    }

    /// Replaces the default spawn-per-task executor.
    pub fn executor(mut self, executor: impl Executor + 'static) -> Self {
        self.executor = Box::new(executor);
        self
    }

    /// Replaces the default log-at-error-level panic handler.
    pub fn panic_handler(
        mut self,
        handler: impl Fn(PanicPayload) + Send + Sync + 'static,
    ) -> Self {
        self.panic_handler = Box::new(handler);
        self
    }

    /// Bounds the number of live timeouts; zero or negative disables the
    /// bound.
    pub fn max_pending_timeouts(mut self, max: i64) -> Self {
        self.max_pending_timeouts = max;
        self
    }

    /// Capacity of the incoming and cancelled queues (rounded up to a
    /// power of two).
    pub fn ring_buffer_size(mut self, size: usize) -> Self {
        self.ring_buffer_size = size;
        self
    }

    /// Wait strategy used by the queues' blocking poll path.
    pub fn wait_strategy(mut self, strategy: Arc<dyn WaitStrategy>) -> Self {
        self.wait_strategy = strategy;
        self
    }

    pub fn build(self) -> Result<WheelTimer, TimerError> {
        let wheel_len = next_positive_power_of_two(self.ticks_per_wheel);
        if wheel_len == 0 {
            return Err(TimerError::InvalidConfig(format!(
                "ticksPerWheel: {} (expected: 0 < ticksPerWheel < 0x40000000)",
                self.ticks_per_wheel
            )));
        }
        let wheel_len = wheel_len as i64;

        let mut tick_ns = i64::try_from(self.tick_duration.as_nanos()).unwrap_or(i64::MAX);
        let max_tick_ns = i64::MAX / wheel_len;
        if tick_ns > max_tick_ns {
            return Err(TimerError::InvalidConfig(format!(
                "tickDuration: {tick_ns} (expected: 0 < tickDuration in nanos < {max_tick_ns})"
            )));
        }
        if tick_ns < NANOS_PER_MILLI {
            tracing::warn!(
                configured_ns = tick_ns,
                "configured tick duration smaller than 1ms, using 1ms instead"
            );
            tick_ns = NANOS_PER_MILLI;
        }

        let shared = Arc::new(TimerShared {
            tick_duration_ns: tick_ns,
            wheel_len,
            max_pending_timeouts: self.max_pending_timeouts,
            worker_state: AtomicU8::new(WorkerState::Init.as_u8()),
            start_gate: StartGate::new(),
            pending_timeouts: AtomicI64::new(0),
            incoming: RingBuffer::with_strategy(
                self.ring_buffer_size,
                Arc::clone(&self.wait_strategy),
            ),
            cancelled: RingBuffer::with_strategy(self.ring_buffer_size, self.wait_strategy),
            executor: self.executor,
            panic_handler: self.panic_handler,
            worker: Mutex::new(None),
        });
        Ok(WheelTimer { shared })
    }
}

/// Hashed timing-wheel timer.
///
/// Accepts one-shot tasks with a relative delay and fires each at or after
/// its deadline on a dedicated worker thread. Insertion and cancellation
/// are O(1); the worker advances the wheel one tick at a time, batching
/// newly scheduled and cancelled timeouts through bounded lock-free queues.
///
/// Clones share the same timer.
#[derive(Clone)]
pub struct WheelTimer {
    shared: Arc<TimerShared>,
}

impl WheelTimer {
    /// Creates a timer with default options. See [`WheelTimer::builder`].
    pub fn new(tick_duration: Duration, ticks_per_wheel: u32) -> Result<Self, TimerError> {
        Self::builder(tick_duration, ticks_per_wheel).build()
    }

    /// Starts configuring a timer with the given tick granularity and
    /// requested wheel size.
    pub fn builder(tick_duration: Duration, ticks_per_wheel: u32) -> WheelTimerBuilder {
        WheelTimerBuilder::new(tick_duration, ticks_per_wheel)
    }

    pub(crate) fn from_shared(shared: Arc<TimerShared>) -> Self {
        Self { shared }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &TimerShared {
        &self.shared
    }

    #[cfg(test)]
    pub(crate) fn shared_arc(&self) -> &Arc<TimerShared> {
        &self.shared
    }

    /// Number of live (scheduled but not yet fired or reaped) timeouts.
    pub fn pending_timeouts(&self) -> i64 {
        self.shared.pending_timeouts.load(Ordering::Acquire)
    }

    /// Starts the worker thread. Idempotent; scheduling starts the timer
    /// lazily, so calling this is only useful to front-load the thread
    /// creation. Fails once the timer has been stopped.
    pub fn start(&self) -> Result<(), TimerError> {
        match self.shared.state() {
            WorkerState::Init => {
                if self.shared.cas_state(WorkerState::Init, WorkerState::Started) {
                    let shared = Arc::clone(&self.shared);
                    let handle = thread::Builder::new()
                        .name("hashwheel-timer".into())
                        .spawn(move || Worker::new(shared).run())
                        .expect("failed to spawn timer thread");
                    self.shared.worker.lock().unwrap().replace(handle);
                }
            }
            WorkerState::Started => {}
            WorkerState::Shutdown => return Err(TimerError::Stopped),
        }

        // Scheduling needs the start instant; block until the worker has
        // published it.
        self.shared.start_gate.wait();
        Ok(())
    }

    /// Schedules `task` to run once, `delay` after now.
    pub fn schedule<T>(&self, task: T, delay: Duration) -> Result<Timeout, TimerError>
    where
        T: TimerTask + 'static,
    {
        let shared = &self.shared;

        let pending = shared.pending_timeouts.fetch_add(1, Ordering::AcqRel) + 1;
        if shared.max_pending_timeouts > 0 && pending > shared.max_pending_timeouts {
            shared.decrement_pending();
            return Err(TimerError::TooManyPending {
                pending,
                max: shared.max_pending_timeouts,
            });
        }

        if let Err(err) = self.start() {
            shared.decrement_pending();
            return Err(err);
        }

        let start = self.shared.start_gate.wait();
        let delay_ns = i64::try_from(delay.as_nanos()).unwrap_or(i64::MAX);
        let deadline = elapsed_nanos(start)
            .checked_add(delay_ns)
            .unwrap_or(i64::MAX);

        let timeout = Arc::new(TimeoutInner::new(
            Arc::downgrade(shared),
            Box::new(task),
            deadline,
        ));
        if let Err(err) = shared.incoming.put(Arc::clone(&timeout)) {
            shared.decrement_pending();
            return Err(match err {
                PushError::Full(_) => TimerError::QueueFull,
                PushError::Disposed(_) => TimerError::Stopped,
            });
        }

        Ok(Timeout::from_inner(timeout))
    }

    /// Stops the timer and returns the timeouts that were scheduled but
    /// never ran. Only the first caller to observe the running timer does
    /// the drain; every other caller gets an empty vec.
    pub fn stop(&self) -> Vec<Timeout> {
        if !self.shared.cas_state(WorkerState::Started, WorkerState::Shutdown) {
            // Never started, or another caller is already draining. Pin the
            // terminal state so late start() calls are refused.
            self.shared
                .worker_state
                .store(WorkerState::Shutdown.as_u8(), Ordering::Release);
            return Vec::new();
        }

        // start() publishes the join handle right after winning its CAS, so
        // a brief spin is enough to observe it.
        let handle = loop {
            if let Some(handle) = self.shared.worker.lock().unwrap().take() {
                break handle;
            }
            thread::yield_now();
        };
        let unprocessed = match handle.join() {
            Ok(unprocessed) => unprocessed,
            Err(payload) => std::panic::resume_unwind(payload),
        };

        let mut cancelled = Vec::with_capacity(unprocessed.len());
        for timeout in unprocessed {
            if timeout.cancel() {
                cancelled.push(timeout);
            }
        }
        cancelled
    }
}

/// Computes where a transferred timeout lands: the number of full wheel
/// revolutions it must wait, and the tick whose bucket receives it. A
/// past-due timeout is placed at the current tick so it fires on the next
/// sweep instead of waiting a full revolution.
fn placement(deadline_ns: i64, tick: i64, tick_duration_ns: i64, wheel_len: i64) -> (i64, i64) {
    let calculated = deadline_ns / tick_duration_ns;
    let rounds = (calculated - tick) / wheel_len;
    (rounds, calculated.max(tick))
}

/// The advancer: a single thread that paces ticks, reaps cancellations,
/// files newly scheduled timeouts into buckets and expires the current
/// bucket.
struct Worker {
    shared: Arc<TimerShared>,
    wheel: Box<[WheelBucket]>,
    mask: i64,
    tick: i64,
    start_time: Instant,
    unprocessed: Vec<Timeout>,
}

impl Worker {
    fn new(shared: Arc<TimerShared>) -> Self {
        let wheel = new_wheel(shared.wheel_len as usize);
        Self {
            mask: shared.wheel_len - 1,
            tick: 0,
            start_time: Instant::now(),
            unprocessed: Vec::new(),
            wheel,
            shared,
        }
    }

    fn run(mut self) -> Vec<Timeout> {
        self.start_time = Instant::now();
        self.shared.start_gate.open(self.start_time);

        while self.shared.state() == WorkerState::Started {
            let deadline = self.wait_for_next_tick();
            let idx = (self.tick & self.mask) as usize;
            self.process_cancelled();
            self.transfer_to_buckets();
            self.wheel[idx].expire(deadline, &self.shared);
            self.tick += 1;
        }

        for bucket in self.wheel.iter() {
            bucket.drain_into(&mut self.unprocessed);
        }
        while let Ok(timeout) = self.shared.incoming.poll_non_blocking() {
            if !timeout.is_cancelled() {
                self.unprocessed.push(Timeout::from_inner(timeout));
            }
        }
        self.process_cancelled();

        self.shared.incoming.dispose();
        self.shared.cancelled.dispose();
        self.unprocessed
    }

    /// Sleeps in millisecond chunks until the next tick boundary, then
    /// returns the elapsed nanoseconds since the worker started.
    fn wait_for_next_tick(&self) -> i64 {
        let deadline = self.shared.tick_duration_ns.saturating_mul(self.tick + 1);
        loop {
            let current = elapsed_nanos(self.start_time);
            let sleep_ms = ceil_div(deadline.saturating_sub(current), NANOS_PER_MILLI);
            if sleep_ms <= 0 {
                return current;
            }
            // Sub-millisecond sleeps are not portably precise; millisecond
            // chunks are.
            thread::sleep(Duration::from_millis(sleep_ms as u64));
        }
    }

    /// Unlinks every timeout queued by `Timeout::cancel` since last tick.
    fn process_cancelled(&self) {
        while let Ok(timeout) = self.shared.cancelled.poll_non_blocking() {
            let bucket = timeout.bucket_ptr();
            if bucket.is_null() {
                // Cancelled before it ever reached a bucket (or already
                // swept); release_pending keeps the accounting single-shot.
                timeout.release_pending(&self.shared);
            } else {
                // SAFETY: bucket pointers always refer into this worker's
                // wheel, which outlives every linked timeout.
                let (_owned, _next) = unsafe { (*bucket).remove(&timeout, &self.shared) };
            }
        }
    }

    /// Files up to [`MAX_TRANSFERS_PER_TICK`] newly scheduled timeouts into
    /// their buckets.
    fn transfer_to_buckets(&self) {
        for _ in 0..MAX_TRANSFERS_PER_TICK {
            let timeout = match self.shared.incoming.poll_non_blocking() {
                Ok(timeout) => timeout,
                Err(_) => break,
            };
            if timeout.is_cancelled() {
                // Was cancelled while still queued; the cancelled queue
                // handles the accounting.
                continue;
            }

            let (rounds, stop_tick) = placement(
                timeout.deadline(),
                self.tick,
                self.shared.tick_duration_ns,
                self.shared.wheel_len,
            );
            timeout.set_remaining_rounds(rounds);
            let idx = (stop_tick & self.mask) as usize;
            self.wheel[idx].add(timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_matches_wheel_math() {
        // 250ms deadline on a 10ms tick, 8-slot wheel: tick 25, three full
        // revolutions away, bucket 25 & 7 == 1.
        let tick_ns = 10 * NANOS_PER_MILLI;
        let (rounds, stop_tick) = placement(250 * NANOS_PER_MILLI, 0, tick_ns, 8);
        assert_eq!(rounds, 3);
        assert_eq!(stop_tick & 7, 1);

        // Past-due timeouts land on the current tick.
        let (rounds, stop_tick) = placement(5 * NANOS_PER_MILLI, 12, tick_ns, 8);
        assert!(rounds <= 0);
        assert_eq!(stop_tick, 12);
    }

    #[test]
    fn builder_rejects_invalid_wheel_sizes() {
        assert!(matches!(
            WheelTimer::new(Duration::from_millis(1), 0),
            Err(TimerError::InvalidConfig(_))
        ));
        assert!(matches!(
            WheelTimer::new(Duration::from_millis(1), 0x4000_0000),
            Err(TimerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn builder_rejects_oversized_tick() {
        let tick = Duration::from_nanos(u64::MAX);
        assert!(matches!(
            WheelTimer::new(tick, 1024),
            Err(TimerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn builder_clamps_sub_millisecond_tick() {
        let timer = WheelTimer::new(Duration::from_micros(100), 16).unwrap();
        assert_eq!(timer.shared().tick_duration_ns(), NANOS_PER_MILLI);
    }

    #[test]
    fn stop_before_start_returns_empty_and_pins_shutdown() {
        let timer = WheelTimer::new(Duration::from_millis(1), 16).unwrap();
        assert!(timer.stop().is_empty());
        assert!(matches!(timer.start(), Err(TimerError::Stopped)));
    }
}
