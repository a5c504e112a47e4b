use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use thiserror::Error;

use crate::wait::{WaitStrategy, YieldingWaitStrategy};

/// Error returned when an item could not be enqueued; carries the item back.
pub enum PushError<T> {
    /// The ring is at capacity.
    Full(T),
    /// The ring has been disposed.
    Disposed(T),
}

impl<T> PushError<T> {
    /// Recovers the item that could not be enqueued.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(value) | PushError::Disposed(value) => value,
        }
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Disposed(_) => f.write_str("Disposed(..)"),
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("ring buffer is full"),
            PushError::Disposed(_) => f.write_str("ring buffer is disposed"),
        }
    }
}

impl<T> std::error::Error for PushError<T> {}

/// Error returned when no item could be dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PollError {
    /// No item was available.
    #[error("ring buffer is empty")]
    Empty,
    /// The bounded wait elapsed before an item arrived.
    #[error("poll timed out")]
    Timeout,
    /// The ring has been disposed.
    #[error("ring buffer is disposed")]
    Disposed,
}

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded multi-producer single-consumer ring buffer.
///
/// Producers claim slots with a sequence-counter CAS and never block; the
/// single consumer polls non-blocking or waits through the configured
/// [`WaitStrategy`]. Capacity is rounded up to a power of two.
///
/// The layout is the classic sequence-per-slot design: a slot is writable
/// when `sequence == ticket`, readable when `sequence == ticket + 1`, and
/// recycled by advancing the sequence a full lap.
pub struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    tail: CachePadded<AtomicUsize>,
    head: CachePadded<AtomicUsize>,
    disposed: AtomicBool,
    strategy: Arc<dyn WaitStrategy>,
}

unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Creates a ring with the default yielding wait strategy.
    pub fn new(capacity: usize) -> Self {
        Self::with_strategy(capacity, Arc::new(YieldingWaitStrategy::new()))
    }

    /// Creates a ring that waits through the supplied strategy.
    pub fn with_strategy(capacity: usize, strategy: Arc<dyn WaitStrategy>) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            mask: capacity - 1,
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
            disposed: AtomicBool::new(false),
            strategy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Enqueues `value` without blocking. Safe for any number of producers.
    pub fn put(&self, value: T) -> Result<(), PushError<T>> {
        if self.is_disposed() {
            return Err(PushError::Disposed(value));
        }
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[tail & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let lag = sequence as isize - tail as isize;
            if lag == 0 {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(tail.wrapping_add(1), Ordering::Release);
                        self.strategy.signal_all();
                        return Ok(());
                    }
                    Err(observed) => tail = observed,
                }
            } else if lag < 0 {
                return Err(PushError::Full(value));
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeues an item if one is ready. Single-consumer only.
    fn try_poll(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[head & self.mask];
        if slot.sequence.load(Ordering::Acquire) != head.wrapping_add(1) {
            return None;
        }
        // Single consumer: no CAS needed to claim the slot.
        self.head.store(head.wrapping_add(1), Ordering::Relaxed);
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.sequence
            .store(head.wrapping_add(self.capacity()), Ordering::Release);
        Some(value)
    }

    /// Non-blocking poll. Single-consumer only.
    pub fn poll_non_blocking(&self) -> Result<T, PollError> {
        if self.is_disposed() {
            return Err(PollError::Disposed);
        }
        self.try_poll().ok_or(PollError::Empty)
    }

    /// Polls, waiting through the wait strategy. Single-consumer only.
    /// `None` waits without bound.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<T, PollError> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            if self.is_disposed() {
                return Err(PollError::Disposed);
            }
            if let Some(value) = self.try_poll() {
                return Ok(value);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PollError::Timeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            if self.strategy.wait_for(remaining).is_err() {
                // The wait ran out; take anything that slipped in meanwhile.
                return self.try_poll().ok_or(PollError::Timeout);
            }
        }
    }

    /// Marks the ring unusable and wakes any parked waiter. Items already
    /// enqueued are dropped when the ring is dropped.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.strategy.signal_all();
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.try_poll().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::SleepingWaitStrategy;
    use std::thread;

    #[test]
    fn poll_empty() {
        let ring = RingBuffer::<u32>::new(2);
        assert_eq!(ring.poll_non_blocking(), Err(PollError::Empty));

        for i in 0..2 {
            ring.put(i).unwrap();
            assert_eq!(ring.poll_non_blocking(), Ok(i));
        }
        assert_eq!(ring.poll_non_blocking(), Err(PollError::Empty));
    }

    #[test]
    fn capacity_rounds_up_and_bounds_puts() {
        let ring = RingBuffer::<u32>::new(3);
        assert_eq!(ring.capacity(), 4);
        for i in 0..4 {
            ring.put(i).unwrap();
        }
        assert!(matches!(ring.put(4), Err(PushError::Full(4))));
        assert_eq!(ring.poll_non_blocking(), Ok(0));
        ring.put(4).unwrap();
    }

    #[test]
    fn dispose_rejects_producers_and_consumers() {
        let ring = RingBuffer::<u32>::new(4);
        ring.put(1).unwrap();
        ring.dispose();
        assert!(matches!(ring.put(2), Err(PushError::Disposed(2))));
        assert_eq!(ring.poll_non_blocking(), Err(PollError::Disposed));
    }

    #[test]
    fn poll_times_out_when_empty() {
        let ring = RingBuffer::<u32>::with_strategy(
            4,
            Arc::new(SleepingWaitStrategy::new(Duration::from_millis(1))),
        );
        assert_eq!(ring.poll(Some(Duration::from_millis(10))), Err(PollError::Timeout));
    }

    #[test]
    fn blocking_poll_sees_concurrent_put() {
        let ring = Arc::new(RingBuffer::<u32>::with_strategy(
            4,
            Arc::new(crate::wait::BlockingWaitStrategy::new()),
        ));
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                ring.put(7).unwrap();
            })
        };
        assert_eq!(ring.poll(Some(Duration::from_secs(5))), Ok(7));
        producer.join().unwrap();
    }

    #[test]
    fn many_producers_single_consumer() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1_000;

        let ring = Arc::new(RingBuffer::<usize>::new(64));
        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            producers.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + i;
                    loop {
                        match ring.put(value) {
                            Ok(()) => break,
                            Err(PushError::Full(_)) => thread::yield_now(),
                            Err(PushError::Disposed(_)) => panic!("disposed mid-test"),
                        }
                    }
                }
            }));
        }

        let mut seen = Vec::with_capacity(PRODUCERS * PER_PRODUCER);
        while seen.len() < PRODUCERS * PER_PRODUCER {
            match ring.poll_non_blocking() {
                Ok(value) => seen.push(value),
                Err(PollError::Empty) => thread::yield_now(),
                Err(other) => panic!("unexpected poll error: {other}"),
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }

        seen.sort_unstable();
        let expected: Vec<usize> = (0..PRODUCERS * PER_PRODUCER).collect();
        assert_eq!(seen, expected);
    }
}
