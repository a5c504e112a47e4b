use std::cell::Cell;
use std::ptr;
use std::sync::Arc;

use crate::timeout::{Timeout, TimeoutInner};
use crate::timer::TimerShared;

/// One slot of the wheel: an intrusive doubly-linked list of timeouts.
///
/// Linking a timeout transfers one strong `Arc` count into the list, held
/// as the raw pointer obtained from `Arc::into_raw`; unlinking reclaims it.
/// Buckets and every link they reach are owned and mutated exclusively by
/// the worker thread, which is what makes the `Cell` head/tail and the
/// relaxed link stores sound.
pub(crate) struct WheelBucket {
    head: Cell<*const TimeoutInner>,
    tail: Cell<*const TimeoutInner>,
}

impl WheelBucket {
    pub(crate) fn new() -> Self {
        Self {
            head: Cell::new(ptr::null()),
            tail: Cell::new(ptr::null()),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.get().is_null()
    }

    /// Appends `timeout` at the tail. The timeout must not be linked.
    pub(crate) fn add(&self, timeout: Arc<TimeoutInner>) {
        debug_assert!(timeout.bucket_ptr().is_null(), "timeout already linked");

        let node = Arc::into_raw(timeout);
        // SAFETY: `node` came from Arc::into_raw above and stays valid until
        // this bucket reclaims it in remove() or poll().
        unsafe {
            (*node).set_bucket(self as *const WheelBucket as *mut WheelBucket);
        }
        if self.head.get().is_null() {
            self.head.set(node);
            self.tail.set(node);
        } else {
            let tail = self.tail.get();
            unsafe {
                (*tail).set_next(node as *mut TimeoutInner);
                (*node).set_prev(tail as *mut TimeoutInner);
            }
            self.tail.set(node);
        }
    }

    /// Unlinks `timeout`, releases its pending count and returns the
    /// reclaimed strong reference together with its former successor.
    pub(crate) fn remove(
        &self,
        timeout: &TimeoutInner,
        shared: &TimerShared,
    ) -> (Arc<TimeoutInner>, *const TimeoutInner) {
        let node = timeout as *const TimeoutInner;
        let prev = timeout.prev_ptr();
        let next = timeout.next_ptr();

        // SAFETY: neighbours are linked nodes of this bucket, kept alive by
        // the strong counts the bucket holds for them.
        if !prev.is_null() {
            unsafe { (*prev).set_next(next) };
        }
        if !next.is_null() {
            unsafe { (*next).set_prev(prev) };
        }
        if self.head.get() == node {
            if self.tail.get() == node {
                self.head.set(ptr::null());
                self.tail.set(ptr::null());
            } else {
                self.head.set(next);
            }
        } else if self.tail.get() == node {
            self.tail.set(prev);
        }

        timeout.clear_links();
        timeout.release_pending(shared);
        // SAFETY: reclaims the count transferred to the list in add().
        let owned = unsafe { Arc::from_raw(node) };
        (owned, next)
    }

    /// Sweeps the bucket at tick deadline `deadline_ns`: fires everything
    /// whose rounds ran out, unlinks cancelled stragglers, and decrements
    /// the rounds of everything staying for a later revolution.
    pub(crate) fn expire(&self, deadline_ns: i64, shared: &Arc<TimerShared>) {
        let mut node = self.head.get();
        while !node.is_null() {
            // SAFETY: `node` is linked, so the bucket holds a count for it.
            let timeout = unsafe { &*node };
            node = if timeout.remaining_rounds() <= 0 {
                let (owned, next) = self.remove(timeout, shared);
                if owned.deadline() <= deadline_ns {
                    owned.expire(shared);
                } else {
                    // A timeout in this slot with no rounds left must be
                    // due; anything else is a transfer bug.
                    panic!(
                        "timeout.deadline ({}) > deadline ({})",
                        owned.deadline(),
                        deadline_ns
                    );
                }
                next
            } else if timeout.is_cancelled() {
                let (_owned, next) = self.remove(timeout, shared);
                next
            } else {
                timeout.decrement_rounds();
                timeout.next_ptr()
            };
        }
    }

    /// Pops the head of the list, if any, without touching the pending
    /// counter. Shutdown-drain helper.
    pub(crate) fn poll(&self) -> Option<Arc<TimeoutInner>> {
        let head = self.head.get();
        if head.is_null() {
            return None;
        }
        // SAFETY: `head` is linked, so the bucket holds a count for it.
        let timeout = unsafe { &*head };
        let next = timeout.next_ptr();
        if next.is_null() {
            self.head.set(ptr::null());
            self.tail.set(ptr::null());
        } else {
            unsafe { (*next).set_prev(ptr::null_mut()) };
            self.head.set(next);
        }
        timeout.clear_links();
        // SAFETY: reclaims the count transferred to the list in add().
        Some(unsafe { Arc::from_raw(head) })
    }

    /// Moves every surviving (non-terminal) timeout into `unprocessed`.
    pub(crate) fn drain_into(&self, unprocessed: &mut Vec<Timeout>) {
        while let Some(timeout) = self.poll() {
            if timeout.is_cancelled() || timeout.is_expired() {
                continue;
            }
            unprocessed.push(Timeout::from_inner(timeout));
        }
    }
}

impl Drop for WheelBucket {
    fn drop(&mut self) {
        // Normal shutdown drains every bucket; this only matters when the
        // worker unwinds mid-sweep, and keeps the linked counts from leaking.
        while self.poll().is_some() {}
    }
}

pub(crate) fn new_wheel(len: usize) -> Box<[WheelBucket]> {
    debug_assert!(len.is_power_of_two());
    (0..len).map(|_| WheelBucket::new()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Executor, TaskError, TimerTaskFn};
    use crate::timer::WheelTimer;
    use std::sync::Weak;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingExecutor(Arc<AtomicUsize>);

    impl Executor for CountingExecutor {
        fn execute(&self, task: Box<dyn FnOnce() + Send>) {
            self.0.fetch_add(1, Ordering::SeqCst);
            task();
        }
    }

    fn test_timer(fired: &Arc<AtomicUsize>) -> WheelTimer {
        WheelTimer::builder(Duration::from_millis(10), 8)
            .executor(CountingExecutor(Arc::clone(fired)))
            .build()
            .unwrap()
    }

    fn new_timeout(deadline: i64, rounds: i64) -> Arc<TimeoutInner> {
        let task = TimerTaskFn::new(|_t: &Timeout| -> Result<(), TaskError> { Ok(()) });
        let inner = Arc::new(TimeoutInner::new(Weak::new(), Box::new(task), deadline));
        inner.set_remaining_rounds(rounds);
        inner
    }

    #[test]
    fn add_and_poll_preserve_insertion_order() {
        let bucket = WheelBucket::new();

        let a = new_timeout(1, 0);
        let b = new_timeout(2, 0);
        let c = new_timeout(3, 0);
        bucket.add(Arc::clone(&a));
        bucket.add(Arc::clone(&b));
        bucket.add(Arc::clone(&c));

        assert!(Arc::ptr_eq(&bucket.poll().unwrap(), &a));
        assert!(Arc::ptr_eq(&bucket.poll().unwrap(), &b));
        assert!(Arc::ptr_eq(&bucket.poll().unwrap(), &c));
        assert!(bucket.poll().is_none());
        assert!(bucket.is_empty());
    }

    #[test]
    fn remove_relinks_neighbours() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = test_timer(&fired);
        let bucket = WheelBucket::new();

        let a = new_timeout(1, 0);
        let b = new_timeout(2, 0);
        let c = new_timeout(3, 0);
        bucket.add(Arc::clone(&a));
        bucket.add(Arc::clone(&b));
        bucket.add(Arc::clone(&c));

        let (removed, next) = bucket.remove(&b, timer.shared());
        assert!(Arc::ptr_eq(&removed, &b));
        assert_eq!(next, Arc::as_ptr(&c));
        assert!(b.bucket_ptr().is_null());

        assert!(Arc::ptr_eq(&bucket.poll().unwrap(), &a));
        assert!(Arc::ptr_eq(&bucket.poll().unwrap(), &c));
        assert!(bucket.poll().is_none());
    }

    #[test]
    fn expire_fires_due_and_spares_later_rounds() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = test_timer(&fired);
        let bucket = WheelBucket::new();

        let due = new_timeout(50, 0);
        let later = new_timeout(900, 2);
        bucket.add(Arc::clone(&due));
        bucket.add(Arc::clone(&later));

        bucket.expire(100, timer.shared_arc());

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(due.is_expired());
        assert!(!later.is_expired());
        assert_eq!(later.remaining_rounds(), 1);
        assert!(!bucket.is_empty());
    }

    #[test]
    fn expire_unlinks_cancelled_without_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = test_timer(&fired);
        let bucket = WheelBucket::new();

        let cancelled = new_timeout(50, 3);
        bucket.add(Arc::clone(&cancelled));
        Timeout::from_inner(Arc::clone(&cancelled)).cancel();

        bucket.expire(100, timer.shared_arc());

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(bucket.is_empty());
        assert!(cancelled.bucket_ptr().is_null());
    }

    #[test]
    #[should_panic(expected = "timeout.deadline")]
    fn expire_panics_on_misplaced_timeout() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = test_timer(&fired);
        let bucket = WheelBucket::new();

        let misplaced = new_timeout(500, 0);
        bucket.add(misplaced);
        bucket.expire(100, timer.shared_arc());
    }

    #[test]
    fn drain_skips_terminal_timeouts() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = test_timer(&fired);
        let bucket = WheelBucket::new();

        let live = new_timeout(50, 1);
        let cancelled = new_timeout(60, 1);
        bucket.add(Arc::clone(&live));
        bucket.add(Arc::clone(&cancelled));
        Timeout::from_inner(Arc::clone(&cancelled)).cancel();

        let mut unprocessed = Vec::new();
        bucket.drain_into(&mut unprocessed);
        assert_eq!(unprocessed.len(), 1);
        assert!(Arc::ptr_eq(&unprocessed[0].inner, &live));
        assert!(bucket.is_empty());
    }
}
