//! Hashed timing-wheel timer.
//!
//! Accepts one-shot tasks with a relative delay and fires each exactly once
//! at or after its deadline, following the Varghese-Lauck hashed-wheel
//! design: O(1) scheduling, O(1) cancellation, and a single background
//! worker that expires timeouts in tick batches.
//!
//! ## Architecture
//!
//! - [`WheelTimer`]: the public surface. `schedule` hands a new [`Timeout`]
//!   to the worker through a bounded lock-free queue; `stop` shuts the
//!   worker down and returns everything that never ran.
//! - The worker thread paces wall-clock ticks, reaps cancellations, files
//!   incoming timeouts into a power-of-two ring of buckets (intrusive
//!   doubly-linked lists) and sweeps the current bucket each tick.
//! - [`Timeout::cancel`] is lock-free: it flips the handle's atomic state
//!   and posts the handle to a cancellation queue; the worker unlinks it
//!   lazily. Buckets are never touched from caller threads.
//! - Expired tasks run on a pluggable [`Executor`] (spawn-per-task by
//!   default), never inline on the worker. Task errors are logged; task
//!   panics go to the configured panic handler.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use hashwheel::{TimerTaskFn, WheelTimer};
//!
//! let timer = WheelTimer::new(Duration::from_millis(10), 512)?;
//! let timeout = timer.schedule(
//!     TimerTaskFn::new(|_timeout| {
//!         println!("fired");
//!         Ok(())
//!     }),
//!     Duration::from_millis(250),
//! )?;
//! assert!(!timeout.is_expired());
//! let unprocessed = timer.stop();
//! # let _ = unprocessed;
//! # Ok::<(), hashwheel::TimerError>(())
//! ```

mod bucket;
mod error;
mod ring;
mod task;
mod timeout;
mod timer;
mod utils;
mod wait;

pub use error::TimerError;
pub use ring::{PollError, PushError, RingBuffer};
pub use task::{
    DataTimerTask, Executor, PanicHandler, PanicPayload, SpawnExecutor, TaskError, TimerTask,
    TimerTaskFn,
};
pub use timeout::Timeout;
pub use timer::{WheelTimer, WheelTimerBuilder};
pub use wait::{
    BlockingWaitStrategy, SleepingWaitStrategy, WaitStrategy, WaitTimeout, YieldingWaitStrategy,
};
