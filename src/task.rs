use std::any::Any;
use std::error::Error as StdError;
use std::thread;

use crate::timeout::Timeout;

/// Error a task may return from [`TimerTask::run`]; logged, never re-surfaced.
pub type TaskError = Box<dyn StdError + Send + Sync>;

/// Panic payload captured from a faulting task.
pub type PanicPayload = Box<dyn Any + Send>;

/// Sink for task panics. The default logs the payload at error level.
pub type PanicHandler = Box<dyn Fn(PanicPayload) + Send + Sync>;

/// One-shot unit of work executed after the delay given to
/// [`WheelTimer::schedule`](crate::WheelTimer::schedule).
pub trait TimerTask: Send + Sync {
    fn run(&self, timeout: &Timeout) -> Result<(), TaskError>;
}

/// Adapts a closure into a [`TimerTask`].
pub struct TimerTaskFn<F>(F);

impl<F> TimerTaskFn<F>
where
    F: Fn(&Timeout) -> Result<(), TaskError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> TimerTask for TimerTaskFn<F>
where
    F: Fn(&Timeout) -> Result<(), TaskError> + Send + Sync,
{
    fn run(&self, timeout: &Timeout) -> Result<(), TaskError> {
        (self.0)(timeout)
    }
}

/// A [`TimerTask`] that carries a payload into its closure.
pub struct DataTimerTask<T, F> {
    data: T,
    run: F,
}

impl<T, F> DataTimerTask<T, F>
where
    T: Send + Sync,
    F: Fn(&Timeout, &T) -> Result<(), TaskError> + Send + Sync,
{
    pub fn new(data: T, run: F) -> Self {
        Self { data, run }
    }
}

impl<T, F> TimerTask for DataTimerTask<T, F>
where
    T: Send + Sync,
    F: Fn(&Timeout, &T) -> Result<(), TaskError> + Send + Sync,
{
    fn run(&self, timeout: &Timeout) -> Result<(), TaskError> {
        (self.run)(timeout, &self.data)
    }
}

/// Runs expired-task thunks. Invoked exactly once per expiring,
/// non-cancelled timeout; concurrency of the thunks is the executor's
/// business, the wheel never runs them inline.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Default executor: one short-lived thread per task.
#[derive(Debug, Default)]
pub struct SpawnExecutor;

impl SpawnExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for SpawnExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        if let Err(err) = thread::Builder::new()
            .name("hashwheel-task".into())
            .spawn(task)
        {
            tracing::error!(error = %err, "failed to spawn task thread");
        }
    }
}

pub(crate) fn default_panic_handler() -> PanicHandler {
    Box::new(|payload| {
        tracing::error!("timer task panicked: {}", panic_message(&payload));
    })
}

pub(crate) fn panic_message(payload: &PanicPayload) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "opaque panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn spawn_executor_runs_task() {
        let ran = Arc::new(AtomicUsize::new(0));
        let executor = SpawnExecutor::new();
        {
            let ran = Arc::clone(&ran);
            executor.execute(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "task never ran");
            thread::yield_now();
        }
    }

    #[test]
    fn panic_message_extracts_strings() {
        let payload: PanicPayload = Box::new("boom");
        assert_eq!(panic_message(&payload), "boom");
        let payload: PanicPayload = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(&payload), "kaboom");
        let payload: PanicPayload = Box::new(42u32);
        assert_eq!(panic_message(&payload), "opaque panic payload");
    }
}
