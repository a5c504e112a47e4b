use thiserror::Error;

/// Errors surfaced by [`WheelTimer`](crate::WheelTimer) operations.
///
/// Task failures are never surfaced through this type: a task error is
/// logged, a task panic is routed to the configured panic handler.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TimerError {
    /// Construction-time configuration was out of the representable range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The pending-timeout bound would be exceeded.
    #[error("pending timeouts ({pending}) is greater than max pending timeouts ({max})")]
    TooManyPending { pending: i64, max: i64 },
    /// The timer has been stopped and cannot accept further work.
    #[error("cannot be started once stopped")]
    Stopped,
    /// The bounded incoming queue could not accept the timeout.
    #[error("timeout queue is full")]
    QueueFull,
}
