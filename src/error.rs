use std::fmt;

/// Every user-observable failure path in the runtime.
///
/// Internal invariant violations (a desynchronized run-queue bitmap, a sink
/// reachable after reclamation, an impossible epoch value) are never routed
/// through this type — they use `unreachable!`/`debug_assert!` and abort the
/// process, matching the "fatal initialization" and "internal invariant
/// violation" rows of the error taxonomy.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue is saturated")]
    QueueSaturated,

    #[error("timer identifier space is exhausted")]
    TimerIdExhausted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("fiber was canceled")]
    Canceled,

    #[error("sink is closed")]
    SinkClosed,

    #[error("context is stopped")]
    ContextStopped,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Marker returned by a fiber's start routine when it exits due to
/// cancellation rather than completing normally (§4.7 Cancellation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber canceled")
    }
}
