//! Error types surfaced by the scheduler.
//!
//! Violated invariants (double initialization, destroying a busy counter,
//! waiting from a foreign context) are programming errors and panic instead.
//! The variants here cover resource exhaustion and lifecycle conditions a
//! caller can react to.

use crate::job::{Lane, Priority, StackClass};
use thiserror::Error;

/// Errors from the fiber stack arena.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StackArenaError {
    #[error("failed to reserve {size} bytes for the stack arena")]
    OutOfMemory { size: usize },
    #[error("stack arena exhausted: requested {requested} bytes, {remaining} remaining")]
    Exhausted { requested: usize, remaining: usize },
    #[error("invalid stack arena layout (size {size}, align {align})")]
    InvalidLayout { size: usize, align: usize },
}

/// Errors from reading a [`SchedulerConfig`](crate::config::SchedulerConfig).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for configuration key `{key}`")]
    InvalidValue { key: String, value: String },
    #[error("configuration key `{key}` must be greater than zero")]
    Zero { key: &'static str },
}

/// Errors returned by [`Scheduler`](crate::scheduler::Scheduler) operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{lane} job queue for {priority:?} priority is full")]
    QueueFull { lane: Lane, priority: Priority },
    #[error("all {capacity} counters are in use")]
    CountersExhausted { capacity: usize },
    #[error("no fibers are configured for the {0:?} stack class")]
    NoFibersForClass(StackClass),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("{in_flight} job(s) still in flight after the shutdown timeout")]
    ShutdownTimedOut { in_flight: usize },
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Arena(#[from] StackArenaError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
