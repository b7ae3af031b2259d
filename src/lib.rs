//! # fiberjobs - Fiber-Based Cooperative Job Scheduler
//!
//! Many short-lived jobs run concurrently on a small pool of OS worker threads
//! by multiplexing them onto user-space fibers. A fiber that waits on a
//! [`Counter`] is parked, not its thread: the worker moves on to other work
//! and the fiber resumes, possibly on another worker, once the counter drains.
//!
//! ## Architecture
//!
//! - **Context switching** ([`context`]): one naked register save/restore
//!   routine per supported ISA.
//! - **Stack arena** ([`allocator`]): a bump allocator that owns every fiber
//!   stack, sized once at startup.
//! - **Fibers and pools** ([`fiber`], [`fiber_pool`]): fixed-size stacks in
//!   four classes (`Normal`, `Large`, `Gigantic`, `ExternalLibrary`), created
//!   up front and reused for every job.
//! - **Jobs and queues** ([`job`]): descriptors carrying priority, stack
//!   class, an optional counter and a debug label; bounded FIFO queues per
//!   priority, one set for compute work and one for blocking I/O.
//! - **Scheduler** ([`scheduler`]): the composition root exposing `kick`,
//!   `kick_io`, `kick_and_wait`, `wait` and the counter pool.
//!
//! ## Example
//!
//! ```no_run
//! use fiberjobs::{JobDescr, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default())?;
//! let handle = scheduler.handle();
//!
//! scheduler.kick_and_wait(JobDescr::new(move || {
//!     // Fan out from inside a job, then wait without blocking the worker.
//!     let counter = handle.generate_counter().unwrap();
//!     for i in 0..8 {
//!         handle
//!             .kick(JobDescr::new(move || println!("child {i}")).with_counter(&counter))
//!             .unwrap();
//!     }
//!     handle.wait(&counter);
//!     handle.destroy_counter(counter);
//! }))?;
//!
//! scheduler.shutdown()?;
//! # Ok::<(), fiberjobs::SchedulerError>(())
//! ```

pub mod allocator;
pub mod config;
pub mod context;
pub mod counter;
pub mod error;
pub mod fiber;
pub mod fiber_pool;
pub mod job;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod poison;
mod queue;
pub mod scheduler;
mod worker;

pub use config::{PinningStrategy, PoolConfig, SchedulerConfig};
pub use counter::Counter;
pub use error::{ConfigError, SchedulerError, StackArenaError};
pub use fiber::check_stack_overflow;
pub use fiber_pool::FiberSnapshot;
pub use job::{DebugLabel, IoJobDescr, JobDescr, Lane, ParamHandle, Priority, StackClass};
pub use scheduler::{Scheduler, SchedulerHandle};
