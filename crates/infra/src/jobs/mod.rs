//! Recurring background jobs.
//!
//! ## Design
//!
//! - Jobs are declared as `{name, type, interval}` triples ([`JobDefinition`](crate::config::JobDefinition))
//!   and resolved through an explicit [`JobRegistry`]
//! - One timer-driven task per job; overlapping ticks are skipped
//! - A failing or panicking run is logged and retried on the next tick
//! - [`RetryPolicy`] is shared with operations that retry inside one run
//!   (e.g. relay publishes)

pub mod scheduler;
pub mod types;

pub use scheduler::{JobRegistry, RecurringJob, Scheduler, SchedulerError, SchedulerHandle};
pub use types::{BackoffStrategy, JobError, JobStats, RetryPolicy};
