//! Transactional outbox: capture on commit, relay on a timer.

pub mod capture;
pub mod job;
pub mod relay;

pub use capture::{CaptureError, OutboxCapture};
pub use job::OutboxRelayJob;
pub use relay::{CycleReport, OutboxRelay, RelayError};
