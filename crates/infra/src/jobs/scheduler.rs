//! In-process recurring job scheduler.
//!
//! Every scheduled job gets its own tokio task driven by an interval timer.
//! A tick that fires while the previous run is still in flight is skipped
//! (single-flight per job). Run failures and panics are logged and counted;
//! they never stop the scheduler or other jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::JobDefinition;

use super::types::{JobError, JobStats};

/// A named unit of recurring work.
///
/// `run` should return promptly once `cancel` fires.
#[async_trait]
pub trait RecurringJob: Send + Sync {
    async fn run(&self, cancel: CancellationToken) -> Result<(), JobError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("job {name}: no job registered for type {job_type}")]
    UnknownJobType { name: String, job_type: String },

    #[error("job {0}: interval must be positive")]
    InvalidInterval(String),

    #[error("duplicate job name: {0}")]
    DuplicateName(String),
}

/// `job type -> job` table, filled at the composition root.
#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn RecurringJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, job: Arc<dyn RecurringJob>) -> &mut Self {
        self.jobs.insert(job_type.into(), job);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn RecurringJob>> {
        self.jobs.get(job_type).cloned()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.jobs.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct ScheduledJob {
    name: String,
    job: Arc<dyn RecurringJob>,
    interval: Duration,
}

/// Set of jobs to run, not yet started.
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve each definition's type through `registry`.
    pub fn from_definitions(
        registry: &JobRegistry,
        definitions: &[JobDefinition],
    ) -> Result<Self, SchedulerError> {
        let mut scheduler = Self::new();
        for def in definitions {
            let job = registry
                .get(&def.job_type)
                .ok_or_else(|| SchedulerError::UnknownJobType {
                    name: def.name.clone(),
                    job_type: def.job_type.clone(),
                })?;
            scheduler.schedule(def.name.clone(), job, def.interval())?;
        }
        Ok(scheduler)
    }

    pub fn schedule(
        &mut self,
        name: impl Into<String>,
        job: Arc<dyn RecurringJob>,
        interval: Duration,
    ) -> Result<&mut Self, SchedulerError> {
        let name = name.into();
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval(name));
        }
        if self.jobs.iter().any(|j| j.name == name) {
            return Err(SchedulerError::DuplicateName(name));
        }
        self.jobs.push(ScheduledJob {
            name,
            job,
            interval,
        });
        Ok(self)
    }

    /// Start one task per job. The first run starts immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut stats = HashMap::new();

        for scheduled in self.jobs {
            let job_stats = Arc::new(Mutex::new(JobStats::default()));
            stats.insert(scheduled.name.clone(), Arc::clone(&job_stats));
            tasks.spawn(job_loop(scheduled, cancel.clone(), job_stats));
        }

        SchedulerHandle {
            cancel,
            tasks,
            stats,
        }
    }
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    stats: HashMap<String, Arc<Mutex<JobStats>>>,
}

impl SchedulerHandle {
    /// Cancel every job and wait for in-flight runs to return.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "scheduler task ended abnormally");
            }
        }
    }

    /// Token cancelled on shutdown; runs receive child tokens of it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current statistics of the job named `name`.
    pub fn stats(&self, name: &str) -> Option<JobStats> {
        let stats = self.stats.get(name)?;
        stats.lock().ok().map(|s| s.clone())
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.stats.keys().map(String::as_str)
    }
}

fn update_stats(stats: &Mutex<JobStats>, f: impl FnOnce(&mut JobStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

async fn job_loop(scheduled: ScheduledJob, cancel: CancellationToken, stats: Arc<Mutex<JobStats>>) {
    let ScheduledJob {
        name,
        job,
        interval,
    } = scheduled;
    info!(job = %name, interval_ms = interval.as_millis() as u64, "recurring job started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: JoinSet<Result<(), JobError>> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                record_run(&name, &stats, result);
            }
            _ = ticker.tick() => {
                if !in_flight.is_empty() {
                    debug!(job = %name, "previous run still in flight, skipping tick");
                    update_stats(&stats, |s| s.skipped += 1);
                    continue;
                }
                update_stats(&stats, |s| s.runs += 1);
                let job = Arc::clone(&job);
                let token = cancel.child_token();
                in_flight.spawn(async move { job.run(token).await });
            }
        }
    }

    while let Some(result) = in_flight.join_next().await {
        record_run(&name, &stats, result);
    }
    info!(job = %name, "recurring job stopped");
}

fn record_run(name: &str, stats: &Mutex<JobStats>, result: Result<Result<(), JobError>, JoinError>) {
    match result {
        Ok(Ok(())) => {
            debug!(job = %name, "job run succeeded");
            update_stats(stats, |s| {
                s.succeeded += 1;
                s.last_finished_at = Some(Utc::now());
            });
        }
        Ok(Err(JobError::Cancelled)) => {
            debug!(job = %name, "job run cancelled");
        }
        Ok(Err(err)) => {
            warn!(job = %name, error = %err, "job run failed");
            update_stats(stats, |s| {
                s.failed += 1;
                s.last_error = Some(err.to_string());
                s.last_finished_at = Some(Utc::now());
            });
        }
        Err(join_err) if join_err.is_panic() => {
            error!(job = %name, "job run panicked");
            update_stats(stats, |s| {
                s.failed += 1;
                s.last_error = Some("job panicked".to_string());
                s.last_finished_at = Some(Utc::now());
            });
        }
        Err(join_err) => {
            debug!(job = %name, error = %join_err, "job run aborted");
        }
    }
}
