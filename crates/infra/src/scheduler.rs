//! Fixed-interval control loop.
//!
//! A [`Scheduler`] owns an ordered list of [`TickTask`]s. Every tick runs each
//! task once, sequentially, under its own deadline. Tasks never overlap within
//! one process; scale-out comes from running more processes.
//!
//! Shutdown is cooperative: the flag is checked between tasks and during the
//! inter-tick sleep. A task that is already running finishes or is cut off at
//! its deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::jobs::JobStoreError;

/// What a task did during one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Nothing to do this tick.
    Idle,
    /// Made progress (processed a job, refreshed a digest, ...).
    Progressed,
}

/// Infrastructural failure of a task run.
///
/// The tick carries on with the next task; nothing is retried until the next
/// tick.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Other(String),
}

/// A unit of periodic work.
#[async_trait]
pub trait TickTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> Result<TaskOutcome, TaskError>;
}

/// Result of one task within a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRun {
    Completed(TaskOutcome),
    Failed(String),
    TimedOut,
    /// Not started because shutdown was requested.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub runs: Vec<(&'static str, TaskRun)>,
}

impl TickReport {
    pub fn run_of(&self, name: &str) -> Option<&TaskRun> {
        self.runs.iter().find(|(n, _)| *n == name).map(|(_, r)| r)
    }
}

pub struct Scheduler {
    tasks: Vec<Arc<dyn TickTask>>,
    poll_interval: Duration,
    task_timeout: Duration,
}

impl Scheduler {
    pub fn new(poll_interval: Duration, task_timeout: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            poll_interval,
            task_timeout,
        }
    }

    /// Append a task; tasks run in insertion order.
    pub fn with_task(mut self, task: Arc<dyn TickTask>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Run every task once.
    pub async fn tick(&self) -> TickReport {
        self.tick_until(None).await
    }

    async fn tick_until(&self, shutdown: Option<&watch::Receiver<bool>>) -> TickReport {
        let mut report = TickReport::default();

        for task in &self.tasks {
            let name = task.name();
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                report.runs.push((name, TaskRun::Skipped));
                continue;
            }

            let run = match tokio::time::timeout(self.task_timeout, task.run_once()).await {
                Ok(Ok(outcome)) => {
                    debug!(task = name, ?outcome, "task finished");
                    TaskRun::Completed(outcome)
                }
                Ok(Err(e)) => {
                    error!(task = name, error = %e, "task failed");
                    TaskRun::Failed(e.to_string())
                }
                Err(_) => {
                    warn!(task = name, timeout = ?self.task_timeout, "task timed out");
                    TaskRun::TimedOut
                }
            };
            report.runs.push((name, run));
        }

        report
    }

    /// Start the loop on the current runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tasks = ?self.task_names(),
            poll_interval = ?self.poll_interval,
            task_timeout = ?self.task_timeout,
            "scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.tick_until(Some(&shutdown)).await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("scheduler stopped");
    }
}

/// Handle to stop a spawned scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Request shutdown and wait for the in-flight task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "scheduler task panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}
