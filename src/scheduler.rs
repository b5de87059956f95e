//! Recurring Task Scheduling
//!
//! The core never owns timers. Periodic work (anchoring) is expressed as a
//! `RecurringTask` and handed to whatever `Scheduler` the host provides.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::AuditResult;

/// A unit of periodic work
#[async_trait]
pub trait RecurringTask: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> AuditResult<()>;
}

/// Host-provided scheduling facility
pub trait Scheduler: Send + Sync {
    fn schedule(&self, interval: Duration, task: Arc<dyn RecurringTask>) -> ScheduleHandle;
}

/// Handle to a scheduled task. Dropping it leaves the task running;
/// call `cancel` to stop it.
#[derive(Debug, Default)]
pub struct ScheduleHandle {
    join: Option<JoinHandle<()>>,
}

impl ScheduleHandle {
    pub fn detached() -> Self {
        Self { join: None }
    }

    pub fn from_join(join: JoinHandle<()>) -> Self {
        Self { join: Some(join) }
    }

    pub fn cancel(&self) {
        if let Some(join) = &self.join {
            join.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// Runs each task on a tokio interval on the current runtime
#[derive(Debug, Default, Clone)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, interval: Duration, task: Arc<dyn RecurringTask>) -> ScheduleHandle {
        info!("Scheduling {} every {:?}", task.name(), interval);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = task.run().await {
                    error!("Recurring task {} failed: {}", task.name(), e);
                }
            }
        });
        ScheduleHandle::from_join(join)
    }
}

/// Records scheduled tasks without running them; the owner triggers runs.
/// For hosts with their own job infrastructure and for tests.
#[derive(Default, Clone)]
pub struct ManualScheduler {
    tasks: Arc<Mutex<Vec<(Duration, Arc<dyn RecurringTask>)>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The task list stays usable after a panic elsewhere poisoned the lock
    fn tasks(&self) -> MutexGuard<'_, Vec<(Duration, Arc<dyn RecurringTask>)>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn scheduled(&self) -> Vec<(Duration, String)> {
        self.tasks()
            .iter()
            .map(|(interval, task)| (*interval, task.name().to_string()))
            .collect()
    }

    /// Run every scheduled task once, in registration order
    pub async fn run_all(&self) -> AuditResult<()> {
        let tasks: Vec<Arc<dyn RecurringTask>> =
            self.tasks().iter().map(|(_, task)| Arc::clone(task)).collect();
        for task in tasks {
            task.run().await?;
        }
        Ok(())
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, interval: Duration, task: Arc<dyn RecurringTask>) -> ScheduleHandle {
        self.tasks().push((interval, task));
        ScheduleHandle::detached()
    }
}
