//! Retry scheduler
//!
//! Re-dispatches a failed or lost running task once, after the retry
//! backoff. Killed tasks are suppressed: their pending retry is cancelled
//! and no new one is accepted while the kill is in progress.

use crate::dispatcher::Dispatcher;
use crate::repository::TaskRepository;
use crate::task::{RunningTask, TaskId};
use crate::timer::TaskTimer;
use athena_foundation::{Error, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

type Suppressed = Arc<Mutex<HashSet<TaskId>>>;

fn is_suppressed(suppressed: &Suppressed, task_id: TaskId) -> bool {
    suppressed
        .lock()
        .map(|set| set.contains(&task_id))
        .unwrap_or(false)
}

pub struct RetryScheduler {
    timer: Arc<TaskTimer>,
    repository: Arc<dyn TaskRepository>,
    dispatcher: Arc<Dispatcher>,
    retry_wait: Duration,
    suppressed: Suppressed,
}

impl RetryScheduler {
    pub fn new(
        timer: Arc<TaskTimer>,
        repository: Arc<dyn TaskRepository>,
        dispatcher: Arc<Dispatcher>,
        retry_wait: Duration,
    ) -> Self {
        Self {
            timer,
            repository,
            dispatcher,
            retry_wait,
            suppressed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn retry_wait(&self) -> Duration {
        self.retry_wait
    }

    /// Dispatch `task` again after the backoff. The try counter is not
    /// touched here; it moves on the next confirmed start.
    pub fn schedule_retry(&self, task: &RunningTask) -> Result<()> {
        let task_id = task.task_id();
        if is_suppressed(&self.suppressed, task_id) {
            info!("Task {} is being killed, retry not scheduled", task_id);
            return Ok(());
        }

        let repository = Arc::clone(&self.repository);
        let dispatcher = Arc::clone(&self.dispatcher);
        let suppressed = Arc::clone(&self.suppressed);

        self.timer.schedule_once(task_id, self.retry_wait, async move {
            if is_suppressed(&suppressed, task_id) {
                debug!("Retry of task {} suppressed", task_id);
                return;
            }
            // the task may have finished while the retry was pending
            let current = match repository.get_running_task(task_id) {
                Ok(Some(current)) => current,
                Ok(None) => {
                    debug!("Task {} no longer running, retry dropped", task_id);
                    return;
                }
                Err(e) => {
                    error!("Failed to load task {} for retry: {}", task_id, e);
                    return;
                }
            };

            info!("Retrying task {} (try {} done)", task_id, current.try_number);
            if let Err(e) = dispatcher.schedule(current.info) {
                error!("Failed to dispatch retry of task {}: {}", task_id, e);
            }
        })?;

        debug!("Retry of task {} scheduled in {:?}", task_id, self.retry_wait);
        Ok(())
    }

    pub fn is_pending(&self, task_id: TaskId) -> bool {
        self.timer.is_pending(task_id)
    }

    /// Cancel a pending retry
    pub fn cancel(&self, task_id: TaskId) -> bool {
        self.timer.cancel(task_id)
    }

    /// Block retries of `task_id` and cancel the pending one. Returns true if
    /// a pending retry was cancelled.
    pub fn suppress(&self, task_id: TaskId) -> Result<bool> {
        self.suppressed
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))?
            .insert(task_id);
        Ok(self.timer.cancel(task_id))
    }

    pub fn unsuppress(&self, task_id: TaskId) {
        if let Ok(mut set) = self.suppressed.lock() {
            set.remove(&task_id);
        }
    }

    pub fn is_suppressed(&self, task_id: TaskId) -> bool {
        is_suppressed(&self.suppressed, task_id)
    }
}
