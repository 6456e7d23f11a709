//! Lifecycle callback handler
//!
//! Turns backend events into repository transitions:
//!
//! | event       | running record               | no running record         |
//! |-------------|------------------------------|---------------------------|
//! | started     | try + 1, new pid             | waiting -> running, try 1 |
//! |             |                              | finished: `Cancelled`     |
//! | success     | -> finished SUCCESS, archive | ignored                   |
//! | failure     | retry, or -> FAILED, archive | waiting -> FAILED, try 1  |
//! | lost        | retry, or -> LOST, archive   | ignored                   |
//! | killed      | -> FAILED, never retried     | ignored                   |
//!
//! Events for one task are serialized by a per-task lock, and every write
//! is a compare-and-move, so a stale event cannot overwrite a newer stage.

use crate::archive::LogArchive;
use crate::backend::TaskCallback;
use crate::repository::TaskRepository;
use crate::retry::RetryScheduler;
use crate::state::TaskState;
use crate::task::{FinishedTask, RunningTask, TaskId};
use async_trait::async_trait;
use athena_foundation::{Error, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// Everything the handler needs, passed in explicitly
#[derive(Clone)]
pub struct CallbackContext {
    pub repository: Arc<dyn TaskRepository>,
    pub archive: Arc<dyn LogArchive>,
    pub retry: Arc<RetryScheduler>,
}

/// One async lock per task with events in flight
#[derive(Default)]
struct TaskLocks {
    locks: Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TaskLocks {
    async fn acquire(&self, task_id: TaskId) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| Error::Internal("Lock poisoned".to_string()))?;
            Arc::clone(locks.entry(task_id).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    /// Forget the lock once nobody holds or waits on it
    fn release(&self, task_id: TaskId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        if let Ok(mut locks) = self.locks.lock() {
            if locks.get(&task_id).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(&task_id);
            }
        }
    }

    fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// Why a running task ended unsuccessfully
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Setback {
    Failed,
    Lost,
}

impl Setback {
    fn terminal_state(self) -> TaskState {
        match self {
            Setback::Failed => TaskState::Failed,
            Setback::Lost => TaskState::Lost,
        }
    }
}

pub struct LifecycleHandler {
    ctx: CallbackContext,
    locks: TaskLocks,
}

impl LifecycleHandler {
    pub fn new(ctx: CallbackContext) -> Self {
        Self {
            ctx,
            locks: TaskLocks::default(),
        }
    }

    pub fn context(&self) -> &CallbackContext {
        &self.ctx
    }

    /// Run `f` while holding the task's lock
    async fn serialized<F, Fut>(&self, task_id: TaskId, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let guard = self.locks.acquire(task_id).await?;
        let result = f().await;
        self.locks.release(task_id, guard);
        result
    }

    async fn archive(&self, finished: &FinishedTask) {
        if let Err(e) = self.ctx.archive.collect(finished).await {
            error!("Failed to archive logs of task {}: {}", finished.task_id(), e);
        }
    }

    /// Move a running task to its terminal state and archive its logs
    async fn finish(&self, running: RunningTask, state: TaskState) -> Result<()> {
        let task_id = running.task_id();
        let finished = running.finish(state, Utc::now());
        if !self.ctx.repository.move_to_finished(&finished)? {
            warn!("Task {} left running stage concurrently, {} dropped", task_id, state);
            return Ok(());
        }
        info!("Task {} finished: {} (try {})", task_id, state, finished.try_number);
        self.archive(&finished).await;
        Ok(())
    }

    /// Failed or lost while running: retry if tries remain
    async fn handle_setback(&self, task_id: TaskId, setback: Setback) -> Result<bool> {
        let Some(running) = self.ctx.repository.get_running_task(task_id)? else {
            return Ok(false);
        };

        if running.has_tries_left() {
            info!(
                "Task {} {:?} on try {} of {}, retrying in {:?}",
                task_id,
                setback,
                running.try_number,
                running.info.max_tries,
                self.ctx.retry.retry_wait()
            );
            self.ctx.retry.schedule_retry(&running)?;
        } else {
            self.finish(running, setback.terminal_state()).await?;
        }
        Ok(true)
    }

    /// A launch failure is terminal: the task is finished as FAILED on its
    /// first try and never retried, whatever its `max_tries`.
    fn finish_launch_failure(&self, task_id: TaskId) -> Result<()> {
        let Some(waiting) = self.ctx.repository.get_waiting_task(task_id)? else {
            warn!("Failure reported for task {} which is neither waiting nor running", task_id);
            return Ok(());
        };

        let finished = waiting.fail_to_launch(Utc::now());
        if self.ctx.repository.move_from_waiting_to_finished(&finished)? {
            info!("Task {} failed to launch, finished as FAILED", task_id);
        } else {
            warn!("Task {} left waiting stage concurrently, launch failure dropped", task_id);
        }
        Ok(())
    }

    async fn started(&self, task_id: TaskId, pid: u32) -> Result<()> {
        let repo = &self.ctx.repository;
        match repo.get_running_task(task_id)? {
            None => {
                let Some(waiting) = repo.get_waiting_task(task_id)? else {
                    if repo.get_finished_task(task_id)?.is_some() {
                        warn!("Start reported for finished task {}, pid {} must stop", task_id, pid);
                        return Err(Error::Cancelled);
                    }
                    warn!("Start reported for unknown task {}", task_id);
                    return Ok(());
                };
                let running = waiting.start(pid, Utc::now());
                if repo.move_to_running(&running)? {
                    info!("Task {} started, pid {}, try number: 1", task_id, pid);
                } else {
                    warn!("Task {} left waiting stage concurrently, start dropped", task_id);
                }
            }
            Some(mut running) => {
                if running.restart(pid) {
                    info!(
                        "Task {} retry started, pid {}, try number: {}",
                        task_id, pid, running.try_number
                    );
                } else {
                    warn!(
                        "Task {} started again at max tries {}, try number kept",
                        task_id, running.info.max_tries
                    );
                }
                if !repo.update_running_task(&running)? {
                    warn!("Task {} left running stage concurrently, restart dropped", task_id);
                }
            }
        }
        Ok(())
    }

    async fn succeeded(&self, task_id: TaskId) -> Result<()> {
        match self.ctx.repository.get_running_task(task_id)? {
            Some(running) => self.finish(running, TaskState::Success).await,
            None => {
                warn!("Success reported for task {} which is not running", task_id);
                Ok(())
            }
        }
    }

    async fn failed(&self, task_id: TaskId) -> Result<()> {
        if self.handle_setback(task_id, Setback::Failed).await? {
            return Ok(());
        }
        self.finish_launch_failure(task_id)
    }

    async fn lost(&self, task_id: TaskId) -> Result<()> {
        if !self.handle_setback(task_id, Setback::Lost).await? {
            debug!("Lost reported for task {} which is not running", task_id);
        }
        Ok(())
    }

    async fn killed(&self, task_id: TaskId) -> Result<()> {
        match self.ctx.repository.get_running_task(task_id)? {
            Some(running) => {
                let finished = running.finish(TaskState::Failed, Utc::now());
                if self.ctx.repository.move_to_finished(&finished)? {
                    info!("Task {} killed", task_id);
                }
            }
            None => debug!("Task {} not running, kill had nothing to finish", task_id),
        }
        Ok(())
    }

    /// Completion of a kill. Terminal: no retry follows.
    pub async fn on_killed(&self, task_id: TaskId) -> Result<()> {
        let result = self.serialized(task_id, move || self.killed(task_id)).await;
        self.ctx.retry.unsuppress(task_id);
        result
    }

    /// Tasks with an event currently being handled
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}

#[async_trait]
impl TaskCallback for LifecycleHandler {
    async fn on_started(&self, task_id: TaskId, pid: u32) -> Result<()> {
        self.serialized(task_id, move || self.started(task_id, pid)).await
    }

    async fn on_success(&self, task_id: TaskId) -> Result<()> {
        self.serialized(task_id, move || self.succeeded(task_id)).await
    }

    async fn on_failure(&self, task_id: TaskId) -> Result<()> {
        self.serialized(task_id, move || self.failed(task_id)).await
    }

    async fn on_lost(&self, task_id: TaskId) -> Result<()> {
        self.serialized(task_id, move || self.lost(task_id)).await
    }
}
