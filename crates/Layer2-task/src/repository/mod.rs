//! Task repository
//!
//! Durable home of the three lifecycle records. Every `move_*` is a
//! compare-and-move: it applies completely or not at all, and returns
//! `Ok(false)` without touching anything when the source record is gone.
//! A stale lifecycle event therefore cannot overwrite a newer stage.
//!
//! - `memory` - in-process store behind one lock
//! - `sqlite` - rusqlite store, one transaction per move

mod memory;
mod page;
mod sqlite;

pub use memory::InMemoryTaskRepository;
pub use page::{Order, Page, PageResult, Sort, SortField};
pub use sqlite::SqliteTaskRepository;

use crate::task::{FinishedTask, NewTask, RunningTask, TaskId, TaskRecord, WaitingTask};
use athena_foundation::Result;
use serde::{Deserialize, Serialize};

/// Number of records per stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub waiting: usize,
    pub running: usize,
    pub finished: usize,
}

/// Storage contract consumed by the scheduler
pub trait TaskRepository: Send + Sync {
    /// Create a waiting record with a fresh id
    fn submit(&self, task: NewTask) -> Result<WaitingTask>;

    fn get_waiting_tasks(&self, page: &Page) -> Result<PageResult<WaitingTask>>;

    fn get_waiting_task(&self, task_id: TaskId) -> Result<Option<WaitingTask>>;

    fn get_running_task(&self, task_id: TaskId) -> Result<Option<RunningTask>>;

    fn get_all_running_tasks(&self) -> Result<Vec<RunningTask>>;

    fn get_finished_task(&self, task_id: TaskId) -> Result<Option<FinishedTask>>;

    fn get_finished_tasks(&self, page: &Page) -> Result<PageResult<FinishedTask>>;

    /// Waiting -> Running
    fn move_to_running(&self, task: &RunningTask) -> Result<bool>;

    /// Overwrite an existing running record
    fn update_running_task(&self, task: &RunningTask) -> Result<bool>;

    /// Running -> Finished
    fn move_to_finished(&self, task: &FinishedTask) -> Result<bool>;

    /// Waiting -> Finished (launch failure)
    fn move_from_waiting_to_finished(&self, task: &FinishedTask) -> Result<bool>;

    /// Set the host if none is stored yet. Returns the host now on record,
    /// or `None` if the task does not exist.
    fn assign_host(&self, task_id: TaskId, host: &str) -> Result<Option<String>>;

    fn counts(&self) -> Result<StageCounts>;

    /// Look a task up in whichever stage holds it
    fn find(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        if let Some(task) = self.get_running_task(task_id)? {
            return Ok(Some(TaskRecord::Running(task)));
        }
        if let Some(task) = self.get_waiting_task(task_id)? {
            return Ok(Some(TaskRecord::Waiting(task)));
        }
        Ok(self
            .get_finished_task(task_id)?
            .map(TaskRecord::Finished))
    }
}
