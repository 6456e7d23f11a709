//! Backend and callback contracts

use super::KillHandle;
use crate::task::{TaskId, TaskInfo};
use async_trait::async_trait;
use athena_foundation::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Completion hook run once a kill has been carried out
pub type OnKilled = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Lifecycle events reported by a backend
#[async_trait]
pub trait TaskCallback: Send + Sync {
    /// A process for the task was actually started. `Err(Error::Cancelled)`
    /// means the task already finished and the backend must kill the process.
    async fn on_started(&self, task_id: TaskId, pid: u32) -> Result<()>;

    async fn on_success(&self, task_id: TaskId) -> Result<()>;

    /// The process exited unsuccessfully, or could not be launched at all
    async fn on_failure(&self, task_id: TaskId) -> Result<()>;

    /// The backend can no longer account for the process
    async fn on_lost(&self, task_id: TaskId) -> Result<()>;
}

/// Implement to add a new execution backend
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Install the receiver of lifecycle events
    fn register_callback(&self, callback: Arc<dyn TaskCallback>);

    async fn start(&self) -> Result<()>;

    /// Stop accepting work and terminate live processes without reporting
    async fn stop(&self) -> Result<()>;

    /// Launch the task. Returns immediately; the outcome arrives through
    /// the callback.
    fn run_task(&self, task: TaskInfo);

    async fn is_task_running(&self, task_id: TaskId) -> bool;

    /// Terminate the task's process, then run `on_killed`
    fn kill_task(&self, task_id: TaskId, on_killed: OnKilled) -> KillHandle;

    /// Live output lines `line_number..line_number + rows`
    async fn get_log_lines(&self, task_id: TaskId, line_number: usize, rows: usize) -> Result<Vec<String>>;

    fn name(&self) -> &'static str;
}
