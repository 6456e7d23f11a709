//! # athena-task
//!
//! Task scheduling core for Athena.
//! Moves tasks through waiting, running and finished stages by reacting to
//! lifecycle events reported by an execution backend.
//!
//! ## Features
//!
//! - Periodic dispatch of waiting tasks, oldest first
//! - Startup recovery of running records the backend lost
//! - Bounded retries of failed and lost tasks after a backoff
//! - Kill with a terminal, never-retried outcome
//! - **Live log streaming and archival on completion**
//! - In-memory and SQLite task repositories

pub mod archive;
pub mod backend;
pub mod callback;
pub mod dispatcher;
pub mod log;
pub mod repository;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod timer;

// Scheduler
pub use scheduler::{SchedulerConfig, TaskScheduler};
pub use callback::{CallbackContext, LifecycleHandler};
pub use dispatcher::{Dispatcher, HostSelector, LocalhostSelector, DEFAULT_HOST};
pub use retry::RetryScheduler;
pub use timer::{ShutdownSignal, TaskTimer};

// Task records
pub use state::{TaskStage, TaskState};
pub use task::{FinishedTask, NewTask, RunningTask, TaskId, TaskInfo, TaskRecord, WaitingTask};

// Repositories
pub use repository::{
    InMemoryTaskRepository, Order, Page, PageResult, Sort, SortField, SqliteTaskRepository,
    StageCounts, TaskRepository,
};

// Execution backends
pub use backend::{ExecutionBackend, KillHandle, LocalBackend, OnKilled, TaskCallback};

// Log system
pub use archive::{FileLogArchive, InMemoryLogArchive, LogArchive};
pub use log::{LogEntry, LogLevel, TaskLogBuffer, TaskLogManager};
