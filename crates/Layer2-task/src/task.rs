//! Task records
//!
//! A task lives in exactly one of three records at any instant:
//! `WaitingTask` -> `RunningTask` -> `FinishedTask`. Promotions are pure
//! conversions that consume the source record.

use crate::state::{TaskStage, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl TaskId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(TaskId)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fields shared by every lifecycle record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Unique task identifier
    pub task_id: TaskId,

    /// Free-form task kind, used for host selection
    pub task_type: String,

    /// Shell command the backend runs
    pub command: String,

    /// When the task was submitted
    pub submit_time: DateTime<Utc>,

    /// Execution host, assigned once before the first dispatch
    pub host: Option<String>,

    /// Upper bound for `try_number`
    pub max_tries: u32,
}

impl TaskInfo {
    pub fn has_host(&self) -> bool {
        self.host.as_deref().is_some_and(|h| !h.trim().is_empty())
    }
}

/// Submission request for a new task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: String,
    pub command: String,
    pub max_tries: u32,
    pub host: Option<String>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, command: impl Into<String>, max_tries: u32) -> Self {
        Self {
            task_type: task_type.into(),
            command: command.into(),
            max_tries,
            host: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Build the waiting record once the store has assigned an id
    pub fn into_waiting(self, task_id: TaskId, submit_time: DateTime<Utc>) -> WaitingTask {
        WaitingTask {
            info: TaskInfo {
                task_id,
                task_type: self.task_type,
                command: self.command,
                submit_time,
                host: self.host,
                max_tries: self.max_tries,
            },
        }
    }
}

/// Queued, never started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingTask {
    #[serde(flatten)]
    pub info: TaskInfo,
}

impl WaitingTask {
    pub fn task_id(&self) -> TaskId {
        self.info.task_id
    }

    /// First confirmed start
    pub fn start(self, pid: u32, now: DateTime<Utc>) -> RunningTask {
        RunningTask {
            info: self.info,
            start_time: now,
            pid,
            try_number: 1,
        }
    }

    /// The process never started: finished as FAILED on its first try
    pub fn fail_to_launch(self, now: DateTime<Utc>) -> FinishedTask {
        FinishedTask {
            info: self.info,
            start_time: None,
            pid: None,
            try_number: 1,
            end_time: now,
            state: TaskState::Failed,
        }
    }
}

/// Started at least once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTask {
    #[serde(flatten)]
    pub info: TaskInfo,
    pub start_time: DateTime<Utc>,
    pub pid: u32,
    /// Confirmed starts, `1..=max_tries`
    pub try_number: u32,
}

impl RunningTask {
    pub fn task_id(&self) -> TaskId {
        self.info.task_id
    }

    /// Whether another attempt is allowed
    pub fn has_tries_left(&self) -> bool {
        self.try_number < self.info.max_tries
    }

    /// Record a confirmed retry start. The counter saturates at `max_tries`;
    /// returns false when it was already there.
    pub fn restart(&mut self, pid: u32) -> bool {
        self.pid = pid;
        if self.try_number >= self.info.max_tries {
            return false;
        }
        self.try_number += 1;
        true
    }

    pub fn finish(self, state: TaskState, now: DateTime<Utc>) -> FinishedTask {
        FinishedTask {
            info: self.info,
            start_time: Some(self.start_time),
            pid: Some(self.pid),
            try_number: self.try_number,
            end_time: now,
            state,
        }
    }
}

/// Terminal record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedTask {
    #[serde(flatten)]
    pub info: TaskInfo,
    /// `None` when the process never started
    pub start_time: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub try_number: u32,
    pub end_time: DateTime<Utc>,
    pub state: TaskState,
}

impl FinishedTask {
    pub fn task_id(&self) -> TaskId {
        self.info.task_id
    }
}

/// A task in whichever stage it currently is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum TaskRecord {
    Waiting(WaitingTask),
    Running(RunningTask),
    Finished(FinishedTask),
}

impl TaskRecord {
    pub fn info(&self) -> &TaskInfo {
        match self {
            TaskRecord::Waiting(t) => &t.info,
            TaskRecord::Running(t) => &t.info,
            TaskRecord::Finished(t) => &t.info,
        }
    }

    pub fn stage(&self) -> TaskStage {
        match self {
            TaskRecord::Waiting(_) => TaskStage::Waiting,
            TaskRecord::Running(_) => TaskStage::Running,
            TaskRecord::Finished(_) => TaskStage::Finished,
        }
    }

    /// Attempts started so far
    pub fn try_number(&self) -> u32 {
        match self {
            TaskRecord::Waiting(_) => 0,
            TaskRecord::Running(t) => t.try_number,
            TaskRecord::Finished(t) => t.try_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting(max_tries: u32) -> WaitingTask {
        NewTask::new("shell", "echo hi", max_tries).into_waiting(TaskId(1), Utc::now())
    }

    #[test]
    fn test_start_sets_first_try() {
        let running = waiting(3).start(42, Utc::now());
        assert_eq!(running.try_number, 1);
        assert_eq!(running.pid, 42);
        assert!(running.has_tries_left());
    }

    #[test]
    fn test_restart_saturates() {
        let mut running = waiting(2).start(1, Utc::now());
        assert!(running.restart(2));
        assert_eq!(running.try_number, 2);
        assert!(!running.has_tries_left());

        assert!(!running.restart(3));
        assert_eq!(running.try_number, 2);
        assert_eq!(running.pid, 3);
    }

    #[test]
    fn test_finish_preserves_tries() {
        let mut running = waiting(3).start(1, Utc::now());
        running.restart(7);
        let finished = running.finish(TaskState::Success, Utc::now());
        assert_eq!(finished.try_number, 2);
        assert_eq!(finished.pid, Some(7));
        assert!(finished.start_time.is_some());
    }

    #[test]
    fn test_launch_failure_record() {
        let finished = waiting(5).fail_to_launch(Utc::now());
        assert_eq!(finished.state, TaskState::Failed);
        assert_eq!(finished.try_number, 1);
        assert!(finished.start_time.is_none());
    }

    #[test]
    fn test_task_id_parse() {
        assert_eq!(" 17 ".parse::<TaskId>().unwrap(), TaskId(17));
        assert!("abc".parse::<TaskId>().is_err());
    }
}
