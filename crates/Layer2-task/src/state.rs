//! Task lifecycle stages and terminal states

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Terminal outcome of a finished task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Process exited successfully
    Success,

    /// Process failed with no tries left, never launched, or was killed
    Failed,

    /// Backend lost track of the process with no tries left
    Lost,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
            TaskState::Lost => "LOST",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskState::Success)
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(TaskState::Success),
            "FAILED" => Ok(TaskState::Failed),
            "LOST" => Ok(TaskState::Lost),
            other => Err(format!("unknown task state: {}", other)),
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle stage a task record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStage {
    Waiting,
    Running,
    Finished,
}

impl TaskStage {
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskStage::Waiting => "Waiting",
            TaskStage::Running => "Running",
            TaskStage::Finished => "Finished",
        }
    }

    /// Table backing this stage in the SQL repository
    pub fn table(&self) -> &'static str {
        match self {
            TaskStage::Waiting => "waiting_task",
            TaskStage::Running => "running_task",
            TaskStage::Finished => "finished_task",
        }
    }
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parse() {
        assert_eq!("LOST".parse::<TaskState>(), Ok(TaskState::Lost));
        assert!("lost".parse::<TaskState>().is_err());
        assert_eq!(TaskState::Failed.to_string(), "FAILED");
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&TaskState::Success).unwrap();
        assert_eq!(json, "\"SUCCESS\"");
    }
}
