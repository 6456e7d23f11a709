//! Live task logs
//!
//! Every running task owns a `TaskLogBuffer` inside the shared
//! `TaskLogManager`. The execution backend appends process output to it;
//! the log router reads line ranges from it while the task runs, and the
//! log archive snapshots it when the task finishes.

use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Maximum log entries per task
const DEFAULT_MAX_ENTRIES: usize = 10000;

/// Source of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
    /// Scheduler messages (start, retry, exit)
    System,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Stdout => "stdout",
            LogLevel::Stderr => "stderr",
            LogLevel::System => "system",
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub content: String,
    /// 0-based position in the task's output, assigned on push
    pub line_number: usize,
}

impl LogEntry {
    pub fn new(level: LogLevel, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            content: content.into(),
            line_number: 0,
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new(LogLevel::Stdout, content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new(LogLevel::Stderr, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LogLevel::System, content)
    }

    /// Text form served to readers and written to the archive
    pub fn render(&self) -> String {
        match self.level {
            LogLevel::Stdout => self.content.clone(),
            level => format!("[{}] {}", level.as_str(), self.content),
        }
    }
}

/// Log buffer for a single task, shared by all of its attempts
#[derive(Debug)]
pub struct TaskLogBuffer {
    pub task_id: TaskId,

    entries: VecDeque<LogEntry>,

    max_entries: usize,

    /// Lines pushed so far, including evicted ones
    line_count: usize,

    ended_at: Option<DateTime<Utc>>,
}

impl TaskLogBuffer {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            entries: VecDeque::new(),
            max_entries: DEFAULT_MAX_ENTRIES,
            line_count: 0,
            ended_at: None,
        }
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    /// Add a log entry
    pub fn push(&mut self, mut entry: LogEntry) {
        entry.line_number = self.line_count;
        self.line_count += 1;

        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn push_stdout(&mut self, content: impl Into<String>) {
        self.push(LogEntry::stdout(content));
    }

    pub fn push_stderr(&mut self, content: impl Into<String>) {
        self.push(LogEntry::stderr(content));
    }

    pub fn push_system(&mut self, content: impl Into<String>) {
        self.push(LogEntry::system(content));
    }

    pub fn mark_ended(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    /// A new attempt writes into the same buffer
    pub fn reopen(&mut self) {
        self.ended_at = None;
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Up to `rows` entries starting at `line_number`. Evicted lines are
    /// skipped.
    pub fn range(&self, line_number: usize, rows: usize) -> Vec<&LogEntry> {
        let first = self.entries.front().map_or(0, |e| e.line_number);
        self.entries
            .iter()
            .skip(line_number.saturating_sub(first))
            .take(rows)
            .collect()
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }
}

/// Live log buffers for all tasks
#[derive(Clone)]
pub struct TaskLogManager {
    buffers: Arc<RwLock<HashMap<TaskId, TaskLogBuffer>>>,

    /// Ended buffers beyond this count are evicted oldest first
    max_buffers: usize,
}

impl TaskLogManager {
    pub fn new() -> Self {
        Self {
            buffers: Arc::new(RwLock::new(HashMap::new())),
            max_buffers: 100,
        }
    }

    /// Open the buffer for a new attempt. A retry keeps the lines of the
    /// earlier attempts.
    pub async fn open_buffer(&self, task_id: TaskId, command: &str) {
        let mut buffers = self.buffers.write().await;

        let buffer = buffers.entry(task_id).or_insert_with(|| {
            debug!("Created log buffer for task {}", task_id);
            TaskLogBuffer::new(task_id)
        });
        buffer.reopen();
        buffer.push_system(format!("Starting task: {}", command));

        if buffers.len() > self.max_buffers {
            Self::cleanup_inner(&mut buffers, self.max_buffers);
        }
    }

    fn cleanup_inner(buffers: &mut HashMap<TaskId, TaskLogBuffer>, max_buffers: usize) {
        let mut ended: Vec<(TaskId, DateTime<Utc>)> = buffers
            .iter()
            .filter_map(|(id, buf)| buf.ended_at.map(|t| (*id, t)))
            .collect();

        ended.sort_by_key(|(_, t)| *t);

        let to_remove = ended.len().saturating_sub(max_buffers / 2);
        for (id, _) in ended.into_iter().take(to_remove) {
            buffers.remove(&id);
            debug!("Cleaned up log buffer for task {}", id);
        }
    }

    pub async fn push(&self, task_id: TaskId, entry: LogEntry) {
        let mut buffers = self.buffers.write().await;
        if let Some(buffer) = buffers.get_mut(&task_id) {
            buffer.push(entry);
        }
    }

    pub async fn push_stdout(&self, task_id: TaskId, content: impl Into<String>) {
        self.push(task_id, LogEntry::stdout(content)).await;
    }

    pub async fn push_stderr(&self, task_id: TaskId, content: impl Into<String>) {
        self.push(task_id, LogEntry::stderr(content)).await;
    }

    /// Close the current attempt with a final system line
    pub async fn mark_ended(&self, task_id: TaskId, message: impl Into<String>) {
        let mut buffers = self.buffers.write().await;
        if let Some(buffer) = buffers.get_mut(&task_id) {
            buffer.push_system(message);
            buffer.mark_ended();
        }
    }

    /// Rendered lines `line_number..line_number + rows`
    pub async fn lines(&self, task_id: TaskId, line_number: usize, rows: usize) -> Vec<String> {
        let buffers = self.buffers.read().await;
        buffers
            .get(&task_id)
            .map(|b| b.range(line_number, rows).into_iter().map(LogEntry::render).collect())
            .unwrap_or_default()
    }

    /// Copy of every retained entry
    pub async fn snapshot(&self, task_id: TaskId) -> Option<Vec<LogEntry>> {
        let buffers = self.buffers.read().await;
        buffers.get(&task_id).map(|b| b.entries().cloned().collect())
    }

    /// Drop the buffer once it has been archived
    pub async fn remove(&self, task_id: TaskId) -> bool {
        self.buffers.write().await.remove(&task_id).is_some()
    }
}

impl Default for TaskLogManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        assert_eq!(LogEntry::stdout("hello").render(), "hello");
        assert_eq!(LogEntry::stderr("boom").render(), "[stderr] boom");
        assert_eq!(LogEntry::system("exit 0").render(), "[system] exit 0");
    }

    #[test]
    fn test_buffer_line_numbers() {
        let mut buffer = TaskLogBuffer::new(TaskId(1));
        buffer.push_stdout("a");
        buffer.push_stderr("b");
        buffer.push_stdout("c");

        assert_eq!(buffer.line_count(), 3);
        let lines: Vec<usize> = buffer.entries().map(|e| e.line_number).collect();
        assert_eq!(lines, vec![0, 1, 2]);
    }

    #[test]
    fn test_range_after_eviction() {
        let mut buffer = TaskLogBuffer::new(TaskId(1)).with_max_entries(3);
        for i in 0..5 {
            buffer.push_stdout(format!("line {}", i));
        }

        // lines 0 and 1 were evicted
        let got: Vec<&str> = buffer.range(3, 10).iter().map(|e| e.content.as_str()).collect();
        assert_eq!(got, vec!["line 3", "line 4"]);
        let got: Vec<&str> = buffer.range(0, 2).iter().map(|e| e.content.as_str()).collect();
        assert_eq!(got, vec!["line 2", "line 3"]);
        assert!(buffer.range(9, 2).is_empty());
    }

    #[tokio::test]
    async fn test_manager_lines() {
        let manager = TaskLogManager::new();
        let id = TaskId(7);

        manager.open_buffer(id, "echo hi").await;
        manager.push_stdout(id, "hi").await;
        manager.mark_ended(id, "exit 0").await;

        assert_eq!(
            manager.lines(id, 0, 10).await,
            vec!["[system] Starting task: echo hi", "hi", "[system] exit 0"]
        );
        assert_eq!(manager.lines(id, 1, 1).await, vec!["hi"]);
        assert!(manager.lines(TaskId(8), 0, 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_retry_keeps_earlier_lines() {
        let manager = TaskLogManager::new();
        let id = TaskId(3);

        manager.open_buffer(id, "flaky").await;
        manager.push_stderr(id, "failed").await;
        manager.mark_ended(id, "exit 1").await;
        manager.open_buffer(id, "flaky").await;

        let snapshot = manager.snapshot(id).await.unwrap();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[3].line_number, 3);

        assert!(manager.remove(id).await);
        assert!(manager.snapshot(id).await.is_none());
    }
}
