//! Log archive
//!
//! Persistent home of a task's output once it has finished. The archive is
//! written once, when the task moves to Finished, and serves log reads from
//! then on.

use crate::log::{LogEntry, TaskLogManager};
use crate::task::{FinishedTask, TaskId};
use async_trait::async_trait;
use athena_foundation::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait LogArchive: Send + Sync {
    /// Persist the log snapshot of a finished task
    async fn collect(&self, task: &FinishedTask) -> Result<()>;

    /// Archived lines `line_number..line_number + rows`
    async fn get_log_lines(&self, task_id: TaskId, line_number: usize, rows: usize) -> Result<Vec<String>>;
}

/// Archive writing one `<task_id>.log` file per task
pub struct FileLogArchive {
    dir: PathBuf,
    live: Arc<TaskLogManager>,
}

impl FileLogArchive {
    /// Archive into `dir`, snapshotting buffers from `live`
    pub fn new(dir: impl Into<PathBuf>, live: Arc<TaskLogManager>) -> Self {
        Self {
            dir: dir.into(),
            live,
        }
    }

    pub fn log_path(&self, task_id: TaskId) -> PathBuf {
        self.dir.join(format!("{}.log", task_id))
    }
}

#[async_trait]
impl LogArchive for FileLogArchive {
    async fn collect(&self, task: &FinishedTask) -> Result<()> {
        let task_id = task.task_id();
        let entries = self.live.snapshot(task_id).await.unwrap_or_default();

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::Storage(format!("Failed to create log directory {}: {}", self.dir.display(), e))
        })?;

        let path = self.log_path(task_id);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create {}: {}", path.display(), e)))?;
        for entry in &entries {
            file.write_all(entry.render().as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;

        self.live.remove(task_id).await;
        info!(
            "Archived {} log lines of task {} ({})",
            entries.len(),
            task_id,
            task.state
        );
        Ok(())
    }

    async fn get_log_lines(&self, task_id: TaskId, line_number: usize, rows: usize) -> Result<Vec<String>> {
        let path = self.log_path(task_id);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No archived log for task {}", task_id);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        let mut index = 0;
        while out.len() < rows {
            let Some(line) = lines.next_line().await? else {
                break;
            };
            if index >= line_number {
                out.push(line);
            }
            index += 1;
        }
        Ok(out)
    }
}

/// Archive kept in memory
#[derive(Default)]
pub struct InMemoryLogArchive {
    archived: RwLock<HashMap<TaskId, Vec<String>>>,
    live: Option<Arc<TaskLogManager>>,
}

impl InMemoryLogArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot buffers from `live` on collect
    pub fn with_live(live: Arc<TaskLogManager>) -> Self {
        Self {
            archived: RwLock::new(HashMap::new()),
            live: Some(live),
        }
    }

    pub async fn contains(&self, task_id: TaskId) -> bool {
        self.archived.read().await.contains_key(&task_id)
    }

    /// Seed archived lines directly
    pub async fn insert(&self, task_id: TaskId, lines: Vec<String>) {
        self.archived.write().await.insert(task_id, lines);
    }

    pub async fn len(&self) -> usize {
        self.archived.read().await.len()
    }
}

#[async_trait]
impl LogArchive for InMemoryLogArchive {
    async fn collect(&self, task: &FinishedTask) -> Result<()> {
        let task_id = task.task_id();
        let lines = match &self.live {
            Some(live) => {
                let entries = live.snapshot(task_id).await.unwrap_or_default();
                live.remove(task_id).await;
                entries.iter().map(LogEntry::render).collect()
            }
            None => Vec::new(),
        };
        self.archived.write().await.insert(task_id, lines);
        Ok(())
    }

    async fn get_log_lines(&self, task_id: TaskId, line_number: usize, rows: usize) -> Result<Vec<String>> {
        let archived = self.archived.read().await;
        Ok(archived
            .get(&task_id)
            .map(|lines| lines.iter().skip(line_number).take(rows).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskState;
    use crate::task::NewTask;
    use chrono::Utc;

    fn finished(id: i64) -> FinishedTask {
        NewTask::new("shell", "echo", 1)
            .into_waiting(TaskId(id), Utc::now())
            .start(10, Utc::now())
            .finish(TaskState::Success, Utc::now())
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("athena-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn test_file_archive_round_trip() {
        let live = Arc::new(TaskLogManager::new());
        let task = finished(1);
        live.open_buffer(task.task_id(), "echo").await;
        for i in 0..5 {
            live.push_stdout(task.task_id(), format!("line {}", i)).await;
        }

        let dir = temp_dir("archive");
        let archive = FileLogArchive::new(&dir, Arc::clone(&live));
        archive.collect(&task).await.unwrap();

        // live buffer released after archival
        assert!(live.snapshot(task.task_id()).await.is_none());
        assert!(archive.log_path(task.task_id()).exists());

        let lines = archive.get_log_lines(task.task_id(), 1, 2).await.unwrap();
        assert_eq!(lines, vec!["line 0", "line 1"]);
        let all = archive.get_log_lines(task.task_id(), 0, 100).await.unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0], "[system] Starting task: echo");
        assert!(archive.get_log_lines(task.task_id(), 50, 5).await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_file_archive_missing_task() {
        let archive = FileLogArchive::new(temp_dir("missing"), Arc::new(TaskLogManager::new()));
        assert!(archive.get_log_lines(TaskId(9), 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_archive() {
        let live = Arc::new(TaskLogManager::new());
        let task = finished(2);
        live.open_buffer(task.task_id(), "echo").await;
        live.push_stderr(task.task_id(), "bad").await;

        let archive = InMemoryLogArchive::with_live(Arc::clone(&live));
        archive.collect(&task).await.unwrap();

        assert!(archive.contains(task.task_id()).await);
        assert_eq!(
            archive.get_log_lines(task.task_id(), 1, 5).await.unwrap(),
            vec!["[stderr] bad"]
        );
        assert_eq!(archive.len().await, 1);
    }
}
