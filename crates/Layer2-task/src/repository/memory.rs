//! In-memory task repository
//!
//! All three stages sit behind a single mutex, so every move is atomic
//! with respect to every other caller.

use super::{Page, PageResult, StageCounts, TaskRepository};
use crate::task::{FinishedTask, NewTask, RunningTask, TaskId, TaskInfo, WaitingTask};
use athena_foundation::{Error, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Stages {
    next_id: i64,
    waiting: HashMap<TaskId, WaitingTask>,
    running: HashMap<TaskId, RunningTask>,
    finished: HashMap<TaskId, FinishedTask>,
}

impl Stages {
    fn info_mut(&mut self, task_id: TaskId) -> Option<&mut TaskInfo> {
        if let Some(t) = self.waiting.get_mut(&task_id) {
            return Some(&mut t.info);
        }
        if let Some(t) = self.running.get_mut(&task_id) {
            return Some(&mut t.info);
        }
        self.finished.get_mut(&task_id).map(|t| &mut t.info)
    }
}

/// Repository kept entirely in process memory
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    stages: Mutex<Stages>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Stages>> {
        self.stages
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    /// Insert a running record directly (restoring state, tests)
    pub fn insert_running(&self, task: RunningTask) -> Result<()> {
        let mut stages = self.lock()?;
        let id = task.task_id();
        if stages.waiting.contains_key(&id) || stages.finished.contains_key(&id) {
            return Err(Error::InvalidInput(format!("task {} already exists", id)));
        }
        stages.next_id = stages.next_id.max(id.0);
        stages.running.insert(id, task);
        Ok(())
    }
}

fn paginate<T: Clone>(items: Vec<&T>, page: &Page) -> PageResult<T> {
    let total = items.len();
    let elements = items
        .into_iter()
        .skip(page.offset())
        .take(page.size)
        .cloned()
        .collect();
    PageResult {
        elements,
        index: page.index,
        total,
    }
}

impl TaskRepository for InMemoryTaskRepository {
    fn submit(&self, task: NewTask) -> Result<WaitingTask> {
        let mut stages = self.lock()?;
        stages.next_id += 1;
        let waiting = task.into_waiting(TaskId(stages.next_id), Utc::now());
        stages.waiting.insert(waiting.task_id(), waiting.clone());
        Ok(waiting)
    }

    fn get_waiting_tasks(&self, page: &Page) -> Result<PageResult<WaitingTask>> {
        let stages = self.lock()?;
        let mut items: Vec<&WaitingTask> = stages.waiting.values().collect();
        items.sort_by(|a, b| page.compare(&a.info, &b.info));
        Ok(paginate(items, page))
    }

    fn get_waiting_task(&self, task_id: TaskId) -> Result<Option<WaitingTask>> {
        Ok(self.lock()?.waiting.get(&task_id).cloned())
    }

    fn get_running_task(&self, task_id: TaskId) -> Result<Option<RunningTask>> {
        Ok(self.lock()?.running.get(&task_id).cloned())
    }

    fn get_all_running_tasks(&self) -> Result<Vec<RunningTask>> {
        let stages = self.lock()?;
        let mut tasks: Vec<RunningTask> = stages.running.values().cloned().collect();
        tasks.sort_by_key(|t| t.task_id());
        Ok(tasks)
    }

    fn get_finished_task(&self, task_id: TaskId) -> Result<Option<FinishedTask>> {
        Ok(self.lock()?.finished.get(&task_id).cloned())
    }

    fn get_finished_tasks(&self, page: &Page) -> Result<PageResult<FinishedTask>> {
        let stages = self.lock()?;
        let mut items: Vec<&FinishedTask> = stages.finished.values().collect();
        items.sort_by(|a, b| page.compare(&a.info, &b.info));
        Ok(paginate(items, page))
    }

    fn move_to_running(&self, task: &RunningTask) -> Result<bool> {
        let mut stages = self.lock()?;
        let id = task.task_id();
        if stages.waiting.remove(&id).is_none() {
            return Ok(false);
        }
        stages.running.insert(id, task.clone());
        Ok(true)
    }

    fn update_running_task(&self, task: &RunningTask) -> Result<bool> {
        let mut stages = self.lock()?;
        match stages.running.get_mut(&task.task_id()) {
            Some(current) => {
                *current = task.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn move_to_finished(&self, task: &FinishedTask) -> Result<bool> {
        let mut stages = self.lock()?;
        let id = task.task_id();
        if stages.running.remove(&id).is_none() {
            return Ok(false);
        }
        stages.finished.insert(id, task.clone());
        Ok(true)
    }

    fn move_from_waiting_to_finished(&self, task: &FinishedTask) -> Result<bool> {
        let mut stages = self.lock()?;
        let id = task.task_id();
        if stages.waiting.remove(&id).is_none() {
            return Ok(false);
        }
        stages.finished.insert(id, task.clone());
        Ok(true)
    }

    fn assign_host(&self, task_id: TaskId, host: &str) -> Result<Option<String>> {
        let mut stages = self.lock()?;
        let Some(info) = stages.info_mut(task_id) else {
            return Ok(None);
        };
        if !info.has_host() {
            info.host = Some(host.to_string());
        }
        Ok(info.host.clone())
    }

    fn counts(&self) -> Result<StageCounts> {
        let stages = self.lock()?;
        Ok(StageCounts {
            waiting: stages.waiting.len(),
            running: stages.running.len(),
            finished: stages.finished.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskState;

    #[test]
    fn test_submit_assigns_ids() {
        let repo = InMemoryTaskRepository::new();
        let a = repo.submit(NewTask::new("shell", "true", 1)).unwrap();
        let b = repo.submit(NewTask::new("shell", "true", 1)).unwrap();
        assert_ne!(a.task_id(), b.task_id());
        assert_eq!(repo.counts().unwrap().waiting, 2);
    }

    #[test]
    fn test_waiting_page_is_oldest_first() {
        let repo = InMemoryTaskRepository::new();
        let ids: Vec<TaskId> = (0..3)
            .map(|i| {
                repo.submit(NewTask::new("shell", format!("echo {}", i), 1))
                    .unwrap()
                    .task_id()
            })
            .collect();

        let page = repo.get_waiting_tasks(&Page::oldest_first(2)).unwrap();
        assert_eq!(page.total, 3);
        let got: Vec<TaskId> = page.elements.iter().map(|t| t.task_id()).collect();
        assert_eq!(got, ids[..2].to_vec());
    }

    #[test]
    fn test_moves_are_compare_and_move() {
        let repo = InMemoryTaskRepository::new();
        let waiting = repo.submit(NewTask::new("shell", "true", 2)).unwrap();
        let running = waiting.clone().start(10, Utc::now());

        assert!(repo.move_to_running(&running).unwrap());
        // waiting record is gone, second promotion is stale
        assert!(!repo.move_to_running(&running).unwrap());
        assert!(!repo
            .move_from_waiting_to_finished(&waiting.fail_to_launch(Utc::now()))
            .unwrap());

        let finished = running.clone().finish(TaskState::Success, Utc::now());
        assert!(repo.move_to_finished(&finished).unwrap());
        assert!(!repo
            .move_to_finished(&running.finish(TaskState::Lost, Utc::now()))
            .unwrap());

        let stored = repo.get_finished_task(finished.task_id()).unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Success);
        assert_eq!(
            repo.counts().unwrap(),
            StageCounts {
                waiting: 0,
                running: 0,
                finished: 1
            }
        );
    }

    #[test]
    fn test_assign_host_once() {
        let repo = InMemoryTaskRepository::new();
        let waiting = repo.submit(NewTask::new("shell", "true", 1)).unwrap();
        let id = waiting.task_id();

        assert_eq!(repo.assign_host(id, "node-a").unwrap().as_deref(), Some("node-a"));
        assert_eq!(repo.assign_host(id, "node-b").unwrap().as_deref(), Some("node-a"));
        assert_eq!(repo.assign_host(TaskId(999), "node-a").unwrap(), None);
    }

    #[test]
    fn test_find_reports_stage() {
        let repo = InMemoryTaskRepository::new();
        let waiting = repo.submit(NewTask::new("shell", "true", 1)).unwrap();
        let id = waiting.task_id();
        assert!(matches!(repo.find(id).unwrap(), Some(crate::TaskRecord::Waiting(_))));

        repo.move_to_running(&waiting.start(1, Utc::now())).unwrap();
        let record = repo.find(id).unwrap().unwrap();
        assert_eq!(record.try_number(), 1);
        assert!(repo.find(TaskId(404)).unwrap().is_none());
    }
}
