//! Dispatcher - hands tasks to the execution backend
//!
//! Serves first attempts from the waiting queue, retries of running tasks
//! and recovery re-dispatches alike.

use crate::backend::ExecutionBackend;
use crate::repository::TaskRepository;
use crate::task::TaskInfo;
use athena_foundation::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Host used when no placement policy is configured
pub const DEFAULT_HOST: &str = "localhost";

/// Chooses the execution host of a task
pub trait HostSelector: Send + Sync {
    fn select_host(&self, task: &TaskInfo) -> String;
}

/// Places every task on this host
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalhostSelector;

impl HostSelector for LocalhostSelector {
    fn select_host(&self, _task: &TaskInfo) -> String {
        DEFAULT_HOST.to_string()
    }
}

pub struct Dispatcher {
    backend: Arc<dyn ExecutionBackend>,
    repository: Arc<dyn TaskRepository>,
    host_selector: Arc<dyn HostSelector>,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        repository: Arc<dyn TaskRepository>,
        host_selector: Arc<dyn HostSelector>,
    ) -> Self {
        Self {
            backend,
            repository,
            host_selector,
        }
    }

    /// Assign a host if the task has none, then launch it. The outcome is
    /// reported later through the backend callback.
    pub fn schedule(&self, mut task: TaskInfo) -> Result<()> {
        if !task.has_host() {
            let chosen = self.host_selector.select_host(&task);
            // the stored host wins if another dispatch got there first
            match self.repository.assign_host(task.task_id, &chosen)? {
                Some(stored) => task.host = Some(stored),
                None => {
                    warn!("Task {} vanished before dispatch, assigning {} locally", task.task_id, chosen);
                    task.host = Some(chosen);
                }
            }
            debug!("Task {} placed on {}", task.task_id, task.host.as_deref().unwrap_or_default());
        }

        info!(
            "Dispatching task {} to {} backend",
            task.task_id,
            self.backend.name()
        );
        self.backend.run_task(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KillHandle, OnKilled, TaskCallback};
    use crate::repository::InMemoryTaskRepository;
    use crate::task::{NewTask, TaskId};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        launched: Mutex<Vec<TaskInfo>>,
    }

    #[async_trait]
    impl ExecutionBackend for RecordingBackend {
        fn register_callback(&self, _callback: Arc<dyn TaskCallback>) {}
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn run_task(&self, task: TaskInfo) {
            self.launched.lock().unwrap().push(task);
        }
        async fn is_task_running(&self, _task_id: TaskId) -> bool {
            false
        }
        fn kill_task(&self, task_id: TaskId, on_killed: OnKilled) -> KillHandle {
            KillHandle::spawn(task_id, on_killed())
        }
        async fn get_log_lines(&self, _: TaskId, _: usize, _: usize) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct FixedHost(&'static str);

    impl HostSelector for FixedHost {
        fn select_host(&self, _task: &TaskInfo) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn test_assigns_host_once() {
        let backend = Arc::new(RecordingBackend::default());
        let repo = Arc::new(InMemoryTaskRepository::new());
        let waiting = repo.submit(NewTask::new("shell", "true", 1)).unwrap();

        let first = Dispatcher::new(backend.clone(), repo.clone(), Arc::new(LocalhostSelector));
        first.schedule(waiting.info.clone()).unwrap();

        // a second dispatch with a different selector keeps the stored host
        let second = Dispatcher::new(backend.clone(), repo.clone(), Arc::new(FixedHost("node-b")));
        second.schedule(waiting.info.clone()).unwrap();

        let launched = backend.launched.lock().unwrap();
        assert_eq!(launched.len(), 2);
        assert_eq!(launched[0].host.as_deref(), Some(DEFAULT_HOST));
        assert_eq!(launched[1].host.as_deref(), Some(DEFAULT_HOST));

        let stored = repo.get_waiting_task(waiting.task_id()).unwrap().unwrap();
        assert_eq!(stored.info.host.as_deref(), Some(DEFAULT_HOST));
    }

    #[test]
    fn test_keeps_existing_host() {
        let backend = Arc::new(RecordingBackend::default());
        let repo = Arc::new(InMemoryTaskRepository::new());
        let waiting = repo
            .submit(NewTask::new("shell", "true", 1).with_host("gpu-1"))
            .unwrap();

        let dispatcher = Dispatcher::new(backend.clone(), repo, Arc::new(FixedHost("node-b")));
        dispatcher.schedule(waiting.info).unwrap();

        assert_eq!(
            backend.launched.lock().unwrap()[0].host.as_deref(),
            Some("gpu-1")
        );
    }
}
