//! Task scheduler - owns the control loop
//!
//! Wires the repository, execution backend and log archive together:
//! - polls the oldest waiting tasks on a fixed delay and dispatches them
//! - reconciles running records against the backend once at startup
//! - routes backend events into the lifecycle handler
//! - kills tasks and serves log lines from the live source or the archive

use crate::archive::LogArchive;
use crate::backend::{ExecutionBackend, KillHandle};
use crate::callback::{CallbackContext, LifecycleHandler};
use crate::dispatcher::{Dispatcher, HostSelector, LocalhostSelector};
use crate::repository::{Page, StageCounts, TaskRepository};
use crate::retry::RetryScheduler;
use crate::task::{NewTask, TaskId, TaskInfo, TaskRecord, WaitingTask};
use crate::timer::{ShutdownSignal, TaskTimer};
use athena_foundation::{AthenaConfig, Error, Result};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Runtime settings of the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between waiting-task polls
    pub poll_interval: Duration,

    /// Bounded wait for in-flight work on stop
    pub shutdown_grace: Duration,

    /// Backoff before a failed or lost task is dispatched again
    pub retry_wait: Duration,

    /// Waiting tasks fetched per poll
    pub page_size: usize,

    /// `max_tries` for submissions that leave it at 0
    pub default_max_tries: u32,

    /// Skip waiting tasks the backend already runs
    pub dedupe_waiting_dispatch: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&AthenaConfig::default())
    }
}

impl From<&AthenaConfig> for SchedulerConfig {
    fn from(config: &AthenaConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            shutdown_grace: config.shutdown_grace(),
            retry_wait: config.retry_wait(),
            page_size: config.page_size,
            default_max_tries: config.default_max_tries,
            dedupe_waiting_dispatch: config.dedupe_waiting_dispatch,
        }
    }
}

/// One poll of the waiting queue
#[derive(Clone)]
struct WaitingTaskPoller {
    repository: Arc<dyn TaskRepository>,
    backend: Arc<dyn ExecutionBackend>,
    dispatcher: Arc<Dispatcher>,
    page_size: usize,
    dedupe: bool,
}

impl WaitingTaskPoller {
    /// Dispatch the oldest page of waiting tasks in submit order. Stops
    /// between tasks once `signal` is raised; the rest stay waiting.
    async fn poll(&self, signal: &ShutdownSignal) -> Result<usize> {
        let page = self
            .repository
            .get_waiting_tasks(&Page::oldest_first(self.page_size))?;
        if page.is_empty() {
            return Ok(0);
        }
        debug!("Polled {} of {} waiting tasks", page.elements.len(), page.total);

        let mut dispatched = 0;
        for task in page.into_elements() {
            if signal.is_raised() {
                debug!("Shutdown raised, leaving remaining waiting tasks");
                break;
            }
            if self.dedupe && self.backend.is_task_running(task.task_id()).await {
                debug!("Task {} already launched, waiting for its start", task.task_id());
                continue;
            }
            self.dispatcher.schedule(task.info)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

pub struct TaskScheduler {
    config: SchedulerConfig,
    repository: Arc<dyn TaskRepository>,
    backend: Arc<dyn ExecutionBackend>,
    archive: Arc<dyn LogArchive>,
    dispatcher: Arc<Dispatcher>,
    timer: Arc<TaskTimer>,
    retry: Arc<RetryScheduler>,
    handler: Arc<LifecycleHandler>,
    poller: WaitingTaskPoller,
    started: AtomicBool,
}

impl TaskScheduler {
    /// Scheduler placing every task on the local host
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn TaskRepository>,
        backend: Arc<dyn ExecutionBackend>,
        archive: Arc<dyn LogArchive>,
    ) -> Self {
        Self::with_host_selector(config, repository, backend, archive, Arc::new(LocalhostSelector))
    }

    pub fn with_host_selector(
        config: SchedulerConfig,
        repository: Arc<dyn TaskRepository>,
        backend: Arc<dyn ExecutionBackend>,
        archive: Arc<dyn LogArchive>,
        host_selector: Arc<dyn HostSelector>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&backend),
            Arc::clone(&repository),
            host_selector,
        ));
        let timer = Arc::new(TaskTimer::new());
        let retry = Arc::new(RetryScheduler::new(
            Arc::clone(&timer),
            Arc::clone(&repository),
            Arc::clone(&dispatcher),
            config.retry_wait,
        ));
        let handler = Arc::new(LifecycleHandler::new(CallbackContext {
            repository: Arc::clone(&repository),
            archive: Arc::clone(&archive),
            retry: Arc::clone(&retry),
        }));
        let poller = WaitingTaskPoller {
            repository: Arc::clone(&repository),
            backend: Arc::clone(&backend),
            dispatcher: Arc::clone(&dispatcher),
            page_size: config.page_size,
            dedupe: config.dedupe_waiting_dispatch,
        };

        Self {
            config,
            repository,
            backend,
            archive,
            dispatcher,
            timer,
            retry,
            handler,
            poller,
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn repository(&self) -> Arc<dyn TaskRepository> {
        Arc::clone(&self.repository)
    }

    pub fn handler(&self) -> Arc<LifecycleHandler> {
        Arc::clone(&self.handler)
    }

    /// Start the backend and the poll loop, then run the recovery check
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidInput("scheduler already started".to_string()));
        }

        self.backend.register_callback(self.handler.clone());
        self.backend.start().await?;

        let poller = self.poller.clone();
        self.timer
            .schedule_with_fixed_delay("waiting-task-poll", self.config.poll_interval, move |signal| {
                let poller = poller.clone();
                async move {
                    if let Err(e) = poller.poll(&signal).await {
                        error!("Failed to schedule waiting tasks: {}", e);
                    }
                }
            })?;
        info!(
            "Task scheduler started ({} backend, poll every {:?})",
            self.backend.name(),
            self.config.poll_interval
        );

        let recovered = self.check_running_tasks().await?;
        if recovered > 0 {
            info!("Recovered {} running tasks", recovered);
        }
        Ok(())
    }

    /// Stop the backend, then the timers. Waiting for in-flight work is
    /// best effort.
    pub async fn stop(&self) -> Result<()> {
        if let Err(e) = self.backend.stop().await {
            error!("Failed to stop {} backend: {}", self.backend.name(), e);
        }

        match self.timer.shutdown(self.config.shutdown_grace).await {
            Ok(()) => info!("Task scheduler stopped"),
            Err(Error::Timeout(msg)) => warn!("Task scheduler stop timed out: {}", msg),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Create a waiting task. `max_tries` of 0 takes the configured default.
    pub fn submit(&self, mut task: NewTask) -> Result<WaitingTask> {
        if task.command.trim().is_empty() {
            return Err(Error::InvalidInput("task command is empty".to_string()));
        }
        if task.max_tries == 0 {
            task.max_tries = self.config.default_max_tries;
        }

        let waiting = self.repository.submit(task)?;
        info!("Task {} submitted: {}", waiting.task_id(), waiting.info.command);
        Ok(waiting)
    }

    /// Hand a task to the backend (first attempt, retry or recovery)
    pub fn schedule(&self, task: TaskInfo) -> Result<()> {
        self.dispatcher.schedule(task)
    }

    pub async fn is_task_running(&self, task_id: TaskId) -> bool {
        self.backend.is_task_running(task_id).await
    }

    /// Terminate a task. On completion a running task is finished as FAILED
    /// and never retried.
    pub fn kill_task(&self, task_id: TaskId) -> Result<KillHandle> {
        if self.retry.suppress(task_id)? {
            info!("Cancelled pending retry of task {}", task_id);
        }

        let handler = Arc::clone(&self.handler);
        Ok(self.backend.kill_task(
            task_id,
            Box::new(move || async move { handler.on_killed(task_id).await }.boxed()),
        ))
    }

    /// Lines from the live source while the task runs, from the archive
    /// otherwise
    pub async fn get_log_lines(&self, task_id: TaskId, line_number: usize, rows: usize) -> Result<Vec<String>> {
        if self.is_task_running(task_id).await {
            self.backend.get_log_lines(task_id, line_number, rows).await
        } else {
            self.archive.get_log_lines(task_id, line_number, rows).await
        }
    }

    /// One poll of the waiting queue; returns the number dispatched
    pub async fn schedule_waiting_tasks(&self) -> Result<usize> {
        self.poller.poll(&self.timer.signal()).await
    }

    /// Re-dispatch every running record the backend is not executing
    pub async fn check_running_tasks(&self) -> Result<usize> {
        let mut recovered = 0;
        for task in self.repository.get_all_running_tasks()? {
            if self.backend.is_task_running(task.task_id()).await {
                continue;
            }
            info!(
                "Task {} is running in the repository but not in the backend, dispatching it",
                task.task_id()
            );
            self.dispatcher.schedule(task.info)?;
            recovered += 1;
        }
        Ok(recovered)
    }

    pub fn find(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        self.repository.find(task_id)
    }

    pub fn counts(&self) -> Result<StageCounts> {
        self.repository.counts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{OnKilled, TaskCallback};
    use crate::repository::InMemoryTaskRepository;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Raises shutdown from inside the poll, on its third running check
    struct ShutdownOnThirdCheck {
        timer: Arc<TaskTimer>,
        checks: AtomicUsize,
        launched: Mutex<Vec<TaskId>>,
    }

    #[async_trait]
    impl ExecutionBackend for ShutdownOnThirdCheck {
        fn register_callback(&self, _callback: Arc<dyn TaskCallback>) {}
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn run_task(&self, task: TaskInfo) {
            self.launched.lock().unwrap().push(task.task_id);
        }
        async fn is_task_running(&self, _task_id: TaskId) -> bool {
            if self.checks.fetch_add(1, Ordering::SeqCst) == 2 {
                self.timer.shutdown(Duration::from_secs(1)).await.unwrap();
            }
            false
        }
        fn kill_task(&self, task_id: TaskId, on_killed: OnKilled) -> KillHandle {
            KillHandle::spawn(task_id, on_killed())
        }
        async fn get_log_lines(&self, _: TaskId, _: usize, _: usize) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn name(&self) -> &'static str {
            "shutdown-on-third-check"
        }
    }

    #[tokio::test]
    async fn test_poll_stops_between_tasks_on_shutdown() {
        let timer = Arc::new(TaskTimer::new());
        let backend = Arc::new(ShutdownOnThirdCheck {
            timer: Arc::clone(&timer),
            checks: AtomicUsize::new(0),
            launched: Mutex::new(Vec::new()),
        });
        let repository = Arc::new(InMemoryTaskRepository::new());
        let ids: Vec<TaskId> = (0..5)
            .map(|_| repository.submit(NewTask::new("shell", "true", 1)).unwrap().task_id())
            .collect();

        let poller = WaitingTaskPoller {
            repository: repository.clone(),
            backend: backend.clone(),
            dispatcher: Arc::new(Dispatcher::new(
                backend.clone(),
                repository.clone(),
                Arc::new(LocalhostSelector),
            )),
            page_size: 10,
            dedupe: true,
        };

        // the third task was checked before the signal went up, so it still goes out
        assert_eq!(poller.poll(&timer.signal()).await.unwrap(), 3);
        assert_eq!(*backend.launched.lock().unwrap(), ids[..3].to_vec());

        assert_eq!(repository.counts().unwrap().waiting, 5);
        for id in &ids[3..] {
            let waiting = repository.get_waiting_task(*id).unwrap().unwrap();
            assert!(!waiting.info.has_host());
        }
    }
}
