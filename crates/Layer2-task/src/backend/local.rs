//! Local backend - runs task commands on the host with log streaming
//!
//! Each launched process gets a monitor task that streams stdout/stderr
//! into the shared `TaskLogManager` and waits for either process exit or a
//! kill request, then reports the outcome through the registered callback.

use super::{ExecutionBackend, KillHandle, OnKilled, TaskCallback};
use crate::log::TaskLogManager;
use crate::task::{TaskId, TaskInfo};
use async_trait::async_trait;
use athena_foundation::{Error, Result};
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upper bound for flushing output after the process exits
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Live process owned by a monitor task
struct ProcessEntry {
    /// Distinguishes attempts of the same task
    run_id: u64,

    pid: u32,

    /// Ask the monitor to kill; it acks once the process is gone
    kill_tx: oneshot::Sender<oneshot::Sender<()>>,
}

/// How a monitored process ended
enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Killed(oneshot::Sender<()>),
}

struct Inner {
    processes: Mutex<HashMap<TaskId, ProcessEntry>>,
    log_manager: Arc<TaskLogManager>,
    callback: RwLock<Option<Arc<dyn TaskCallback>>>,
    accepting: AtomicBool,
    next_run_id: AtomicU64,
}

impl Inner {
    fn callback(&self) -> Option<Arc<dyn TaskCallback>> {
        self.callback.read().ok().and_then(|c| c.clone())
    }

    /// Drop the process entry if it still belongs to this run
    async fn release(&self, task_id: TaskId, run_id: u64) {
        let mut processes = self.processes.lock().await;
        if processes.get(&task_id).is_some_and(|p| p.run_id == run_id) {
            processes.remove(&task_id);
        }
    }
}

/// Backend that runs tasks directly on this host
#[derive(Clone)]
pub struct LocalBackend {
    inner: Arc<Inner>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::with_log_manager(Arc::new(TaskLogManager::new()))
    }

    /// Share a log manager with the log archive
    pub fn with_log_manager(log_manager: Arc<TaskLogManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                processes: Mutex::new(HashMap::with_capacity(16)),
                log_manager,
                callback: RwLock::new(None),
                accepting: AtomicBool::new(false),
                next_run_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn log_manager(&self) -> Arc<TaskLogManager> {
        Arc::clone(&self.inner.log_manager)
    }

    /// Tasks with a live process
    pub async fn running_processes(&self) -> Vec<TaskId> {
        self.inner.processes.lock().await.keys().copied().collect()
    }

    fn shell_command(command: &str) -> Command {
        let (shell, shell_arg) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };

        let mut cmd = Command::new(shell);
        cmd.arg(shell_arg)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn launch(inner: Arc<Inner>, task: TaskInfo) {
        let task_id = task.task_id;
        let Some(callback) = inner.callback() else {
            warn!("No callback registered, dropping launch of task {}", task_id);
            return;
        };

        inner.log_manager.open_buffer(task_id, &task.command).await;
        debug!("Executing task {}: {}", task_id, task.command);

        let mut child = match Self::shell_command(&task.command).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn task {}: {}", task_id, e);
                inner
                    .log_manager
                    .mark_ended(task_id, format!("Failed to spawn process: {}", e))
                    .await;
                if let Err(e) = callback.on_failure(task_id).await {
                    error!("Failure callback for task {} failed: {}", task_id, e);
                }
                return;
            }
        };

        let pid = child.id().unwrap_or_default();
        let run_id = inner.next_run_id.fetch_add(1, Ordering::Relaxed);
        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut processes = inner.processes.lock().await;
            if let Some(previous) = processes.insert(task_id, ProcessEntry { run_id, pid, kill_tx }) {
                warn!(
                    "Task {} dispatched again while pid {} is still live",
                    task_id, previous.pid
                );
            }
        }

        let readers = Self::spawn_readers(&inner.log_manager, task_id, &mut child);
        info!("Started task {} (pid {})", task_id, pid);

        match callback.on_started(task_id, pid).await {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                Self::stop_stray(&inner, task_id, run_id, child, readers).await;
                return;
            }
            Err(e) => error!("Start callback for task {} failed: {}", task_id, e),
        }

        Self::monitor(inner, callback, task_id, run_id, child, kill_rx, readers).await;
    }

    /// The task finished before this process came up (killed while its
    /// retry was launching). Kill it without reporting an outcome.
    async fn stop_stray(
        inner: &Inner,
        task_id: TaskId,
        run_id: u64,
        mut child: Child,
        readers: Vec<JoinHandle<()>>,
    ) {
        warn!("Task {} is already finished, killing its new process", task_id);
        if let Err(e) = child.kill().await {
            warn!("Failed to kill task {}: {}", task_id, e);
        }
        for reader in &readers {
            reader.abort();
        }
        inner.release(task_id, run_id).await;
        inner
            .log_manager
            .mark_ended(task_id, "Process stopped: task already finished")
            .await;
    }

    fn spawn_readers(
        log_manager: &Arc<TaskLogManager>,
        task_id: TaskId,
        child: &mut Child,
    ) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(Self::spawn_reader(Arc::clone(log_manager), task_id, stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(Self::spawn_reader(Arc::clone(log_manager), task_id, stderr, true));
        }
        readers
    }

    fn spawn_reader<R>(
        log_manager: Arc<TaskLogManager>,
        task_id: TaskId,
        stream: R,
        is_stderr: bool,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if is_stderr {
                    log_manager.push_stderr(task_id, line).await;
                } else {
                    log_manager.push_stdout(task_id, line).await;
                }
            }
        })
    }

    async fn monitor(
        inner: Arc<Inner>,
        callback: Arc<dyn TaskCallback>,
        task_id: TaskId,
        run_id: u64,
        mut child: Child,
        mut kill_rx: oneshot::Receiver<oneshot::Sender<()>>,
        readers: Vec<JoinHandle<()>>,
    ) {
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            Ok(ack) = &mut kill_rx => Outcome::Killed(ack),
        };

        match outcome {
            Outcome::Killed(ack) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill task {}: {}", task_id, e);
                }
                for reader in &readers {
                    reader.abort();
                }
                inner.log_manager.mark_ended(task_id, "Process killed").await;
                info!("Killed task {}", task_id);
                let _ = ack.send(());
            }
            Outcome::Exited(status) => {
                Self::drain(readers).await;
                inner.release(task_id, run_id).await;

                let result = match status {
                    Ok(status) if status.success() => {
                        inner.log_manager.mark_ended(task_id, "Process exited with code 0").await;
                        callback.on_success(task_id).await
                    }
                    Ok(status) => {
                        let message = match status.code() {
                            Some(code) => format!("Process exited with code {}", code),
                            None => "Process terminated by signal".to_string(),
                        };
                        debug!("Task {}: {}", task_id, message);
                        inner.log_manager.mark_ended(task_id, message).await;
                        callback.on_failure(task_id).await
                    }
                    Err(e) => {
                        warn!("Lost track of task {}: {}", task_id, e);
                        inner
                            .log_manager
                            .mark_ended(task_id, format!("Lost process: {}", e))
                            .await;
                        callback.on_lost(task_id).await
                    }
                };

                if let Err(e) = result {
                    error!("Completion callback for task {} failed: {}", task_id, e);
                }
            }
        }
    }

    /// Let the readers flush the remaining output. Background children may
    /// hold the pipes open, so the wait is bounded.
    async fn drain(readers: Vec<JoinHandle<()>>) {
        let aborts: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();
        if tokio::time::timeout(READER_DRAIN, futures::future::join_all(readers))
            .await
            .is_err()
        {
            aborts.iter().for_each(|a| a.abort());
        }
    }

    /// Ask the monitor of `task_id` to kill its process and wait until it has
    async fn terminate(inner: &Inner, task_id: TaskId) -> bool {
        let entry = inner.processes.lock().await.remove(&task_id);
        let Some(entry) = entry else {
            return false;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if entry.kill_tx.send(ack_tx).is_err() {
            // monitor already finished
            return false;
        }
        ack_rx.await.is_ok()
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn register_callback(&self, callback: Arc<dyn TaskCallback>) {
        match self.inner.callback.write() {
            Ok(mut slot) => *slot = Some(callback),
            Err(_) => error!("Callback slot poisoned, registration ignored"),
        }
    }

    async fn start(&self) -> Result<()> {
        self.inner.accepting.store(true, Ordering::SeqCst);
        info!("Local backend started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.accepting.store(false, Ordering::SeqCst);

        let live = self.running_processes().await;
        for task_id in &live {
            Self::terminate(&self.inner, *task_id).await;
        }

        // break the scheduler <-> backend reference cycle
        match self.inner.callback.write() {
            Ok(mut slot) => *slot = None,
            Err(_) => return Err(Error::Internal("Lock poisoned".to_string())),
        }

        info!("Local backend stopped ({} processes terminated)", live.len());
        Ok(())
    }

    fn run_task(&self, task: TaskInfo) {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            warn!("Local backend not started, dropping task {}", task.task_id);
            return;
        }
        tokio::spawn(Self::launch(Arc::clone(&self.inner), task));
    }

    async fn is_task_running(&self, task_id: TaskId) -> bool {
        self.inner.processes.lock().await.contains_key(&task_id)
    }

    fn kill_task(&self, task_id: TaskId, on_killed: OnKilled) -> KillHandle {
        let inner = Arc::clone(&self.inner);
        KillHandle::spawn(task_id, async move {
            if !Self::terminate(&inner, task_id).await {
                debug!("No live process for task {}", task_id);
            }
            on_killed().await
        })
    }

    async fn get_log_lines(&self, task_id: TaskId, line_number: usize, rows: usize) -> Result<Vec<String>> {
        Ok(self.inner.log_manager.lines(task_id, line_number, rows).await)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::task::NewTask;
    use chrono::Utc;
    use futures::FutureExt;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Started(TaskId),
        Success(TaskId),
        Failure(TaskId),
        Lost(TaskId),
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl TaskCallback for Recorder {
        async fn on_started(&self, task_id: TaskId, _pid: u32) -> Result<()> {
            let _ = self.0.send(Event::Started(task_id));
            Ok(())
        }
        async fn on_success(&self, task_id: TaskId) -> Result<()> {
            let _ = self.0.send(Event::Success(task_id));
            Ok(())
        }
        async fn on_failure(&self, task_id: TaskId) -> Result<()> {
            let _ = self.0.send(Event::Failure(task_id));
            Ok(())
        }
        async fn on_lost(&self, task_id: TaskId) -> Result<()> {
            let _ = self.0.send(Event::Lost(task_id));
            Ok(())
        }
    }

    async fn backend() -> (LocalBackend, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = LocalBackend::new();
        backend.register_callback(Arc::new(Recorder(tx)));
        backend.start().await.unwrap();
        (backend, rx)
    }

    fn task(id: i64, command: &str) -> TaskInfo {
        NewTask::new("shell", command, 1)
            .into_waiting(TaskId(id), Utc::now())
            .info
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("callback channel closed")
    }

    /// No callback arrives within a short window
    async fn quiet(rx: &mut mpsc::UnboundedReceiver<Event>) -> bool {
        !matches!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await,
            Ok(Some(_))
        )
    }

    #[tokio::test]
    async fn test_success_reports_and_logs() {
        let (backend, mut rx) = backend().await;
        backend.run_task(task(1, "echo hello; echo oops 1>&2"));

        assert_eq!(next(&mut rx).await, Event::Started(TaskId(1)));
        assert_eq!(next(&mut rx).await, Event::Success(TaskId(1)));
        assert!(!backend.is_task_running(TaskId(1)).await);

        let lines = backend.get_log_lines(TaskId(1), 0, 100).await.unwrap();
        assert!(lines.contains(&"hello".to_string()));
        assert!(lines.contains(&"[stderr] oops".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("[system] Process exited with code 0"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let (backend, mut rx) = backend().await;
        backend.run_task(task(2, "exit 3"));

        assert_eq!(next(&mut rx).await, Event::Started(TaskId(2)));
        assert_eq!(next(&mut rx).await, Event::Failure(TaskId(2)));
    }

    #[tokio::test]
    async fn test_kill_runs_hook_without_failure() {
        let (backend, mut rx) = backend().await;
        backend.run_task(task(3, "sleep 30"));
        assert_eq!(next(&mut rx).await, Event::Started(TaskId(3)));
        assert!(backend.is_task_running(TaskId(3)).await);

        let (done_tx, done_rx) = oneshot::channel();
        let handle = backend.kill_task(
            TaskId(3),
            Box::new(move || {
                async move {
                    let _ = done_tx.send(());
                    Ok(())
                }
                .boxed()
            }),
        );
        handle.wait(Some(Duration::from_secs(10))).await.unwrap();
        assert!(done_rx.await.is_ok());
        assert!(!backend.is_task_running(TaskId(3)).await);

        // no failure callback for a killed process
        assert!(quiet(&mut rx).await);
    }

    #[tokio::test]
    async fn test_not_started_drops_work() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = LocalBackend::new();
        backend.register_callback(Arc::new(Recorder(tx)));
        backend.run_task(task(4, "true"));

        assert!(quiet(&mut rx).await);
        assert_eq!(backend.name(), "local");
    }

    #[tokio::test]
    async fn test_stop_terminates_silently() {
        let (backend, mut rx) = backend().await;
        backend.run_task(task(5, "sleep 30"));
        assert_eq!(next(&mut rx).await, Event::Started(TaskId(5)));

        backend.stop().await.unwrap();
        assert!(backend.running_processes().await.is_empty());
        assert!(quiet(&mut rx).await);
    }

    /// Refuses every start, like a handler whose task was killed meanwhile
    struct Refusing(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl TaskCallback for Refusing {
        async fn on_started(&self, task_id: TaskId, _pid: u32) -> Result<()> {
            let _ = self.0.send(Event::Started(task_id));
            Err(Error::Cancelled)
        }
        async fn on_success(&self, task_id: TaskId) -> Result<()> {
            let _ = self.0.send(Event::Success(task_id));
            Ok(())
        }
        async fn on_failure(&self, task_id: TaskId) -> Result<()> {
            let _ = self.0.send(Event::Failure(task_id));
            Ok(())
        }
        async fn on_lost(&self, task_id: TaskId) -> Result<()> {
            let _ = self.0.send(Event::Lost(task_id));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_refused_start_kills_process() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = LocalBackend::new();
        backend.register_callback(Arc::new(Refusing(tx)));
        backend.start().await.unwrap();

        backend.run_task(task(6, "sleep 30"));
        assert_eq!(next(&mut rx).await, Event::Started(TaskId(6)));

        // killed right away, and no outcome is reported
        assert!(quiet(&mut rx).await);
        assert!(!backend.is_task_running(TaskId(6)).await);
        let lines = backend.get_log_lines(TaskId(6), 0, 10).await.unwrap();
        assert_eq!(
            lines.last().map(String::as_str),
            Some("[system] Process stopped: task already finished")
        );
    }
}
