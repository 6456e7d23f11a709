//! Deferred work
//!
//! `TaskTimer` runs fixed-delay periodic jobs and one-shot delayed jobs
//! keyed by task. One-shot entries can be cancelled until they fire. A
//! shared `ShutdownSignal` lets running jobs stop between units of work.

use crate::task::TaskId;
use athena_foundation::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

/// Raised once when the timer shuts down
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn is_raised(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the signal is raised
    pub async fn raised(&mut self) {
        // a dropped sender also counts as shutdown
        let _ = self.0.wait_for(|raised| *raised).await;
    }
}

/// Pending one-shot job
struct Pending {
    entry_id: u64,
    abort: AbortHandle,
}

#[derive(Default)]
struct Jobs {
    pending: HashMap<TaskId, Pending>,
    handles: Vec<JoinHandle<()>>,
}

/// Shared deferred-task facility
pub struct TaskTimer {
    shutdown_tx: watch::Sender<bool>,
    jobs: Arc<Mutex<Jobs>>,
    next_entry: AtomicU64,
}

impl TaskTimer {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            jobs: Arc::new(Mutex::new(Jobs::default())),
            next_entry: AtomicU64::new(1),
        }
    }

    fn lock(jobs: &Mutex<Jobs>) -> Result<MutexGuard<'_, Jobs>> {
        jobs.lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.shutdown_tx.subscribe())
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn track(&self, handle: JoinHandle<()>) -> Result<()> {
        let mut jobs = Self::lock(&self.jobs)?;
        jobs.handles.retain(|h| !h.is_finished());
        jobs.handles.push(handle);
        Ok(())
    }

    /// Run `job` now and then again `delay` after each run completes, until
    /// shutdown.
    pub fn schedule_with_fixed_delay<F, Fut>(&self, name: &'static str, delay: Duration, mut job: F) -> Result<()>
    where
        F: FnMut(ShutdownSignal) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(Error::Cancelled);
        }

        let mut signal = self.signal();
        let handle = tokio::spawn(async move {
            debug!("Periodic job '{}' started ({:?} delay)", name, delay);
            loop {
                if signal.is_raised() {
                    break;
                }
                job(signal.clone()).await;

                tokio::select! {
                    _ = signal.raised() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!("Periodic job '{}' stopped", name);
        });
        self.track(handle)
    }

    /// Run `job` once after `delay`. An earlier pending job for the same
    /// task is replaced.
    pub fn schedule_once<Fut>(&self, task_id: TaskId, delay: Duration, job: Fut) -> Result<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(Error::Cancelled);
        }

        let entry_id = self.next_entry.fetch_add(1, Ordering::Relaxed);
        let jobs = Arc::clone(&self.jobs);
        let mut signal = self.signal();

        // hold the lock so the job cannot fire before it is registered
        let mut guard = Self::lock(&self.jobs)?;
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = signal.raised() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            // once fired the job can no longer be cancelled
            let still_pending = match jobs.lock() {
                Ok(mut jobs) => match jobs.pending.get(&task_id) {
                    Some(p) if p.entry_id == entry_id => {
                        jobs.pending.remove(&task_id);
                        true
                    }
                    _ => false,
                },
                Err(_) => false,
            };
            if still_pending {
                job.await;
            }
        });

        let abort = handle.abort_handle();
        if let Some(previous) = guard.pending.insert(task_id, Pending { entry_id, abort }) {
            debug!("Replacing pending job for task {}", task_id);
            previous.abort.abort();
        }
        guard.handles.retain(|h| !h.is_finished());
        guard.handles.push(handle);
        Ok(())
    }

    /// Cancel the pending job for `task_id`. Returns false if none was
    /// pending (never scheduled, or already fired).
    pub fn cancel(&self, task_id: TaskId) -> bool {
        match Self::lock(&self.jobs) {
            Ok(mut jobs) => match jobs.pending.remove(&task_id) {
                Some(pending) => {
                    pending.abort.abort();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn is_pending(&self, task_id: TaskId) -> bool {
        Self::lock(&self.jobs)
            .map(|jobs| jobs.pending.contains_key(&task_id))
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        Self::lock(&self.jobs)
            .map(|jobs| jobs.pending.len())
            .unwrap_or(0)
    }

    /// Raise the shutdown signal, drop pending one-shot jobs, and wait up to
    /// `grace` for jobs already running.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.shutdown_tx.send_replace(true);

        let handles = {
            let mut jobs = Self::lock(&self.jobs)?;
            for (_, pending) in jobs.pending.drain() {
                pending.abort.abort();
            }
            std::mem::take(&mut jobs.handles)
        };

        let aborts: Vec<AbortHandle> = handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Timer jobs still running after {:?}, aborting", grace);
                aborts.iter().for_each(|a| a.abort());
                Err(Error::Timeout(format!("timer shutdown after {:?}", grace)))
            }
        }
    }
}

impl Default for TaskTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_fixed_delay_runs_immediately_and_repeats() {
        let timer = TaskTimer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        timer
            .schedule_with_fixed_delay("count", Duration::from_millis(10), move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        timer.shutdown(Duration::from_secs(1)).await.unwrap();
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {} times", seen);

        // nothing runs after shutdown
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_one_shot_fires_once_after_delay() {
        let timer = TaskTimer::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let started = std::time::Instant::now();
        timer
            .schedule_once(TaskId(1), Duration::from_millis(30), async move {
                let _ = tx.send(());
            })
            .unwrap();
        assert!(timer.is_pending(TaskId(1)));

        rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!timer.is_pending(TaskId(1)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let timer = TaskTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&fired);
        timer
            .schedule_once(TaskId(2), Duration::from_millis(30), async move {
                flag.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(timer.cancel(TaskId(2)));
        assert!(!timer.cancel(TaskId(2)));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_pending() {
        let timer = TaskTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let flag = Arc::clone(&fired);
            timer
                .schedule_once(TaskId(3), Duration::from_millis(20), async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert_eq!(timer.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_job() {
        let timer = TaskTimer::new();
        timer
            .schedule_with_fixed_delay("stuck", Duration::from_secs(1), |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = timer.shutdown(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(timer
            .schedule_once(TaskId(4), Duration::from_millis(1), async {})
            .is_err());
    }

    #[tokio::test]
    async fn test_signal_observed_by_job() {
        let timer = TaskTimer::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        timer
            .schedule_with_fixed_delay("batch", Duration::from_secs(10), move |signal| {
                let tx = tx.clone();
                async move {
                    for i in 0..100 {
                        if signal.is_raised() {
                            break;
                        }
                        let _ = tx.send(i);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            })
            .unwrap();

        rx.recv().await.unwrap();
        timer.shutdown(Duration::from_secs(1)).await.unwrap();
        let mut seen = 1;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert!(seen < 100);
    }
}
