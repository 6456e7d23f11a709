//! Awaitable kill handle

use crate::task::TaskId;
use athena_foundation::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to an in-flight kill. Dropping it does not stop the kill.
#[derive(Debug)]
pub struct KillHandle {
    task_id: TaskId,
    handle: JoinHandle<Result<()>>,
}

impl KillHandle {
    /// Run `kill` in the background
    pub fn spawn<F>(task_id: TaskId, kill: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            task_id,
            handle: tokio::spawn(kill),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the kill if it has not completed yet
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the kill and its completion hook. On timeout the kill keeps
    /// running in the background.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<()> {
        let task_id = self.task_id;
        let joined = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.handle)
                .await
                .map_err(|_| Error::Timeout(format!("kill of task {} after {:?}", task_id, limit)))?,
            None => self.handle.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(Error::Internal(format!("kill of task {} panicked: {}", task_id, e))),
        }
    }
}
