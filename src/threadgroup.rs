//! Task group with cooperative cancellation.
//!
//! Every background job registers itself before doing work and holds the
//! returned guard for its lifetime. `stop` flips the stop signal, wakes
//! every waiter, and blocks until all registered tasks have dropped their
//! guards, so shutdown never races an in-flight job.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;

/// Returned by `add` once shutdown has begun. Jobs treat it as an
/// instruction to return immediately without logging an error.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("thread group has been stopped")]
pub struct StoppedError;

struct Inner {
    /// Guards the stop flag so registration and stop serialize.
    stopped: Mutex<bool>,
    stop_tx: watch::Sender<bool>,
    running_tx: watch::Sender<usize>,
}

/// Cloneable handle to one group of cancellable tasks.
#[derive(Clone)]
pub struct ThreadGroup {
    inner: Arc<Inner>,
}

impl ThreadGroup {
    pub fn new() -> ThreadGroup {
        let (stop_tx, _) = watch::channel(false);
        let (running_tx, _) = watch::channel(0usize);
        ThreadGroup {
            inner: Arc::new(Inner {
                stopped: Mutex::new(false),
                stop_tx,
                running_tx,
            }),
        }
    }

    /// Register one in-flight task. Fails if shutdown has already begun.
    /// Dropping the guard deregisters the task.
    pub fn add(&self) -> Result<TaskGuard, StoppedError> {
        let stopped = self.inner.stopped.lock().unwrap();
        if *stopped {
            return Err(StoppedError);
        }
        self.inner.running_tx.send_modify(|n| *n += 1);
        drop(stopped);
        Ok(TaskGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.lock().unwrap()
    }

    /// Resolves once shutdown has been requested. May be awaited any
    /// number of times, including after `stop` has returned.
    pub async fn stopped(&self) {
        let mut rx = self.inner.stop_tx.subscribe();
        // wait_for checks the current value first, so a stop that has
        // already happened resolves immediately.
        let _ = rx.wait_for(|s| *s).await;
    }

    /// Request shutdown and wait for every registered task to finish.
    pub async fn stop(&self) {
        {
            let mut stopped = self.inner.stopped.lock().unwrap();
            *stopped = true;
        }
        self.inner.stop_tx.send_replace(true);

        let mut rx = self.inner.running_tx.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for ThreadGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII registration held by one running task.
pub struct TaskGuard {
    inner: Arc<Inner>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.inner.running_tx.send_modify(|n| *n -= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_add_after_stop_fails() {
        let tg = ThreadGroup::new();
        tg.stop().await;
        assert!(matches!(tg.add(), Err(StoppedError)));
    }

    #[tokio::test]
    async fn test_stop_waits_for_guards() {
        let tg = ThreadGroup::new();
        let guard = tg.add().unwrap();

        let tg2 = tg.clone();
        let handle = tokio::spawn(async move {
            tg2.stopped().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        tg.stop().await;
        assert!(tg.is_stopped());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_stop() {
        let tg = ThreadGroup::new();
        tg.stop().await;
        // Must not hang even though stop already completed.
        tokio::time::timeout(Duration::from_secs(1), tg.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_with_no_tasks_returns() {
        let tg = ThreadGroup::new();
        tokio::time::timeout(Duration::from_secs(1), tg.stop())
            .await
            .unwrap();
    }
}
