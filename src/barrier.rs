//! Fleet-wide sync barrier.
//!
//! The farm releases this once all ants converge on one consensus group;
//! every job blocks on it before acting. The barrier is an explicit object
//! handed down from the farm through each ant to its job runner, so
//! ownership is visible and tests can release it directly.

use tokio::sync::watch;

#[derive(Clone)]
pub struct SyncBarrier {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl SyncBarrier {
    /// A barrier that starts closed.
    pub fn new() -> SyncBarrier {
        let (tx, _) = watch::channel(false);
        SyncBarrier {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// A barrier that is already open, for farms configured without a
    /// convergence wait.
    pub fn released() -> SyncBarrier {
        let barrier = SyncBarrier::new();
        barrier.release();
        barrier
    }

    pub fn release(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_released(&self) -> bool {
        *self.tx.subscribe().borrow()
    }

    /// Resolves once the barrier is released; immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|released| *released).await;
    }
}

impl Default for SyncBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_resolves_after_release() {
        let barrier = SyncBarrier::new();
        assert!(!barrier.is_released());

        let waiter = barrier.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        barrier.release();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pre_released_barrier() {
        let barrier = SyncBarrier::released();
        tokio::time::timeout(Duration::from_secs(1), barrier.wait())
            .await
            .unwrap();
    }
}
