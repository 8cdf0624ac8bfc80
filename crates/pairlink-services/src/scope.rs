//! Cancellation scopes for subscription tasks.
//!
//! Every subscription to an external event source runs as a task spawned
//! in a scope. Cancelling the scope ends exactly those tasks, which drops
//! their event streams and with them the subscriptions.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Scope {
    cancelled: Arc<watch::Sender<bool>>,
}

impl Scope {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { cancelled: Arc::new(tx) }
    }

    /// Cancel the scope. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Run `task` until it finishes or the scope is cancelled, whichever
    /// comes first.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scope = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = task => {}
            }
        })
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn cancel_ends_only_its_own_tasks() {
        let negotiation = Scope::new();
        let lifetime = Scope::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let short = negotiation.spawn(std::future::pending());
        let ticks_in_task = ticks.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let long = lifetime.spawn(async move {
            while rx.recv().await.is_some() {
                ticks_in_task.fetch_add(1, Ordering::SeqCst);
            }
        });

        negotiation.cancel();
        short.await.unwrap();
        assert!(negotiation.is_cancelled());
        assert!(!lifetime.is_cancelled());

        tx.send(()).unwrap();
        tx.send(()).unwrap();
        tokio::task::yield_now().await;
        lifetime.cancel();
        long.await.unwrap();
        assert!(ticks.load(Ordering::SeqCst) <= 2);
        assert!(tx.send(()).is_err(), "cancelled task should drop its receiver");
    }

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let scope = Scope::new();
        scope.cancel();
        scope.cancel();
        scope.cancelled().await;
        assert!(scope.is_cancelled());
    }
}
