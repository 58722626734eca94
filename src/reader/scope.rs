//! Task groups tied to the lifetime of the entity that owns them.
//!
//! A [`TaskScope`] spawns tokio tasks that stop at their next await point
//! once the scope, or any scope it was derived from, is cancelled. Dropping
//! every handle to a parent counts as cancelling it.

use futures::future::{self, FutureExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct TaskScope {
    name: Arc<str>,
    cancel: Arc<watch::Sender<bool>>,
    parents: Vec<watch::Receiver<bool>>,
    active: Arc<watch::Sender<usize>>,
}

/// Decrements the active count when a task finishes or is dropped.
struct ActiveGuard(Arc<watch::Sender<usize>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl TaskScope {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            cancel: Arc::new(watch::Sender::new(false)),
            parents: Vec::new(),
            active: Arc::new(watch::Sender::new(0)),
        }
    }

    /// A scope that is cancelled along with `self`, but can also be cancelled alone.
    pub fn child(&self, name: impl Into<Arc<str>>) -> Self {
        let mut parents = self.parents.clone();
        parents.push(self.cancel.subscribe());
        Self {
            name: name.into(),
            cancel: Arc::new(watch::Sender::new(false)),
            parents,
            active: Arc::new(watch::Sender::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        if !self.cancel.send_replace(true) {
            log::debug!("Cancelled scope {}", self.name);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
            || self
                .parents
                .iter()
                .any(|parent| *parent.borrow() || parent.has_changed().is_err())
    }

    /// Resolves once this scope or an ancestor is cancelled.
    pub async fn cancelled(&self) {
        let mut receivers = self.parents.clone();
        receivers.push(self.cancel.subscribe());
        let waits = receivers.into_iter().map(|mut rx| {
            async move {
                // a dropped sender means the owner is gone
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }
            .boxed()
        });
        future::select_all(waits).await;
    }

    /// Number of tasks spawned on this scope that have not finished yet.
    pub fn in_flight(&self) -> usize {
        *self.active.borrow()
    }

    /// Waits until every task spawned so far has finished.
    pub async fn drain(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Runs `future` until it completes or the scope is cancelled, whichever
    /// comes first. Returns `None` when cancelled.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.active.send_modify(|n| *n += 1);
        let guard = ActiveGuard(Arc::clone(&self.active));
        let scope = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                biased;
                _ = scope.cancelled() => None,
                output = future => Some(output),
            }
        })
    }
}
