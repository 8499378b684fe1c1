//! Registry of workers keyed by target address.
//!
//! The registry is the only place workers are created or stopped. Create and
//! delete hold the write lock across check-then-act, so at most one worker
//! exists per target and no worker is ever stopped twice through it.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::models::WorkerSnapshot;
use crate::notify::NotificationSink;
use crate::prober::ProberFactory;
use crate::worker::{FailureSender, Worker, WorkerSettings};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("worker for {0} already exists")]
    AlreadyExists(String),
    #[error("worker for {0} does not exist")]
    NotFound(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

pub struct Registry {
    workers: RwLock<HashMap<String, Arc<Worker>>>,
    settings: WorkerSettings,
    factory: Arc<dyn ProberFactory>,
    failures: FailureSender,
    completion: TaskTracker,
}

impl Registry {
    pub fn new(settings: WorkerSettings, factory: Arc<dyn ProberFactory>, failures: FailureSender) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            settings,
            factory,
            failures,
            completion: TaskTracker::new(),
        }
    }

    pub async fn create(
        &self,
        target: &str,
        on_status_change: Arc<dyn NotificationSink>,
    ) -> RegistryResult<Arc<Worker>> {
        let mut workers = self.workers.write().await;
        if workers.contains_key(target) {
            return Err(RegistryError::AlreadyExists(target.to_string()));
        }
        let worker = Arc::new(Worker::spawn(
            target,
            self.settings,
            self.factory.as_ref(),
            on_status_change,
            self.failures.clone(),
            self.completion.token(),
        ));
        workers.insert(target.to_string(), Arc::clone(&worker));
        debug!(size = workers.len(), "Worker added");
        Ok(worker)
    }

    pub async fn get(&self, target: &str) -> RegistryResult<Arc<Worker>> {
        self.workers
            .read()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(target.to_string()))
    }

    pub async fn has(&self, target: &str) -> bool {
        self.workers.read().await.contains_key(target)
    }

    /// Stops the worker and removes it. The write lock is held for the whole
    /// stop so a concurrent create for the same target waits for it.
    pub async fn delete(&self, target: &str) -> RegistryResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get(target)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(target.to_string()))?;
        worker.stop().await;
        workers.remove(target);
        debug!(size = workers.len(), "Worker deleted");
        Ok(())
    }

    /// Stops every registered worker concurrently. Workers stay in the map.
    pub async fn stop_all(&self) {
        let workers: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();
        info!(count = workers.len(), "Stopping all workers");
        let mut stops: FuturesUnordered<_> = workers
            .iter()
            .map(|worker| async move { worker.stop().await })
            .collect();
        while stops.next().await.is_some() {}
    }

    /// Resolves once every worker ever created has finished stopping.
    pub async fn wait(&self) {
        self.completion.close();
        self.completion.wait().await;
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    /// Snapshots of all workers, ordered by target.
    pub async fn list(&self) -> Vec<WorkerSnapshot> {
        let workers: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(workers.len());
        for worker in workers {
            snapshots.push(worker.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }
}
