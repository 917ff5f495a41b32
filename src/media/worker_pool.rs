//! §4.1 `WorkerPool` — owns the fleet of media-engine worker processes.

use std::sync::Arc;

use slog::{o, warn, Logger};
use tokio::sync::RwLock;

use super::engine::{EngineError, Worker};

/// Callback invoked synchronously when a worker dies, before the pool
/// replaces it. `RoomRegistry` hooks this to close every room touching the
/// dead worker (§4.1, §4.5).
pub type OnWorkerDied = Box<dyn Fn(&str) + Send + Sync>;

struct Entry {
    worker: Box<dyn Worker>,
}

/// Instance-singleton pool of `N ≈ CPU-count` media workers.
pub struct WorkerPool {
    log: Logger,
    workers: RwLock<Vec<Entry>>,
    on_died: RwLock<Vec<OnWorkerDied>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(log: Logger, workers: Vec<Box<dyn Worker>>) -> Arc<Self> {
        Arc::new(Self {
            log: log.new(o!("component" => "worker_pool")),
            workers: RwLock::new(
                workers.into_iter().map(|worker| Entry { worker }).collect(),
            ),
            on_died: RwLock::new(Vec::new()),
        })
    }

    /// Registers a callback run (synchronously, in registration order) when
    /// a worker is observed to have died.
    pub async fn on_worker_died(&self, callback: OnWorkerDied) {
        self.on_died.write().await.push(callback);
    }

    /// Returns the worker with the fewest active routers, ties broken by
    /// lowest PID.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoWorkersAvailable`] if the pool is empty.
    pub async fn least_loaded(&self) -> Result<WorkerHandle, EngineError> {
        self.least_loaded_excluding(None).await
    }

    /// Returns the worker with the fewest active routers among those other
    /// than `exclude`, ties broken by lowest PID. Falls back to `exclude`
    /// itself if it's the only worker in the pool, since a single-worker
    /// deployment has nowhere else to put a distribution router.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoWorkersAvailable`] if the pool is empty.
    pub async fn least_loaded_excluding(
        &self,
        exclude: Option<&str>,
    ) -> Result<WorkerHandle, EngineError> {
        let workers = self.workers.read().await;
        workers
            .iter()
            .filter(|e| match exclude {
                Some(id) => e.worker.id().to_string() != id,
                None => true,
            })
            .min_by_key(|e| (e.worker.router_count(), e.worker.pid()))
            .or_else(|| {
                workers
                    .iter()
                    .min_by_key(|e| (e.worker.router_count(), e.worker.pid()))
            })
            .map(|e| WorkerHandle {
                id: e.worker.id().to_string(),
            })
            .ok_or(EngineError::NoWorkersAvailable)
    }

    /// Looks a worker up by id and hands back a router-creation capability.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoWorkersAvailable`] if the worker is no longer in
    /// the pool (it died and was already replaced).
    pub async fn create_router_on(
        &self,
        worker_id: &str,
    ) -> Result<Box<dyn super::engine::Router>, EngineError> {
        let workers = self.workers.read().await;
        let entry = workers
            .iter()
            .find(|e| e.worker.id().to_string() == worker_id)
            .ok_or(EngineError::NoWorkersAvailable)?;
        entry.worker.create_router().await
    }

    /// Called by the supervisor when a worker process exits unexpectedly.
    /// Runs every `on_worker_died` callback, then replaces the dead worker
    /// in-place with `spawn_replacement`.
    pub async fn handle_worker_death(
        &self,
        worker_id: &str,
        spawn_replacement: impl FnOnce() -> Box<dyn Worker>,
    ) {
        warn!(self.log, "media worker died"; "worker_id" => worker_id);

        for cb in self.on_died.read().await.iter() {
            cb(worker_id);
        }

        let mut workers = self.workers.write().await;
        workers.retain(|e| e.worker.id().to_string() != worker_id);
        workers.push(Entry {
            worker: spawn_replacement(),
        });
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }
}

/// A stable, cheaply-cloneable reference to a pool-owned worker.
///
/// Deliberately doesn't borrow from [`WorkerPool`] — workers can be
/// replaced out from under a long-lived `MediaCluster`, so callers always
/// go back through [`WorkerPool::create_router_on`] by id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerHandle {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::engine::mock::MockEngine;

    fn test_logger() -> Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    #[tokio::test]
    async fn least_loaded_breaks_ties_by_pid() {
        let engine = MockEngine::new();
        let pool = WorkerPool::new(
            test_logger(),
            vec![engine.spawn_worker(200), engine.spawn_worker(100)],
        );
        let handle = pool.least_loaded().await.unwrap();
        // Both workers start with 0 routers; pid 100 must win the tie.
        let workers = pool.workers.read().await;
        let chosen = workers
            .iter()
            .find(|e| e.worker.id().to_string() == handle.id)
            .unwrap();
        assert_eq!(chosen.worker.pid(), 100);
    }

    #[tokio::test]
    async fn least_loaded_excluding_skips_the_given_worker() {
        let engine = MockEngine::new();
        let pool = WorkerPool::new(
            test_logger(),
            vec![engine.spawn_worker(100), engine.spawn_worker(200)],
        );
        let workers = pool.workers.read().await;
        let excluded_id = workers[0].worker.id().to_string();
        drop(workers);

        let handle = pool
            .least_loaded_excluding(Some(&excluded_id))
            .await
            .unwrap();
        assert_ne!(handle.id, excluded_id);
    }

    #[tokio::test]
    async fn least_loaded_excluding_falls_back_to_sole_worker() {
        let engine = MockEngine::new();
        let pool = WorkerPool::new(test_logger(), vec![engine.spawn_worker(1)]);
        let workers = pool.workers.read().await;
        let only_id = workers[0].worker.id().to_string();
        drop(workers);

        let handle = pool
            .least_loaded_excluding(Some(&only_id))
            .await
            .unwrap();
        assert_eq!(handle.id, only_id);
    }

    #[tokio::test]
    async fn errors_when_pool_empty() {
        let pool = WorkerPool::new(test_logger(), vec![]);
        assert!(matches!(
            pool.least_loaded().await,
            Err(EngineError::NoWorkersAvailable)
        ));
    }

    #[tokio::test]
    async fn worker_death_runs_callbacks_then_replaces() {
        let engine = MockEngine::new();
        let pool = WorkerPool::new(test_logger(), vec![engine.spawn_worker(1)]);
        let died_id = std::sync::Arc::new(std::sync::Mutex::new(None));
        let died_id_clone = std::sync::Arc::clone(&died_id);
        pool.on_worker_died(Box::new(move |id| {
            *died_id_clone.lock().unwrap() = Some(id.to_string());
        }))
        .await;

        let handle = pool.least_loaded().await.unwrap();
        let engine_clone = std::sync::Arc::clone(&engine);
        pool.handle_worker_death(&handle.id, || engine_clone.spawn_worker(2))
            .await;

        assert_eq!(died_id.lock().unwrap().as_deref(), Some(handle.id.as_str()));
        assert_eq!(pool.worker_count().await, 1);
    }
}
