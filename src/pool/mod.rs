//! Capacity-managed collection of workers.
//!
//! The pool grows lazily up to its cap, prefers idle workers in FIFO order,
//! and parks submitters when every worker is saturated. Dead workers are
//! never revived; they are removed when detected (a failed submission, or a
//! non-running worker observed at checkout or lease return) and their
//! capacity becomes available again.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::context::{Context, ThreadContext};
use crate::error::{Error, Result};
use crate::runtime::TaskRegistry;
use crate::types::{Task, TaskEnvelope};
use crate::worker::{TaskHandle, Worker};

/// Sizing policy for a [`Pool`].
///
/// # Examples
///
/// ```
/// use offload::pool::PoolConfig;
///
/// let config = PoolConfig::default()
///     .with_max_workers(4)
///     .with_per_worker_concurrency(2);
/// assert_eq!(config.max_workers(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    max_workers: usize,
    per_worker_concurrency: usize,
}

impl PoolConfig {
    /// Maximum number of live workers.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// How many tasks one worker may hold before the pool stops routing to
    /// it. The default of 1 serialises tasks per worker.
    pub fn per_worker_concurrency(&self) -> usize {
        self.per_worker_concurrency
    }

    /// Sets the worker cap (at least 1).
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    /// Sets the per-worker task cap (at least 1).
    pub fn with_per_worker_concurrency(mut self, limit: usize) -> Self {
        self.per_worker_concurrency = limit.max(1);
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(8),
            per_worker_concurrency: 1,
        }
    }
}

struct PoolState {
    workers: Vec<Arc<Worker>>,
    idle: VecDeque<Arc<Worker>>,
    leased: HashSet<Uuid>,
    waiters: VecDeque<oneshot::Sender<Arc<Worker>>>,
    shutdown: bool,
}

struct PoolInner {
    config: PoolConfig,
    factory: Box<dyn Fn() -> Arc<dyn Context> + Send + Sync>,
    state: Mutex<PoolState>,
}

/// A bounded set of workers with a least-loaded dispatch policy.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use offload::pool::{Pool, PoolConfig};
/// use offload::runtime::TaskRegistry;
/// # use async_trait::async_trait;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Serialize, Deserialize)]
/// # struct Add { a: i64, b: i64 }
/// # #[async_trait]
/// # impl offload::Task for Add {
/// #     const KIND: &'static str = "add";
/// #     type Output = i64;
/// #     async fn run(self, _env: &offload::runtime::Environment) -> Result<i64, offload::TaskFailure> {
/// #         Ok(self.a + self.b)
/// #     }
/// # }
///
/// # async fn example() -> offload::Result<()> {
/// let registry = Arc::new(TaskRegistry::new().register::<Add>());
/// let pool = Pool::thread_pool(PoolConfig::default().with_max_workers(2), registry);
///
/// let handle = pool.enqueue(Add { a: 40, b: 2 }).await?;
/// assert_eq!(handle.join().await?, 42);
/// pool.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Clone for Pool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Pool {
    /// Builds an empty pool. `factory` produces a fresh, unstarted context
    /// each time the pool grows.
    pub fn new<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Context> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory: Box::new(factory),
                state: Mutex::new(PoolState {
                    workers: Vec::new(),
                    idle: VecDeque::new(),
                    leased: HashSet::new(),
                    waiters: VecDeque::new(),
                    shutdown: false,
                }),
            }),
        }
    }

    /// A pool of thread-backed workers all running the standard job loop
    /// over `registry`.
    pub fn thread_pool(config: PoolConfig, registry: Arc<TaskRegistry>) -> Self {
        Self::new(config, move || {
            Arc::new(ThreadContext::worker(Arc::clone(&registry))) as Arc<dyn Context>
        })
    }

    /// Number of live workers, busy or idle.
    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().workers.len()
    }

    /// Number of workers in the idle queue.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Submits a task to the least-loaded available worker, growing the pool
    /// on demand and parking when saturated.
    ///
    /// A payload that cannot be encoded fails only this call. A worker that
    /// dies during submission is removed and the submission retried once on
    /// a replacement.
    pub async fn enqueue<T: Task>(&self, task: T) -> Result<TaskHandle<T::Output>> {
        let envelope = TaskEnvelope::new(&task)?;
        let mut attempts = 0;
        loop {
            let worker = self.checkout(false).await?;
            match worker.enqueue_envelope(envelope.clone()).await {
                Ok((rx, job_id)) => {
                    let (tx, out_rx) = oneshot::channel::<Result<Value>>();
                    let inner = Arc::clone(&self.inner);
                    let settled = Arc::clone(&worker);
                    tokio::spawn(async move {
                        let result = match rx.await {
                            Ok(result) => result,
                            Err(_) => Err(Error::Worker(
                                "worker dropped the task before completion".to_string(),
                            )),
                        };
                        release(&inner, settled);
                        let _ = tx.send(result);
                    });
                    return Ok(TaskHandle::new(out_rx, job_id));
                },
                Err(e) if e.is_task_scoped() => {
                    release(&self.inner, worker);
                    return Err(e);
                },
                Err(e) => {
                    tracing::warn!(worker = %worker.id(), error = %e, "removing failed worker");
                    remove_worker(&self.inner, &worker);
                    attempts += 1;
                    if attempts >= 2 {
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Hands out an exclusive, scoped lease on one worker. While the lease
    /// lives, the pool routes no other tasks to that worker; dropping the
    /// lease returns it (or discards it when no longer running).
    pub async fn get_worker(&self) -> Result<WorkerLease> {
        let worker = self.checkout(true).await?;
        Ok(WorkerLease {
            worker: Some(worker),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Refuses new work, waits for every outstanding task to settle, and
    /// shuts every worker down concurrently.
    pub async fn shutdown(&self) -> Result<()> {
        let workers = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(Error::Status("pool is already shut down".to_string()));
            }
            state.shutdown = true;
            state.waiters.clear();
            state.idle.clear();
            state.workers.clone()
        };

        tracing::debug!(workers = workers.len(), "shutting pool down");
        let results = join_all(workers.iter().map(|worker| worker.shutdown())).await;
        self.inner.state.lock().workers.clear();

        for result in results {
            match result {
                Ok(_) | Err(Error::Status(_)) => {},
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Kills every worker immediately. Pending tasks fail on their handles.
    pub async fn kill(&self) -> Result<()> {
        let workers = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.waiters.clear();
            state.idle.clear();
            std::mem::take(&mut state.workers)
        };
        join_all(workers.iter().map(|worker| worker.kill())).await;
        Ok(())
    }

    /// Selects a worker: idle FIFO first, then growth, then the least
    /// loaded under the concurrency cap, otherwise park until one frees up.
    /// With `for_lease`, the worker is marked leased before the pool lock is
    /// released so no concurrent selection can route tasks to it.
    async fn checkout(&self, for_lease: bool) -> Result<Arc<Worker>> {
        loop {
            let waiter = {
                let mut state = self.inner.state.lock();
                if state.shutdown {
                    return Err(Error::Status("pool is shut down".to_string()));
                }

                while let Some(worker) = state.idle.pop_front() {
                    if worker.is_running() {
                        if for_lease {
                            state.leased.insert(worker.id());
                        }
                        return Ok(worker);
                    }
                    tracing::debug!(worker = %worker.id(), "reaping dead idle worker");
                    remove_locked(&mut state, &worker);
                }

                if state.workers.len() < self.inner.config.max_workers {
                    let worker = Arc::new(Worker::from_context((self.inner.factory)()));
                    state.workers.push(Arc::clone(&worker));
                    if for_lease {
                        state.leased.insert(worker.id());
                    }
                    tracing::debug!(worker = %worker.id(), total = state.workers.len(), "growing pool");
                    return Ok(worker);
                }

                if self.inner.config.per_worker_concurrency > 1 && !for_lease {
                    let candidate = state
                        .workers
                        .iter()
                        .filter(|worker| {
                            worker.is_running()
                                && !state.leased.contains(&worker.id())
                                && worker.pending_count() < self.inner.config.per_worker_concurrency
                        })
                        .min_by_key(|worker| worker.pending_count())
                        .cloned();
                    if let Some(worker) = candidate {
                        return Ok(worker);
                    }
                }

                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            match waiter.await {
                Ok(worker) => {
                    if worker.is_running() {
                        if for_lease {
                            self.inner.state.lock().leased.insert(worker.id());
                        }
                        return Ok(worker);
                    }
                    remove_worker(&self.inner, &worker);
                },
                Err(_) => return Err(Error::Status("pool is shut down".to_string())),
            }
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("workers", &state.workers.len())
            .field("idle", &state.idle.len())
            .field("waiters", &state.waiters.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// An exclusive hold on one pooled worker, returned on drop.
pub struct WorkerLease {
    worker: Option<Arc<Worker>>,
    pool: Arc<PoolInner>,
}

impl std::ops::Deref for WorkerLease {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        self.worker.as_ref().expect("lease already released")
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            release(&self.pool, worker);
        }
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.worker.as_ref().map(|w| w.id()))
            .finish()
    }
}

fn remove_locked(state: &mut PoolState, worker: &Worker) {
    state.workers.retain(|candidate| candidate.id() != worker.id());
    state.idle.retain(|candidate| candidate.id() != worker.id());
    state.leased.remove(&worker.id());
}

fn remove_worker(inner: &PoolInner, worker: &Worker) {
    let mut state = inner.state.lock();
    remove_locked(&mut state, worker);
}

/// Returns a worker to circulation after a settlement or lease release:
/// waiter handoff first, idle queue second, removal when no longer running.
fn release(inner: &PoolInner, worker: Arc<Worker>) {
    let mut worker = Some(worker);
    loop {
        let handoff = {
            let mut state = inner.state.lock();
            let current = worker.take().expect("release loop lost its worker");
            state.leased.remove(&current.id());

            if !current.is_running() {
                remove_locked(&mut state, &current);
                tracing::debug!(worker = %current.id(), "discarding dead worker on release");
                // The slot this worker held is free again; grow for the
                // longest-parked waiter.
                if !state.shutdown
                    && !state.waiters.is_empty()
                    && state.workers.len() < inner.config.max_workers
                {
                    let fresh = Arc::new(Worker::from_context((inner.factory)()));
                    state.workers.push(Arc::clone(&fresh));
                    let tx = state.waiters.pop_front().expect("waiter queue emptied");
                    Some((tx, fresh))
                } else {
                    None
                }
            } else if let Some(tx) = state.waiters.pop_front() {
                Some((tx, current))
            } else {
                if current.is_idle()
                    && !state
                        .idle
                        .iter()
                        .any(|queued| queued.id() == current.id())
                {
                    state.idle.push_back(current);
                }
                None
            }
        };

        match handoff {
            Some((tx, handed)) => {
                // A waiter that gave up leaves its receiver closed; keep the
                // worker circulating.
                if let Err(handed) = tx.send(handed) {
                    worker = Some(handed);
                    continue;
                }
                return;
            },
            None => return,
        }
    }
}
