//! Parent-side worker: multiplexes outstanding tasks over one context.
//!
//! A [`Worker`] owns exactly one [`Context`] and a map of pending awaiters
//! keyed by job id. Exactly one receive is outstanding on the context while
//! any task is pending: the receive loop re-arms itself tail-style and
//! disarms the moment the map drains. Completions are delivered in the order
//! the executor emits them, which is not submission order.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, Notify, OnceCell};
use uuid::Uuid;

use crate::context::{Context, ContextState, ThreadContext};
use crate::error::{Error, Result};
use crate::runtime::TaskRegistry;
use crate::types::{Job, Message, Outcome, Task, TaskEnvelope};

type PendingSender = oneshot::Sender<Result<Value>>;
type PendingReceiver = oneshot::Receiver<Result<Value>>;

#[derive(Default)]
struct Pending {
    map: HashMap<String, PendingSender>,
    receiver_armed: bool,
    shutdown: bool,
}

struct WorkerInner {
    id: Uuid,
    context: Arc<dyn Context>,
    started: OnceCell<()>,
    pending: Mutex<Pending>,
    drained: Notify,
}

/// Awaitable result of one enqueued task.
///
/// Dropping the handle does not cancel the task; the worker still runs it
/// and discards the result.
#[derive(Debug)]
pub struct TaskHandle<O> {
    rx: PendingReceiver,
    job_id: String,
    _output: PhantomData<fn() -> O>,
}

impl<O: DeserializeOwned> TaskHandle<O> {
    pub(crate) fn new(rx: PendingReceiver, job_id: String) -> Self {
        Self {
            rx,
            job_id,
            _output: PhantomData,
        }
    }

    /// Id of the job this handle awaits. Every result delivered to this
    /// handle carries the same id.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Awaits the task's outcome and decodes it into the task's output type.
    pub async fn join(self) -> Result<O> {
        let value = self
            .rx
            .await
            .map_err(|_| Error::Worker("worker dropped the task before completion".to_string()))??;
        serde_json::from_value(value)
            .map_err(|e| Error::Serialization(format!("task output cannot be decoded: {e}")))
    }
}

/// A job multiplexer over one execution context.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use offload::runtime::TaskRegistry;
/// use offload::Worker;
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
/// let worker = Worker::thread(registry);
///
/// let handle = worker.enqueue(Add { a: 2, b: 2 }).await?;
/// assert_eq!(handle.join().await?, 4);
/// worker.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Builds a worker over a context. The context is started lazily, on the
    /// first enqueue.
    pub fn new<C: Context + 'static>(context: C) -> Self {
        Self::from_context(Arc::new(context))
    }

    /// Builds a worker over an already shared context.
    pub fn from_context(context: Arc<dyn Context>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id: Uuid::new_v4(),
                context,
                started: OnceCell::new(),
                pending: Mutex::new(Pending::default()),
                drained: Notify::new(),
            }),
        }
    }

    /// A worker backed by a thread executor running the standard job loop
    /// over `registry`.
    pub fn thread(registry: Arc<TaskRegistry>) -> Self {
        Self::new(ThreadContext::worker(registry))
    }

    /// Stable id for log correlation. Job ids are unique within this
    /// worker's lifetime; worker ids are unique within the process.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// True while the worker accepts tasks: not shut down, context not
    /// terminal.
    pub fn is_running(&self) -> bool {
        if self.inner.pending.lock().shutdown {
            return false;
        }
        !matches!(
            self.inner.context.state(),
            ContextState::Joined | ContextState::Killed
        )
    }

    /// True when no task is pending.
    pub fn is_idle(&self) -> bool {
        self.inner.pending.lock().map.is_empty()
    }

    /// Number of pending tasks.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().map.len()
    }

    /// Submits a task and returns a handle to its eventual result.
    ///
    /// A payload that cannot be encoded fails only this call; tasks already
    /// in flight are unaffected. Any transport failure is fatal for the
    /// worker: every pending awaiter is cancelled and the context killed.
    pub async fn enqueue<T: Task>(&self, task: T) -> Result<TaskHandle<T::Output>> {
        let envelope = TaskEnvelope::new(&task)?;
        let (rx, job_id) = self.enqueue_envelope(envelope).await?;
        Ok(TaskHandle::new(rx, job_id))
    }

    pub(crate) async fn enqueue_envelope(
        &self,
        envelope: TaskEnvelope,
    ) -> Result<(PendingReceiver, String)> {
        if self.inner.pending.lock().shutdown {
            return Err(Error::Status("worker is shut down".to_string()));
        }

        self.inner
            .started
            .get_or_try_init(|| self.inner.context.start())
            .await?;

        let job = Job::new(envelope.kind, envelope.payload);
        let job_id = job.id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.shutdown {
                return Err(Error::Status("worker is shut down".to_string()));
            }
            pending.map.insert(job_id.clone(), tx);
        }

        match self.inner.context.send(Message::Job(job)).await {
            Ok(()) => {},
            Err(Error::Serialization(msg)) => {
                let mut pending = self.inner.pending.lock();
                pending.map.remove(&job_id);
                drop(pending);
                self.inner.drained.notify_waiters();
                return Err(Error::Serialization(msg));
            },
            Err(e) => {
                tracing::warn!(worker = %self.inner.id, error = %e, "job submission failed, cancelling worker");
                cancel_all(&self.inner, || {
                    Error::Worker(format!("failed to submit job: {e}"))
                });
                let _ = self.inner.context.kill().await;
                return Err(e);
            },
        }

        let arm = {
            let mut pending = self.inner.pending.lock();
            if !pending.receiver_armed && !pending.map.is_empty() {
                pending.receiver_armed = true;
                true
            } else {
                false
            }
        };
        if arm {
            tokio::spawn(receive_loop(Arc::clone(&self.inner)));
        }

        Ok((rx, job_id))
    }

    /// Stops accepting tasks, waits for every pending awaiter to settle,
    /// then sends the stop sentinel and joins the context. Returns the exit
    /// code (0 on a clean join).
    pub async fn shutdown(&self) -> Result<i32> {
        {
            let mut pending = self.inner.pending.lock();
            if pending.shutdown {
                return Err(Error::Status("worker is already shut down".to_string()));
            }
            pending.shutdown = true;
        }

        if self.inner.started.get().is_none() {
            return Ok(0);
        }

        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.lock().map.is_empty() {
                break;
            }
            notified.await;
        }

        if !self.inner.context.is_running() {
            return Ok(0);
        }
        self.inner.context.send(Message::Stop).await?;
        self.inner.context.join().await?;
        Ok(0)
    }

    /// Cancels every pending awaiter and kills the context. Idempotent;
    /// subsequent enqueues fail with [`Error::Status`].
    pub async fn kill(&self) -> Result<()> {
        let armed = {
            let mut pending = self.inner.pending.lock();
            pending.shutdown = true;
            pending.receiver_armed
        };
        let _ = self.inner.context.kill().await;
        if !armed {
            cancel_all(&self.inner, || Error::Worker("worker was killed".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("pending", &self.pending_count())
            .field("state", &self.inner.context.state())
            .finish()
    }
}

/// Fails every pending awaiter and disarms the loop.
fn cancel_all(inner: &WorkerInner, make_error: impl Fn() -> Error) {
    let senders: Vec<PendingSender> = {
        let mut pending = inner.pending.lock();
        pending.receiver_armed = false;
        pending.map.drain().map(|(_, tx)| tx).collect()
    };
    for tx in senders {
        let _ = tx.send(Err(make_error()));
    }
    inner.drained.notify_waiters();
}

/// The worker's receive loop. Exactly one instance runs while the pending
/// map is non-empty; it exits the moment the map drains and is re-armed by
/// the next enqueue.
async fn receive_loop(inner: Arc<WorkerInner>) {
    loop {
        match inner.context.receive().await {
            Ok(Message::TaskResult(result)) => {
                let sender = inner.pending.lock().map.remove(&result.id);
                let Some(sender) = sender else {
                    tracing::warn!(worker = %inner.id, id = %result.id, "task result for unknown job id");
                    cancel_all(&inner, || {
                        Error::Synchronization(format!(
                            "task result for unknown job id '{}'",
                            result.id
                        ))
                    });
                    let _ = inner.context.kill().await;
                    return;
                };

                let outcome = match result.outcome {
                    Outcome::Value(value) => Ok(value),
                    Outcome::Failure(info) => {
                        Err(Error::panic(info.kind, info.message, info.stack))
                    },
                };
                let _ = sender.send(outcome);

                let drained = {
                    let mut pending = inner.pending.lock();
                    if pending.map.is_empty() {
                        pending.receiver_armed = false;
                        true
                    } else {
                        false
                    }
                };
                if drained {
                    inner.drained.notify_waiters();
                    return;
                }
            },
            Ok(other) => {
                tracing::warn!(worker = %inner.id, kind = other.kind_name(), "unexpected message from executor");
                cancel_all(&inner, || {
                    Error::Synchronization(format!(
                        "unexpected message '{}' from executor",
                        other.kind_name()
                    ))
                });
                let _ = inner.context.kill().await;
                return;
            },
            Err(e) => {
                cancel_all(&inner, || match &e {
                    Error::Synchronization(msg) => Error::Synchronization(msg.clone()),
                    other => Error::Context(format!("Failed to receive result: {other}")),
                });
                let _ = inner.context.kill().await;
                return;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Environment;
    use crate::types::TaskFailure;
    use async_trait::async_trait;
    use serde::ser::Error as _;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[async_trait]
    impl Task for Add {
        const KIND: &'static str = "add";
        type Output = i64;

        async fn run(self, _env: &Environment) -> std::result::Result<i64, TaskFailure> {
            Ok(self.a + self.b)
        }
    }

    /// A task whose payload refuses to serialise on the parent side.
    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(
            &self,
            _serializer: S,
        ) -> std::result::Result<S::Ok, S::Error> {
            Err(S::Error::custom("refusing to encode"))
        }
    }

    impl<'de> Deserialize<'de> for Unencodable {
        fn deserialize<D: serde::Deserializer<'de>>(
            _deserializer: D,
        ) -> std::result::Result<Self, D::Error> {
            Ok(Unencodable)
        }
    }

    #[async_trait]
    impl Task for Unencodable {
        const KIND: &'static str = "unencodable";
        type Output = ();

        async fn run(self, _env: &Environment) -> std::result::Result<(), TaskFailure> {
            Ok(())
        }
    }

    fn registry() -> Arc<TaskRegistry> {
        Arc::new(TaskRegistry::new().register::<Add>())
    }

    #[tokio::test]
    async fn enqueue_starts_context_lazily_and_round_trips() {
        let worker = Worker::thread(registry());
        assert!(worker.is_idle());
        assert!(worker.is_running());

        let handle = worker.enqueue(Add { a: 19, b: 23 }).await.unwrap();
        assert_eq!(handle.join().await.unwrap(), 42);
        assert!(worker.is_idle());

        assert_eq!(worker.shutdown().await.unwrap(), 0);
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn shutdown_without_start_completes_immediately() {
        let worker = Worker::thread(registry());
        assert_eq!(worker.shutdown().await.unwrap(), 0);

        let err = worker.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::Status(_)), "got: {err}");
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_status_error() {
        let worker = Worker::thread(registry());
        worker.shutdown().await.unwrap();

        let err = worker.enqueue(Add { a: 1, b: 1 }).await.unwrap_err();
        assert!(matches!(err, Error::Status(_)), "got: {err}");
    }

    #[tokio::test]
    async fn unencodable_payload_fails_only_that_task() {
        let registry = Arc::new(
            TaskRegistry::new()
                .register::<Add>()
                .register::<Unencodable>(),
        );
        let worker = Worker::thread(registry);

        let healthy = worker.enqueue(Add { a: 1, b: 2 }).await.unwrap();

        let err = worker.enqueue(Unencodable).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)), "got: {err}");

        // The in-flight task is unaffected.
        assert_eq!(healthy.join().await.unwrap(), 3);
        assert!(worker.is_running());
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let worker = Worker::thread(registry());
        worker.enqueue(Add { a: 1, b: 1 }).await.unwrap();
        worker.kill().await.unwrap();
        worker.kill().await.unwrap();
        assert!(!worker.is_running());
    }
}
