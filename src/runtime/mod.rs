//! Executor-side runtime: the job loop, the task registry, and the child
//! process entry point.
//!
//! An executor's life is one call to [`serve`]: consume the bootstrap value,
//! invoke the top-level callable with the channel, and write exactly one
//! exit result before returning. The standard callable is [`task_loop`],
//! which multiplexes jobs concurrently on a single-threaded runtime until
//! the stop sentinel arrives. Process children enter through
//! [`child_main`], which binds stdin/stdout as the channel.

mod environment;

pub use environment::Environment;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::shared::Channel;
use crate::types::{
    ExitResult, FailureInfo, Message, Outcome, Task, TaskFailure, TaskResult,
};

/// Environment variable carrying the JSON-encoded bootstrap value into a
/// child process. Set at spawn by the parent's process context; read once by
/// [`child_main`].
pub const BOOTSTRAP_ENV: &str = "OFFLOAD_BOOTSTRAP";

/// The channel type bound by [`child_main`] in a child process.
pub type StdioChannel = Channel<tokio::io::Stdin, tokio::io::Stdout>;

type Runner = Arc<
    dyn Fn(Value, Arc<Environment>) -> BoxFuture<'static, std::result::Result<Value, TaskFailure>>
        + Send
        + Sync,
>;

/// Maps task kinds to deserialise-and-run handlers on the executor side.
///
/// The registry must cover every kind the parent will submit; a job whose
/// kind is unregistered fails that job alone with an `"unknown_task"`
/// descriptor, never the executor.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use offload::runtime::{Environment, TaskRegistry};
/// use offload::{Task, TaskFailure};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Double(i64);
///
/// #[async_trait]
/// impl Task for Double {
///     const KIND: &'static str = "double";
///     type Output = i64;
///
///     async fn run(self, _env: &Environment) -> Result<i64, TaskFailure> {
///         Ok(self.0 * 2)
///     }
/// }
///
/// let registry = TaskRegistry::new().register::<Double>();
/// assert!(registry.contains("double"));
/// ```
#[derive(Default)]
pub struct TaskRegistry {
    runners: HashMap<&'static str, Runner>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            runners: HashMap::new(),
        }
    }

    /// Registers a task type under [`Task::KIND`].
    pub fn register<T: Task>(mut self) -> Self {
        self.runners.insert(
            T::KIND,
            Arc::new(move |payload, env| {
                async move {
                    let task: T = serde_json::from_value(payload).map_err(|e| {
                        TaskFailure::new(
                            "decode",
                            format!("payload for kind '{}' cannot be decoded: {e}", T::KIND),
                        )
                    })?;
                    let output = task.run(&env).await?;
                    serde_json::to_value(output).map_err(|_| {
                        TaskFailure::new(
                            "serialization",
                            "The given data cannot be sent because it is not serializable",
                        )
                    })
                }
                .boxed()
            }),
        );
        self
    }

    /// True when a handler is registered for `kind`.
    pub fn contains(&self, kind: &str) -> bool {
        self.runners.contains_key(kind)
    }

    /// Runs one job payload to an outcome, catching panics so a misbehaving
    /// task never takes the executor down.
    pub(crate) async fn run(&self, kind: &str, payload: Value, env: Arc<Environment>) -> Outcome {
        let Some(runner) = self.runners.get(kind) else {
            return Outcome::Failure(FailureInfo::new(
                "unknown_task",
                format!("no task handler registered for kind '{kind}'"),
            ));
        };

        match AssertUnwindSafe(runner(payload, env)).catch_unwind().await {
            Ok(Ok(value)) => Outcome::Value(value),
            Ok(Err(failure)) => {
                eprintln!("DEBUG_BRANCH Ok(Err) failure={:?}", failure);
                Outcome::Failure(failure.into())
            }
            Err(panic) => Outcome::Failure(FailureInfo::new("panic", panic_message(&panic))),
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    eprintln!(
        "DEBUG_PANIC_MESSAGE is_str={} is_string={} is_box_any={} is_cow={} is_box_dyn_error={} type_id={:?} str_type_id={:?}",
        panic.is::<&str>(),
        panic.is::<String>(),
        panic.is::<Box<dyn std::any::Any + Send>>(),
        panic.is::<std::borrow::Cow<'static, str>>(),
        panic.is::<Box<dyn std::error::Error + Send + Sync>>(),
        std::any::Any::type_id(panic),
        std::any::TypeId::of::<&str>(),
    );
    if let Some(inner) = panic.downcast_ref::<Box<dyn std::any::Any + Send>>() {
        eprintln!(
            "DEBUG_INNER is_str={} is_string={}",
            inner.is::<&str>(),
            inner.is::<String>()
        );
    }
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "executor panicked".to_string()
    }
}

/// The standard top-level callable: receive jobs, run them concurrently,
/// answer each with an id-tagged result, and return 0 once the stop
/// sentinel arrives.
///
/// Jobs are not serialised against each other; a slow task never delays the
/// loop's next receive. The returned value becomes the exit result.
pub async fn task_loop<R, W>(
    channel: Arc<Channel<R, W>>,
    registry: Arc<TaskRegistry>,
) -> std::result::Result<Value, TaskFailure>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let env = Arc::new(Environment::new());
    loop {
        match channel.receive().await {
            Ok(Message::Stop) => break,
            Ok(Message::Job(job)) => {
                let registry = Arc::clone(&registry);
                let env = Arc::clone(&env);
                let channel = Arc::clone(&channel);
                tokio::spawn(async move {
                    let outcome = registry.run(&job.kind, job.payload, env).await;
                    let result = Message::TaskResult(TaskResult {
                        id: job.id,
                        outcome,
                    });
                    if let Err(e) = channel.send(&result).await {
                        tracing::warn!(error = %e, "failed to deliver task result");
                    }
                });
            },
            Ok(other) => {
                tracing::warn!(kind = other.kind_name(), "ignoring unexpected message");
            },
            Err(e) => {
                return Err(TaskFailure::new(
                    "channel",
                    format!("job loop receive failed: {e}"),
                ));
            },
        }
    }
    Ok(Value::from(0))
}

/// Runs a top-level callable to completion and writes its exit result.
///
/// This is the executor's whole life: panics and failures from the callable
/// are converted into the exit result's failure arm rather than escaping.
pub async fn serve<R, W, F, Fut>(channel: Arc<Channel<R, W>>, bootstrap: Value, callable: F)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    F: FnOnce(Arc<Channel<R, W>>, Value) -> Fut,
    Fut: std::future::Future<Output = std::result::Result<Value, TaskFailure>>,
{
    let result = AssertUnwindSafe(callable(Arc::clone(&channel), bootstrap))
        .catch_unwind()
        .await;

    let outcome = match result {
        Ok(Ok(value)) => Outcome::Value(value),
        Ok(Err(failure)) => Outcome::Failure(failure.into()),
        Err(panic) => Outcome::Failure(FailureInfo::new("panic", panic_message(&panic))),
    };

    if let Err(e) = channel
        .send(&Message::ExitResult(ExitResult { outcome }))
        .await
    {
        tracing::debug!(error = %e, "failed to send exit result");
    }
}

/// Entry point for a child process executor: binds stdin/stdout as the
/// channel, decodes the bootstrap value from the spawn environment, runs the
/// callable, writes the exit result, and exits 0.
///
/// A worker binary's `main` is one line:
///
/// ```no_run
/// use offload::runtime::{self, TaskRegistry};
///
/// fn main() {
///     runtime::worker_main(TaskRegistry::new());
/// }
/// ```
pub fn child_main<F, Fut>(callable: F) -> !
where
    F: FnOnce(Arc<StdioChannel>, Value) -> Fut,
    Fut: std::future::Future<Output = std::result::Result<Value, TaskFailure>>,
{
    let bootstrap = std::env::var(BOOTSTRAP_ENV)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or(Value::Null);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build executor runtime");

    let channel = Arc::new(Channel::new(tokio::io::stdin(), tokio::io::stdout()));
    runtime.block_on(serve(channel, bootstrap, callable));
    std::process::exit(0)
}

/// [`child_main`] with the standard job loop over `registry`.
pub fn worker_main(registry: TaskRegistry) -> ! {
    let registry = Arc::new(registry);
    child_main(move |channel, _bootstrap| task_loop(channel, registry))
}
