//! Thread-backed execution context.
//!
//! Externally identical to the process variant: the executor is a dedicated
//! OS thread running its own single-threaded runtime, wired to the parent by
//! an in-memory duplex stream speaking the same framed protocol. The exit
//! code is always 0 on clean return. Kill is best-effort: it severs the
//! channel, and the executor exits at its next receive; there is no safe way
//! to terminate the thread itself.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use crate::context::{
    describe_outcome, race_kill, Context, ContextState, KillSignal, StateCell,
};
use crate::error::{Error, Result};
use crate::runtime::TaskRegistry;
use crate::shared::{Channel, FrameReader, FrameWriter};
use crate::types::{Message, Outcome, TaskFailure};

/// The channel type handed to a thread executor's top-level callable.
pub type DuplexChannel = Channel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// In-memory pipe capacity between parent and executor.
const DUPLEX_BUFFER: usize = 64 * 1024;

type Callable = Box<
    dyn FnOnce(Arc<DuplexChannel>, Value) -> LocalBoxFuture<'static, std::result::Result<Value, TaskFailure>>
        + Send,
>;

/// A context backed by a dedicated thread in this process.
pub struct ThreadContext {
    state: StateCell,
    kill_signal: KillSignal,
    bootstrap: Value,
    callable: Mutex<Option<Callable>>,
    reader: AsyncMutex<Option<FrameReader<ReadHalf<DuplexStream>>>>,
    writer: AsyncMutex<Option<FrameWriter<WriteHalf<DuplexStream>>>>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl ThreadContext {
    /// Builds an unstarted thread context around a top-level callable. The
    /// callable receives the executor-side channel and the bootstrap value,
    /// and its return value becomes the exit result.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use offload::context::{Context, ThreadContext};
    /// use serde_json::{json, Value};
    ///
    /// # async fn example() -> offload::Result<()> {
    /// let ctx = ThreadContext::with_bootstrap(json!("Test"), |_channel, bootstrap| async move {
    ///     Ok(bootstrap)
    /// });
    /// ctx.start().await?;
    /// assert_eq!(ctx.join().await?, Value::String("Test".to_string()));
    /// # Ok(())
    /// # }
    /// ```
    pub fn new<F, Fut>(callable: F) -> Self
    where
        F: FnOnce(Arc<DuplexChannel>, Value) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = std::result::Result<Value, TaskFailure>> + 'static,
    {
        Self::with_bootstrap(Value::Null, callable)
    }

    /// Like [`ThreadContext::new`] with an explicit bootstrap value.
    pub fn with_bootstrap<F, Fut>(bootstrap: Value, callable: F) -> Self
    where
        F: FnOnce(Arc<DuplexChannel>, Value) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = std::result::Result<Value, TaskFailure>> + 'static,
    {
        let callable: Callable = Box::new(move |channel, bootstrap| {
            callable(channel, bootstrap).boxed_local()
        });
        Self {
            state: StateCell::new(),
            kill_signal: KillSignal::new(),
            bootstrap,
            callable: Mutex::new(Some(callable)),
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// A thread context whose callable is the standard job loop over the
    /// given task registry. This is what thread-backed workers and pools
    /// spawn.
    pub fn worker(registry: Arc<TaskRegistry>) -> Self {
        Self::new(move |channel, _bootstrap| crate::runtime::task_loop(channel, registry))
    }

    fn mark_dead(&self, reason: &str) {
        if self.state.kill() {
            tracing::debug!(reason, "thread context transport failed, killing");
            self.kill_signal.fire();
        }
    }
}

#[async_trait]
impl Context for ThreadContext {
    async fn start(&self) -> Result<()> {
        self.state.begin_start()?;

        let callable = self
            .callable
            .lock()
            .take()
            .ok_or_else(|| Error::Status("thread context callable already consumed".to_string()))?;

        let (parent_io, child_io) = tokio::io::duplex(DUPLEX_BUFFER);
        let (parent_read, parent_write) = tokio::io::split(parent_io);
        let (child_read, child_write) = tokio::io::split(child_io);

        *self.reader.lock().await = Some(FrameReader::new(parent_read));
        *self.writer.lock().await = Some(FrameWriter::new(parent_write));

        let bootstrap = self.bootstrap.clone();
        let handle = std::thread::Builder::new()
            .name("offload-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build executor runtime");
                        return;
                    },
                };
                let channel = Arc::new(Channel::new(child_read, child_write));
                runtime.block_on(crate::runtime::serve(channel, bootstrap, |chan, boot| {
                    callable(chan, boot)
                }));
            })
            .map_err(|e| {
                self.state.kill();
                Error::Context(format!("failed to spawn worker thread: {e}"))
            })?;

        tracing::debug!("spawned thread executor");
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        if matches!(message, Message::ExitResult(_)) {
            return Err(Error::InvalidArgument(
                "exit results are reserved for the executor side".to_string(),
            ));
        }
        self.state.require_started()?;

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Context("context was killed".to_string()))?;
        match race_kill(self.kill_signal.subscribe(), writer.write_message(&message)).await {
            Ok(()) => Ok(()),
            Err(Error::Serialization(msg)) => Err(Error::Serialization(msg)),
            Err(e) => {
                drop(guard);
                self.mark_dead("send failed");
                Err(Error::Context(format!("failed to send message: {e}")))
            },
        }
    }

    async fn receive(&self) -> Result<Message> {
        self.state.require_started()?;

        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| Error::Context("context was killed".to_string()))?;
        match race_kill(self.kill_signal.subscribe(), reader.read_message()).await {
            Ok(Message::ExitResult(exit)) => Err(Error::Synchronization(format!(
                "unexpected exit result carrying {}",
                describe_outcome(&exit.outcome)
            ))),
            Ok(message) => Ok(message),
            Err(Error::Serialization(msg)) => Err(Error::Serialization(msg)),
            Err(e) => {
                drop(guard);
                self.mark_dead("receive failed");
                Err(Error::Context(format!("failed to receive message: {e}")))
            },
        }
    }

    async fn join(&self) -> Result<Value> {
        self.state.begin_join()?;

        let exit = {
            let mut guard = self.reader.lock().await;
            loop {
                let reader = guard
                    .as_mut()
                    .ok_or_else(|| Error::Context("context was killed".to_string()))?;
                match race_kill(self.kill_signal.subscribe(), reader.read_message()).await {
                    Ok(Message::ExitResult(exit)) => break exit,
                    Ok(other) => {
                        tracing::warn!(kind = other.kind_name(), "discarding message during join");
                    },
                    Err(e) => {
                        drop(guard);
                        self.mark_dead("join receive failed");
                        return Err(Error::Context(format!(
                            "failed to receive exit result: {e}"
                        )));
                    },
                }
            }
        };

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let joined = race_kill(self.kill_signal.subscribe(), async move {
                tokio::task::spawn_blocking(move || handle.join())
                    .await
                    .map_err(|e| Error::Context(format!("failed to join worker thread: {e}")))
            })
            .await?;
            if joined.is_err() {
                tracing::warn!("worker thread panicked outside the serve loop");
            }
        }

        self.state.set(ContextState::Joined);
        match exit.outcome {
            Outcome::Value(value) => Ok(value),
            Outcome::Failure(info) => Err(Error::panic(info.kind, info.message, info.stack)),
        }
    }

    async fn kill(&self) -> Result<()> {
        if !self.state.kill() {
            return Ok(());
        }
        tracing::debug!("killing thread executor");
        self.kill_signal.fire();

        // Dropping both parent halves closes the duplex stream; the executor
        // observes EOF at its next receive and unwinds on its own.
        self.reader.lock().await.take();
        self.writer.lock().await.take();
        self.handle.lock().take();
        Ok(())
    }

    async fn signal(&self, _signum: i32) -> Result<()> {
        Err(Error::Status(
            "signals are not supported by thread contexts".to_string(),
        ))
    }

    fn state(&self) -> ContextState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn bootstrap_round_trip() {
        let ctx = ThreadContext::with_bootstrap(json!("Test"), |_channel, bootstrap| async move {
            Ok(bootstrap)
        });
        ctx.start().await.unwrap();
        let value = ctx.join().await.unwrap();
        assert_eq!(value, json!("Test"));
        assert_eq!(ctx.state(), ContextState::Joined);
    }

    #[tokio::test]
    async fn start_twice_is_status_error() {
        let ctx = ThreadContext::new(|_channel, _bootstrap| async move { Ok(Value::Null) });
        ctx.start().await.unwrap();
        let err = ctx.start().await.unwrap_err();
        assert!(matches!(err, Error::Status(_)), "got: {err}");
        ctx.join().await.unwrap();
    }

    #[tokio::test]
    async fn callable_failure_surfaces_as_panic_on_join() {
        let ctx = ThreadContext::new(|_channel, _bootstrap| async move {
            Err(TaskFailure::new(
                "bootstrap",
                "No script found at 'missing-entry'",
            ))
        });
        ctx.start().await.unwrap();
        let err = ctx.join().await.unwrap_err();
        match err {
            Error::Panic { kind, message, .. } => {
                assert_eq!(kind, "bootstrap");
                assert!(message.contains("No script found at 'missing-entry'"));
            },
            other => panic!("expected panic error, got: {other}"),
        }
    }

    #[tokio::test]
    async fn callable_panic_surfaces_as_panic_on_join() {
        let ctx = ThreadContext::new(|_channel, _bootstrap| async move {
            panic!("executor blew up");
            #[allow(unreachable_code)]
            Ok(Value::Null)
        });
        ctx.start().await.unwrap();
        let err = ctx.join().await.unwrap_err();
        match err {
            Error::Panic { kind, message, .. } => {
                assert_eq!(kind, "panic");
                assert!(message.contains("executor blew up"), "got: {message}");
            },
            other => panic!("expected panic error, got: {other}"),
        }
    }

    #[tokio::test]
    async fn kill_fails_in_flight_receive() {
        let ctx = Arc::new(ThreadContext::new(|channel, _bootstrap| async move {
            // Hold the executor open until the parent goes away.
            loop {
                if channel.receive().await.is_err() {
                    return Ok(Value::Null);
                }
            }
        }));
        ctx.start().await.unwrap();

        let receiver = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.receive().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        ctx.kill().await.unwrap();

        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Context(_)), "got: {err}");
        assert_eq!(ctx.state(), ContextState::Killed);
    }

    #[tokio::test]
    async fn signal_is_unsupported() {
        let ctx = ThreadContext::new(|_channel, _bootstrap| async move { Ok(Value::Null) });
        let err = ctx.signal(15).await.unwrap_err();
        assert!(matches!(err, Error::Status(_)), "got: {err}");
    }
}
