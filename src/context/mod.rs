//! Execution contexts: isolated executors reachable over a framed channel.
//!
//! A [`Context`] owns exactly one executor (a child process or a dedicated
//! thread) and the duplex message channel wired to it. The lifecycle is
//! `created → started → joined | killed`; operations outside the legal state
//! fail with [`Error::Status`], and a dead transport turns the context
//! terminal.

mod process;
mod thread;

pub use process::{ProcessConfig, ProcessContext};
pub use thread::{DuplexChannel, ThreadContext};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::types::{Message, Outcome};

/// Lifecycle state of a context.
///
/// `Created` becomes `Started` exactly once. `Joined` and `Killed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Constructed, executor not yet spawned.
    Created,
    /// Executor spawned, channel live.
    Started,
    /// A join is draining the channel towards the exit result.
    Joining,
    /// Joined cleanly; the executor has exited.
    Joined,
    /// Forcibly terminated, or the transport died.
    Killed,
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Killed => "killed",
        };
        write!(f, "{name}")
    }
}

/// A bidirectional bridge to one isolated executor.
///
/// Implementations guarantee that messages sent from the parent are observed
/// by the executor in send order, and that `send`/`receive`/`join` in flight
/// when [`Context::kill`] fires fail promptly with [`Error::Context`].
#[async_trait]
pub trait Context: Send + Sync {
    /// Spawns the executor and establishes the channel. Fails with
    /// [`Error::Status`] when called twice and [`Error::Context`] when the
    /// executor cannot be spawned.
    async fn start(&self) -> Result<()>;

    /// Sends one application message. Exit results are reserved for the
    /// executor side and are rejected with [`Error::InvalidArgument`]. A
    /// transport failure kills the context.
    async fn send(&self, message: Message) -> Result<()>;

    /// Receives one application message. An out-of-band exit result (the
    /// executor terminated mid-protocol) surfaces as
    /// [`Error::Synchronization`] describing the exit value.
    async fn receive(&self) -> Result<Message>;

    /// Awaits the executor's final exit result, then its OS-level exit.
    /// A nonzero exit code is [`Error::Context`]; a failure outcome is
    /// re-raised as [`Error::Panic`].
    async fn join(&self) -> Result<Value>;

    /// Forcibly terminates the executor. Idempotent; any non-terminal state
    /// transitions to killed.
    async fn kill(&self) -> Result<()>;

    /// Forwards an OS signal to the executor. Only process-backed contexts
    /// support this.
    async fn signal(&self, signum: i32) -> Result<()>;

    /// Current lifecycle state.
    fn state(&self) -> ContextState;

    /// True while the executor is live (started or joining).
    fn is_running(&self) -> bool {
        matches!(self.state(), ContextState::Started | ContextState::Joining)
    }
}

/// Shared lifecycle bookkeeping for context implementations.
///
/// Transitions are all short critical sections; the cell is never held
/// across an await.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: Mutex<ContextState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ContextState::Created),
        }
    }

    pub(crate) fn get(&self) -> ContextState {
        *self.state.lock()
    }

    pub(crate) fn set(&self, next: ContextState) {
        *self.state.lock() = next;
    }

    /// `created → started`, or the appropriate error.
    pub(crate) fn begin_start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ContextState::Created => {
                *state = ContextState::Started;
                Ok(())
            },
            other => Err(Error::Status(format!(
                "cannot start a context in state '{other}'"
            ))),
        }
    }

    /// Verifies the context is live for a send or receive.
    pub(crate) fn require_started(&self) -> Result<()> {
        match self.get() {
            ContextState::Started => Ok(()),
            ContextState::Killed => Err(Error::Context("context was killed".to_string())),
            other => Err(Error::Status(format!(
                "context is not running (state '{other}')"
            ))),
        }
    }

    /// `started → joining`, or the appropriate error.
    pub(crate) fn begin_join(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ContextState::Started => {
                *state = ContextState::Joining;
                Ok(())
            },
            ContextState::Killed => Err(Error::Context("context was killed".to_string())),
            other => Err(Error::Status(format!(
                "cannot join a context in state '{other}'"
            ))),
        }
    }

    /// Transitions to killed. Returns false when already killed.
    pub(crate) fn kill(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ContextState::Killed {
            return false;
        }
        *state = ContextState::Killed;
        true
    }
}

/// Kill flag raced against every blocking channel operation, so a kill
/// promptly fails whatever is in flight.
#[derive(Debug)]
pub(crate) struct KillSignal {
    tx: watch::Sender<bool>,
}

impl KillSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn fire(&self) {
        let _ = self.tx.send(true);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Races a channel operation against the kill flag.
pub(crate) async fn race_kill<T, F>(mut killed: watch::Receiver<bool>, op: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    if *killed.borrow() {
        return Err(Error::Context("context was killed".to_string()));
    }
    tokio::select! {
        result = op => result,
        _ = killed.changed() => Err(Error::Context("context was killed".to_string())),
    }
}

/// Describes an exit outcome for protocol error messages.
pub(crate) fn describe_outcome(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Value(Value::Null) => "value of type null".to_string(),
        Outcome::Value(Value::Bool(_)) => "value of type bool".to_string(),
        Outcome::Value(Value::Number(_)) => "value of type number".to_string(),
        Outcome::Value(Value::String(_)) => "value of type string".to_string(),
        Outcome::Value(Value::Array(_)) => "value of type array".to_string(),
        Outcome::Value(Value::Object(_)) => "value of type object".to_string(),
        Outcome::Failure(info) => format!("failure of kind '{}'", info.kind),
    }
}
