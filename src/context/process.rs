//! Process-backed execution context.
//!
//! The child's stdin and stdout are the wire: one framed channel half in
//! each direction. stderr is tee'd to the parent's stderr by a detached copy
//! task so the child can write diagnostics without ever blocking. Working
//! directory and environment variables are fixed at spawn, and the bootstrap
//! argument travels in the spawn environment rather than on the wire.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::OnceCell;

use crate::context::{
    describe_outcome, race_kill, Context, ContextState, KillSignal, StateCell,
};
use crate::error::{Error, Result};
use crate::runtime::BOOTSTRAP_ENV;
use crate::shared::Channel;
use crate::types::{Message, Outcome};

/// Spawn-time configuration for a [`ProcessContext`].
///
/// # Examples
///
/// ```
/// use offload::context::ProcessConfig;
/// use serde_json::json;
///
/// let config = ProcessConfig::new("./target/release/worker")
///     .arg("--queue")
///     .arg("default")
///     .env("RUST_LOG", "info")
///     .with_bootstrap(json!({"shard": 3}));
/// ```
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
    bootstrap: Value,
}

impl ProcessConfig {
    /// Configuration for spawning `program` with no arguments and a null
    /// bootstrap value.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            working_dir: None,
            bootstrap: Value::Null,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets one environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Sets the child's working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets the bootstrap value handed to the child's top-level callable.
    pub fn with_bootstrap(mut self, bootstrap: Value) -> Self {
        self.bootstrap = bootstrap;
        self
    }
}

/// A context backed by a child process speaking the framed protocol over
/// its stdio.
#[derive(Debug)]
pub struct ProcessContext {
    config: ProcessConfig,
    state: StateCell,
    kill_signal: KillSignal,
    channel: OnceCell<Channel<ChildStdout, ChildStdin>>,
    child: Mutex<Option<Child>>,
    pid: Mutex<Option<u32>>,
    stderr_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProcessContext {
    /// Builds an unstarted context from its spawn configuration.
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            state: StateCell::new(),
            kill_signal: KillSignal::new(),
            channel: OnceCell::new(),
            child: Mutex::new(None),
            pid: Mutex::new(None),
            stderr_task: Mutex::new(None),
        }
    }

    /// OS process id, when started.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    fn channel(&self) -> Result<&Channel<ChildStdout, ChildStdin>> {
        self.channel
            .get()
            .ok_or_else(|| Error::Status("context is not started".to_string()))
    }

    /// Turns a transport failure into a dead context: state, kill flag, and
    /// the child itself.
    fn mark_dead(&self, reason: &str) {
        if self.state.kill() {
            tracing::debug!(reason, "process context transport failed, killing");
            self.kill_signal.fire();
            self.reap_child();
        }
    }

    fn reap_child(&self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
    }

    async fn receive_raw(&self) -> Result<Message> {
        let channel = self.channel()?;
        race_kill(self.kill_signal.subscribe(), channel.receive()).await
    }
}

#[async_trait]
impl Context for ProcessContext {
    async fn start(&self) -> Result<()> {
        self.state.begin_start()?;

        let bootstrap = serde_json::to_string(&self.config.bootstrap).map_err(|e| {
            Error::Serialization(format!("bootstrap value cannot be encoded: {e}"))
        })?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .env(BOOTSTRAP_ENV, bootstrap)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.envs {
            command.env(key, value);
        }
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            self.state.kill();
            Error::Context(format!(
                "failed to spawn '{}': {e}",
                self.config.program.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Context("child stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Context("child stdout was not piped".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Context("child stderr was not piped".to_string()))?;

        // The tee must outlive any single receive so child diagnostics are
        // never able to fill the pipe and wedge the executor.
        *self.stderr_task.lock() = Some(tokio::spawn(async move {
            let mut sink = tokio::io::stderr();
            let _ = tokio::io::copy(&mut stderr, &mut sink).await;
        }));

        tracing::debug!(
            program = %self.config.program.display(),
            pid = child.id(),
            "spawned process executor"
        );

        *self.pid.lock() = child.id();
        *self.child.lock() = Some(child);
        let _ = self.channel.set(Channel::new(stdout, stdin));
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        if matches!(message, Message::ExitResult(_)) {
            return Err(Error::InvalidArgument(
                "exit results are reserved for the executor side".to_string(),
            ));
        }
        self.state.require_started()?;

        let channel = self.channel()?;
        match race_kill(self.kill_signal.subscribe(), channel.send(&message)).await {
            Ok(()) => Ok(()),
            Err(Error::Serialization(msg)) => Err(Error::Serialization(msg)),
            Err(e) => {
                self.mark_dead("send failed");
                Err(Error::Context(format!("failed to send message: {e}")))
            },
        }
    }

    async fn receive(&self) -> Result<Message> {
        self.state.require_started()?;
        match self.receive_raw().await {
            Ok(Message::ExitResult(exit)) => Err(Error::Synchronization(format!(
                "unexpected exit result carrying {}",
                describe_outcome(&exit.outcome)
            ))),
            Ok(message) => Ok(message),
            Err(Error::Serialization(msg)) => Err(Error::Serialization(msg)),
            Err(e) => {
                self.mark_dead("receive failed");
                Err(Error::Context(format!("failed to receive message: {e}")))
            },
        }
    }

    async fn join(&self) -> Result<Value> {
        self.state.begin_join()?;

        let exit = loop {
            match self.receive_raw().await {
                Ok(Message::ExitResult(exit)) => break exit,
                Ok(other) => {
                    tracing::warn!(kind = other.kind_name(), "discarding message during join");
                },
                Err(e) => {
                    self.mark_dead("join receive failed");
                    return Err(Error::Context(format!(
                        "failed to receive exit result: {e}"
                    )));
                },
            }
        };

        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return Err(Error::Context("context was killed".to_string()));
        };

        let status = match race_kill(self.kill_signal.subscribe(), async {
            child
                .wait()
                .await
                .map_err(|e| Error::Context(format!("failed to await process exit: {e}")))
        })
        .await
        {
            Ok(status) => status,
            Err(e) => {
                let _ = child.start_kill();
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                self.state.set(ContextState::Killed);
                return Err(e);
            },
        };

        self.state.set(ContextState::Joined);
        if let Some(handle) = self.stderr_task.lock().take() {
            // The copy ends on its own once the child closes stderr.
            drop(handle);
        }

        match status.code() {
            Some(0) => {},
            Some(code) => {
                return Err(Error::Context(format!("Process exited with code {code}")))
            },
            None => return Err(Error::Context("Process terminated by signal".to_string())),
        }

        match exit.outcome {
            Outcome::Value(value) => Ok(value),
            Outcome::Failure(info) => Err(Error::panic(info.kind, info.message, info.stack)),
        }
    }

    async fn kill(&self) -> Result<()> {
        if !self.state.kill() {
            return Ok(());
        }
        tracing::debug!(pid = self.pid(), "killing process executor");
        self.kill_signal.fire();
        self.reap_child();
        if let Some(handle) = self.stderr_task.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn signal(&self, signum: i32) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = self
            .pid()
            .ok_or_else(|| Error::Status("context is not started".to_string()))?;
        let signal = Signal::try_from(signum)
            .map_err(|_| Error::InvalidArgument(format!("unsupported signal {signum}")))?;
        kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| Error::Context(format!("failed to signal process {pid}: {e}")))
    }

    #[cfg(not(unix))]
    async fn signal(&self, _signum: i32) -> Result<()> {
        Err(Error::Status(
            "signals are not supported on this platform".to_string(),
        ))
    }

    fn state(&self) -> ContextState {
        self.state.get()
    }
}
