//! The user-facing task abstraction.
//!
//! A [`Task`] is a serialisable struct with a stable kind name, a
//! serialisable output type, and an async `run` method executed on the
//! worker side against that worker's [`Environment`]. The parent never needs
//! the `run` implementation; it ships tasks as erased [`TaskEnvelope`]s and
//! gets typed results back through the handle.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::runtime::Environment;
use crate::types::message::FailureInfo;

/// A serialisable unit of work executed on an isolated executor.
///
/// Implementations must be registered on the executor side under
/// [`Task::KIND`] (see [`TaskRegistry`](crate::runtime::TaskRegistry)); the
/// parent side only needs `Serialize`.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use offload::runtime::Environment;
/// use offload::{Task, TaskFailure};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Add {
///     a: i64,
///     b: i64,
/// }
///
/// #[async_trait]
/// impl Task for Add {
///     const KIND: &'static str = "add";
///     type Output = i64;
///
///     async fn run(self, _env: &Environment) -> Result<i64, TaskFailure> {
///         Ok(self.a + self.b)
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Serialize + DeserializeOwned + Send + 'static {
    /// Stable name matching this task with its handler on the executor.
    const KIND: &'static str;

    /// Output carried back in the task result. Must be serialisable.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Executes the task against the worker's shared environment.
    async fn run(self, env: &Environment) -> std::result::Result<Self::Output, TaskFailure>;
}

/// Error type tasks return from [`Task::run`].
///
/// Converted into a [`FailureInfo`] on the wire and re-raised as
/// [`Error::Panic`](crate::Error::Panic) on the submitter's handle.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    kind: String,
    message: String,
    stack: Option<String>,
}

impl TaskFailure {
    /// Builds a failure with a classification and message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Builds a generic `"task"` failure from a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new("task", message)
    }

    /// Attaches a stack trace to carry back to the parent.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskFailure {}

impl From<TaskFailure> for FailureInfo {
    fn from(failure: TaskFailure) -> Self {
        FailureInfo {
            kind: failure.kind,
            message: failure.message,
            stack: failure.stack,
        }
    }
}

/// The erased, parent-side form of a task: its kind plus the serialised
/// payload. This is what travels inside a [`Job`](crate::types::Job).
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    pub(crate) kind: &'static str,
    pub(crate) payload: Value,
}

impl TaskEnvelope {
    /// Serialises a task into its wire form. Fails with
    /// [`Error::Serialization`] when the payload is not representable;
    /// the failure is scoped to this task alone.
    pub fn new<T: Task>(task: &T) -> Result<Self> {
        let payload = serde_json::to_value(task).map_err(|e| {
            Error::Serialization(format!("task of kind '{}' cannot be encoded: {e}", T::KIND))
        })?;
        Ok(Self {
            kind: T::KIND,
            payload,
        })
    }

    /// The registered kind this envelope resolves to on the executor.
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    #[async_trait]
    impl Task for Echo {
        const KIND: &'static str = "echo";
        type Output = String;

        async fn run(self, _env: &Environment) -> std::result::Result<String, TaskFailure> {
            Ok(self.text)
        }
    }

    #[test]
    fn envelope_carries_kind_and_payload() {
        let envelope = TaskEnvelope::new(&Echo {
            text: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(envelope.kind(), "echo");
        assert_eq!(envelope.payload, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn run_produces_output() {
        let env = Environment::new();
        let out = Echo {
            text: "roundtrip".to_string(),
        }
        .run(&env)
        .await
        .unwrap();
        assert_eq!(out, "roundtrip");
    }

    #[test]
    fn failure_converts_to_wire_form() {
        let info: FailureInfo = TaskFailure::new("panic", "boom")
            .with_stack("frame 0")
            .into();
        assert_eq!(info.kind, "panic");
        assert_eq!(info.message, "boom");
        assert_eq!(info.stack.as_deref(), Some("frame 0"));
    }
}
