//! Wire-level message types exchanged between a parent and its executor.
//!
//! Every frame on a channel carries exactly one [`Message`]. The envelope is
//! internally tagged so the receiving side can dispatch without peeking at
//! payload internals. Task outcomes and exit outcomes share [`Outcome`], a
//! tagged success-or-failure variant whose failure arm preserves the remote
//! kind, message, and stack.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One framed message on a context's channel.
///
/// Parent to child: [`Message::Job`] and [`Message::Stop`].
/// Child to parent: [`Message::TaskResult`] and [`Message::ExitResult`].
/// A context refuses to send an exit result from the parent side; that
/// message is reserved for the child's final word.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Execute a task. Parent to child.
    Job(Job),
    /// Stop the job loop and exit cleanly. Parent to child.
    Stop,
    /// The outcome of one previously submitted job. Child to parent.
    TaskResult(TaskResult),
    /// Terminal message, sent exactly once before the child exits.
    ExitResult(ExitResult),
}

impl Message {
    /// Short human-readable name of the message variant, used in protocol
    /// error reporting.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Job(_) => "job",
            Self::Stop => "stop",
            Self::TaskResult(_) => "task_result",
            Self::ExitResult(_) => "exit_result",
        }
    }
}

/// A task envelope plus the unique id minted by the parent.
///
/// The id is generated once, when the job is created, and travels with the
/// envelope verbatim; the child answers with the same id and never mints its
/// own. Ids are unique within one worker's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque id correlating this job with its eventual result.
    pub id: String,
    /// Registered kind of the task, resolved by the executor's registry.
    pub kind: String,
    /// Serialised task payload.
    pub payload: Value,
}

impl Job {
    /// Wraps a task envelope with a freshly minted id.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Id-tagged answer to one [`Job`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Id of the job this result answers.
    pub id: String,
    /// Success value or failure descriptor.
    pub outcome: Outcome,
}

/// The child's final message: the value its top-level callable returned, or
/// the failure that ended it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitResult {
    /// Success value or failure descriptor.
    pub outcome: Outcome,
}

/// Success-or-failure payload shared by task and exit results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The operation produced a value.
    Value(Value),
    /// The operation failed; the descriptor survives the wire intact.
    Failure(FailureInfo),
}

impl Outcome {
    /// True for the success arm.
    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }
}

/// A remote failure: classification, message, and optional stack trace.
///
/// Produced on the child side (task panics, bootstrap failures,
/// unserialisable outputs) and re-raised on the parent as
/// [`Error::Panic`](crate::Error::Panic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Failure classification, for example `"panic"` or `"bootstrap"`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Stack trace captured on the child, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl FailureInfo {
    /// Builds a failure descriptor without a stack trace.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attaches a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_serde_preserves_id() {
        let job = Job::new("echo", json!({"text": "hi"}));
        let id = job.id.clone();

        let bytes = serde_json::to_vec(&Message::Job(job)).unwrap();
        let back: Message = serde_json::from_slice(&bytes).unwrap();
        match back {
            Message::Job(job) => {
                assert_eq!(job.id, id);
                assert_eq!(job.kind, "echo");
                assert_eq!(job.payload, json!({"text": "hi"}));
            },
            other => panic!("expected job, got {}", other.kind_name()),
        }
    }

    #[test]
    fn job_ids_are_unique() {
        let a = Job::new("echo", Value::Null);
        let b = Job::new("echo", Value::Null);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn message_envelope_is_tagged() {
        let value = serde_json::to_value(Message::Stop).unwrap();
        assert_eq!(value, json!({"type": "stop"}));

        let value = serde_json::to_value(Message::ExitResult(ExitResult {
            outcome: Outcome::Value(json!(0)),
        }))
        .unwrap();
        assert_eq!(value["type"], "exit_result");
    }

    #[test]
    fn outcome_failure_round_trip() {
        let result = TaskResult {
            id: "job-1".to_string(),
            outcome: Outcome::Failure(
                FailureInfo::new("panic", "index out of bounds").with_stack("at worker.rs:10"),
            ),
        };
        let bytes = serde_json::to_vec(&result).unwrap();
        let back: TaskResult = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, "job-1");
        match back.outcome {
            Outcome::Failure(info) => {
                assert_eq!(info.kind, "panic");
                assert_eq!(info.message, "index out of bounds");
                assert_eq!(info.stack.as_deref(), Some("at worker.rs:10"));
            },
            Outcome::Value(v) => panic!("expected failure, got value {v}"),
        }
    }

    #[test]
    fn failure_stack_omitted_when_absent() {
        let value = serde_json::to_value(FailureInfo::new("bootstrap", "no entry")).unwrap();
        assert!(value.get("stack").is_none());
    }
}
