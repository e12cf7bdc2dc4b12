//! Parallel-execution substrate for cooperative async hosts.
//!
//! `offload` ships serialisable tasks to isolated executors (child
//! processes, or dedicated threads) over framed message channels, and
//! returns their results asynchronously. Three layers compose:
//!
//! - [`context`]: a durable, bidirectional bridge to one executor with a
//!   precise lifecycle (`start → send/receive → join | kill`).
//! - [`Worker`]: the job multiplexer that lets many outstanding tasks share
//!   one context, correlating responses to requests by id.
//! - [`pool::Pool`]: the capacity manager that grows a bounded worker set on
//!   demand, routes tasks to the least-loaded idle worker, and reaps on
//!   shutdown.
//!
//! Tasks implement [`Task`]: a serde-serialisable struct with a stable kind
//! name and an async `run` method executed against the worker-shared
//! [`runtime::Environment`]. The executor side resolves kinds through a
//! [`runtime::TaskRegistry`]; a process worker binary is one call to
//! [`runtime::worker_main`].
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use offload::pool::{Pool, PoolConfig};
//! use offload::runtime::{Environment, TaskRegistry};
//! use offload::{Task, TaskFailure};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct WordCount {
//!     text: String,
//! }
//!
//! #[async_trait]
//! impl Task for WordCount {
//!     const KIND: &'static str = "word_count";
//!     type Output = usize;
//!
//!     async fn run(self, _env: &Environment) -> Result<usize, TaskFailure> {
//!         Ok(self.text.split_whitespace().count())
//!     }
//! }
//!
//! # async fn example() -> offload::Result<()> {
//! let registry = Arc::new(TaskRegistry::new().register::<WordCount>());
//! let pool = Pool::thread_pool(PoolConfig::default(), registry);
//!
//! let handle = pool.enqueue(WordCount { text: "fearless concurrency".into() }).await?;
//! assert_eq!(handle.join().await?, 2);
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Ordering and failure model
//!
//! Messages sent on one context are observed by the executor in send order;
//! task results come back in completion order, not submission order. A
//! payload that cannot be encoded fails only its own task. Everything else
//! (a dead executor, a broken channel, a protocol violation) kills the
//! offending worker and fails every awaiter it held; a pool removes the
//! dead worker and continues with the rest.

#![warn(missing_docs)]

pub mod context;
pub mod pool;
pub mod runtime;
pub mod shared;
pub mod types;
pub mod worker;

mod error;

pub use context::{Context, ContextState};
pub use error::{Error, Result};
pub use types::{Task, TaskFailure};
pub use worker::{TaskHandle, Worker};
