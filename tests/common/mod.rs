//! Task types shared by the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use offload::runtime::{Environment, TaskRegistry};
use offload::{Task, TaskFailure};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Returns its payload unchanged.
#[derive(Serialize, Deserialize)]
pub struct Echo {
    pub value: Value,
}

#[async_trait]
impl Task for Echo {
    const KIND: &'static str = "echo";
    type Output = Value;

    async fn run(self, _env: &Environment) -> Result<Value, TaskFailure> {
        Ok(self.value)
    }
}

/// Sleeps, then returns a marker value.
#[derive(Serialize, Deserialize)]
pub struct SleepReturn {
    pub millis: u64,
    pub value: i64,
}

#[async_trait]
impl Task for SleepReturn {
    const KIND: &'static str = "sleep_return";
    type Output = i64;

    async fn run(self, _env: &Environment) -> Result<i64, TaskFailure> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(self.value)
    }
}

/// Polls until a file exists, then returns a marker value.
#[derive(Serialize, Deserialize)]
pub struct WaitForFile {
    pub path: PathBuf,
    pub value: i64,
}

#[async_trait]
impl Task for WaitForFile {
    const KIND: &'static str = "wait_for_file";
    type Output = i64;

    async fn run(self, _env: &Environment) -> Result<i64, TaskFailure> {
        while !self.path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(self.value)
    }
}

/// Writes a value into the worker's environment.
#[derive(Serialize, Deserialize)]
pub struct EnvSet {
    pub key: String,
    pub value: Value,
}

#[async_trait]
impl Task for EnvSet {
    const KIND: &'static str = "env_set";
    type Output = ();

    async fn run(self, env: &Environment) -> Result<(), TaskFailure> {
        env.set(self.key, self.value);
        Ok(())
    }
}

/// Reads a value from the worker's environment.
#[derive(Serialize, Deserialize)]
pub struct EnvGet {
    pub key: String,
}

#[async_trait]
impl Task for EnvGet {
    const KIND: &'static str = "env_get";
    type Output = Option<Value>;

    async fn run(self, env: &Environment) -> Result<Option<Value>, TaskFailure> {
        Ok(env.get(&self.key))
    }
}

/// Fails with the given message.
#[derive(Serialize, Deserialize)]
pub struct Fail {
    pub message: String,
}

#[async_trait]
impl Task for Fail {
    const KIND: &'static str = "fail";
    type Output = ();

    async fn run(self, _env: &Environment) -> Result<(), TaskFailure> {
        Err(TaskFailure::new("task", self.message))
    }
}

/// Registry covering every test task.
pub fn registry() -> Arc<TaskRegistry> {
    Arc::new(
        TaskRegistry::new()
            .register::<Echo>()
            .register::<SleepReturn>()
            .register::<WaitForFile>()
            .register::<EnvSet>()
            .register::<EnvGet>()
            .register::<Fail>(),
    )
}
