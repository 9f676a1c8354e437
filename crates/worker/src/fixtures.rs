//! Small tasks served by the `workhive-fixture-worker` binary
//!
//! They exercise each outcome a task can have: a value, a failure with a
//! cause chain, a panic, an unencodable result, a crash of the whole worker
//! and cooperative or ignored cancellation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use workhive_errors::TaskError;

use crate::environment::Environment;
use crate::task::{Task, TaskRegistry};

/// Every fixture task
#[must_use]
pub fn registry() -> TaskRegistry {
    TaskRegistry::new()
        .register::<Sleep>()
        .register::<Echo>()
        .register::<Fail>()
        .register::<Panic>()
        .register::<Exit>()
        .register::<Remember>()
        .register::<Recall>()
        .register::<AwaitCancel>()
        .register::<Unencodable>()
}

/// Sleep, then return `label`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sleep {
    pub millis: u64,
    pub label: String,
}

#[async_trait]
impl Task for Sleep {
    const NAME: &'static str = "sleep";
    type Output = String;

    async fn run(
        &self,
        _env: &Environment,
        _cancel: CancellationToken,
    ) -> Result<String, TaskError> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(self.label.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub value: Value,
}

#[async_trait]
impl Task for Echo {
    const NAME: &'static str = "echo";
    type Output = Value;

    async fn run(
        &self,
        _env: &Environment,
        _cancel: CancellationToken,
    ) -> Result<Value, TaskError> {
        Ok(self.value.clone())
    }
}

/// Fail with `message`, caused by `cause` if given
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fail {
    pub message: String,
    pub cause: Option<String>,
}

#[async_trait]
impl Task for Fail {
    const NAME: &'static str = "fail";
    type Output = ();

    async fn run(&self, _env: &Environment, _cancel: CancellationToken) -> Result<(), TaskError> {
        let err = TaskError::exception("FixtureError", &self.message);
        Err(match &self.cause {
            Some(cause) => err.with_previous(TaskError::exception("FixtureCause", cause)),
            None => err,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Panic {
    pub message: String,
}

#[async_trait]
impl Task for Panic {
    const NAME: &'static str = "panic";
    type Output = ();

    async fn run(&self, _env: &Environment, _cancel: CancellationToken) -> Result<(), TaskError> {
        panic!("{}", self.message);
    }
}

/// Terminate the whole worker process with `code`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exit {
    pub code: i32,
}

#[async_trait]
impl Task for Exit {
    const NAME: &'static str = "exit";
    type Output = ();

    async fn run(&self, _env: &Environment, _cancel: CancellationToken) -> Result<(), TaskError> {
        std::process::exit(self.code);
    }
}

/// Store a value in the worker's environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remember {
    pub key: String,
    pub value: Value,
    pub ttl: Option<u64>,
}

#[async_trait]
impl Task for Remember {
    const NAME: &'static str = "remember";
    type Output = ();

    async fn run(&self, env: &Environment, _cancel: CancellationToken) -> Result<(), TaskError> {
        env.set(self.key.clone(), self.value.clone(), self.ttl)
            .map_err(|err| TaskError::from_error(workhive_errors::TaskFailureKind::Error, &err))
    }
}

/// Read a value from the worker's environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recall {
    pub key: String,
}

#[async_trait]
impl Task for Recall {
    const NAME: &'static str = "recall";
    type Output = Option<Value>;

    async fn run(
        &self,
        env: &Environment,
        _cancel: CancellationToken,
    ) -> Result<Option<Value>, TaskError> {
        Ok(env.get(&self.key))
    }
}

/// Block until cancelled. With `acknowledge` false the cancellation is
/// ignored and the task only ends after `linger_millis`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwaitCancel {
    pub acknowledge: bool,
    pub linger_millis: u64,
}

#[async_trait]
impl Task for AwaitCancel {
    const NAME: &'static str = "await_cancel";
    type Output = String;

    async fn run(
        &self,
        _env: &Environment,
        cancel: CancellationToken,
    ) -> Result<String, TaskError> {
        if self.acknowledge {
            cancel.cancelled().await;
            return Ok("cancelled".to_string());
        }
        tokio::time::sleep(Duration::from_millis(self.linger_millis)).await;
        Ok("lingered".to_string())
    }
}

/// Maps with non-string keys have no JSON form: a non-empty `keys` fails to
/// encode on the caller, and the result always fails to encode remotely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Unencodable {
    pub keys: BTreeMap<Vec<u8>, u8>,
}

#[async_trait]
impl Task for Unencodable {
    const NAME: &'static str = "unencodable";
    type Output = BTreeMap<Vec<u8>, u8>;

    async fn run(
        &self,
        _env: &Environment,
        _cancel: CancellationToken,
    ) -> Result<BTreeMap<Vec<u8>, u8>, TaskError> {
        Ok(BTreeMap::from([(vec![0], 0)]))
    }
}
