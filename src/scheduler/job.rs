//! Work item definitions for the batch scheduler.
//!
//! This module defines the types a batch is made of:
//!
//! - `Operation`: what a worker runs, resolvable from its arguments alone
//! - `Args`: the argument mapping handed to an operation
//! - `WorkItem`: an operation plus its arguments and optional result key
//! - `WorkerFault`: a failed operation, carried back to the scheduler as data
//! - `ItemState`: the per-item lifecycle traced by the scheduler

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ArgsError;
use crate::utils::as_list;

/// A unit of work a worker can execute.
///
/// Implementations must not depend on state captured from the submitting
/// context beyond what they own; everything item-specific comes in through
/// [`Args`].
#[async_trait]
pub trait Operation: Send + Sync {
    /// Value produced on success.
    type Output: Send + 'static;

    /// Name used in logs and fault reports.
    fn name(&self) -> &str;

    /// Runs the operation. An `Err` is a fault that aborts the whole batch.
    async fn call(&self, args: &Args) -> anyhow::Result<Self::Output>;
}

/// Operation backed by an async closure.
pub struct FnOperation<F, T> {
    name: String,
    f: F,
    _output: PhantomData<fn() -> T>,
}

#[async_trait]
impl<F, Fut, T> Operation for FnOperation<F, T>
where
    F: Fn(Args) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send,
    T: Send + 'static,
{
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: &Args) -> anyhow::Result<T> {
        (self.f)(args.clone()).await
    }
}

/// Wraps an async closure as a shareable operation.
pub fn operation_fn<F, Fut, T>(name: impl Into<String>, f: F) -> Arc<dyn Operation<Output = T>>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    Arc::new(FnOperation {
        name: name.into(),
        f,
        _output: PhantomData,
    })
}

/// Argument mapping of a work item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(Map<String, Value>);

impl Args {
    /// Creates an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an argument.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Sets an argument in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Raw access to an argument. `null` counts as absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    /// Whether an argument is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// A required string argument.
    pub fn str(&self, name: &str) -> Result<&str, ArgsError> {
        self.opt_str(name)?
            .ok_or_else(|| ArgsError::Missing(name.to_string()))
    }

    /// An optional string argument.
    pub fn opt_str(&self, name: &str) -> Result<Option<&str>, ArgsError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(name, "string")),
        }
    }

    /// An optional boolean argument.
    pub fn opt_bool(&self, name: &str) -> Result<Option<bool>, ArgsError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(wrong_type(name, "boolean")),
        }
    }

    /// An optional timeout given in (possibly fractional) seconds.
    pub fn opt_seconds(&self, name: &str) -> Result<Option<Duration>, ArgsError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value
                .as_f64()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .map(Some)
                .ok_or_else(|| wrong_type(name, "non-negative number of seconds")),
        }
    }

    /// A list of strings. A single string is treated as a one-element list
    /// and an absent argument as an empty one.
    pub fn string_list(&self, name: &str) -> Result<Vec<String>, ArgsError> {
        let Some(value) = self.get(name) else {
            return Ok(Vec::new());
        };
        as_list(value.clone())
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(wrong_type(name, "string or list of strings")),
            })
            .collect()
    }

    /// A list of integer exit codes.
    pub fn code_list(&self, name: &str) -> Result<Vec<i32>, ArgsError> {
        let Some(value) = self.get(name) else {
            return Ok(Vec::new());
        };
        as_list(value.clone())
            .into_iter()
            .map(|item| {
                item.as_i64()
                    .and_then(|code| i32::try_from(code).ok())
                    .ok_or_else(|| wrong_type(name, "integer or list of integers"))
            })
            .collect()
    }
}

fn wrong_type(name: &str, expected: &'static str) -> ArgsError {
    ArgsError::WrongType {
        name: name.to_string(),
        expected,
    }
}

impl From<Map<String, Value>> for Args {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// One independent unit of batch work.
pub struct WorkItem<T> {
    /// What to run.
    pub operation: Arc<dyn Operation<Output = T>>,
    /// Arguments for the operation.
    pub args: Args,
    /// Key of the result in keyed collection mode.
    pub key: Option<String>,
}

impl<T> WorkItem<T> {
    /// Creates an unkeyed work item.
    pub fn new(operation: Arc<dyn Operation<Output = T>>, args: Args) -> Self {
        Self {
            operation,
            args,
            key: None,
        }
    }

    /// Sets the result key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl<T: Send + 'static> fmt::Debug for WorkItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("operation", &self.operation.name())
            .field("args", &self.args)
            .field("key", &self.key)
            .finish()
    }
}

/// A failure inside a worker, forwarded to the scheduler as plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFault {
    /// Name of the operation that failed.
    pub operation: String,
    /// Rendered error chain or panic message.
    pub message: String,
}

impl WorkerFault {
    /// Creates a fault report.
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

/// What travels over a worker's result channel.
pub type WorkerOutcome<T> = Result<T, WorkerFault>;

/// Lifecycle of a work item inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    /// Submitted, waiting for a concurrency slot.
    Pending,
    /// Holding a slot, worker not yet running.
    Acquired,
    /// Operation in progress.
    Running,
    /// Operation returned a value.
    Completed,
    /// Operation failed or panicked.
    Failed,
    /// Result read by the scheduler.
    Collected,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Pending => write!(f, "pending"),
            ItemState::Acquired => write!(f, "acquired"),
            ItemState::Running => write!(f, "running"),
            ItemState::Completed => write!(f, "completed"),
            ItemState::Failed => write!(f, "failed"),
            ItemState::Collected => write!(f, "collected"),
        }
    }
}
