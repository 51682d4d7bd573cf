//! Error types and process exit codes for timmy.
//!
//! Each subsystem has its own error enum:
//! - Command launching (spawn failures only; non-zero exits are data)
//! - Single-instance locking
//! - Resource acquisition (directories, config, directory trees)
//! - Batch scheduling (fatal aborts and interrupts)
//! - Work item argument decoding
//!
//! [`TimmyError`] aggregates them for the binary and maps each to the exit
//! status the process terminates with.

use std::path::PathBuf;

use thiserror::Error;

/// Batch aborted because a worker forwarded a fault.
pub const ABORT_EXIT_CODE: i32 = 42;

/// An empty transfer file list was short-circuited without running the tool.
pub const NOOP_TRANSFER_EXIT_CODE: i32 = 127;

/// A required directory could not be created.
pub const CREATE_DIR_EXIT_CODE: i32 = 3;

/// Configuration, directory tree or lock file could not be obtained.
pub const RESOURCE_EXIT_CODE: i32 = 1;

/// Operator interrupt (128 + SIGINT).
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// Errors raised while launching a shell command.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Child process for '{0}' has no pid")]
    MissingPid(String),
}

/// Errors raised by the single-instance lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to lock {path}: {source}")]
    Flock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid operation name for lock: '{0}'")]
    InvalidName(String),
}

/// Errors raised while acquiring process-level resources.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Can't create a directory: {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create list of the directory: {path}: {message}")]
    DirTree { path: PathBuf, message: String },

    #[error("load_conf: I/O error: file: {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("load_conf: Could not parse {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResourceError {
    /// Exit status the process terminates with for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ResourceError::CreateDir { .. } => CREATE_DIR_EXIT_CODE,
            _ => RESOURCE_EXIT_CODE,
        }
    }
}

/// Errors decoding a work item's argument mapping.
#[derive(Debug, Error)]
pub enum ArgsError {
    #[error("Missing required argument '{0}'")]
    Missing(String),

    #[error("Argument '{name}' has the wrong type: expected {expected}")]
    WrongType { name: String, expected: &'static str },
}

/// Errors that end a batch early.
#[derive(Debug, Error)]
pub enum BatchError {
    /// A worker forwarded a fault; the rest of the batch was cancelled.
    #[error("Batch aborted: item {index} ({operation}) failed: {message}")]
    Aborted {
        index: usize,
        key: Option<String>,
        operation: String,
        message: String,
        exit_code: i32,
    },

    /// The batch was interrupted by the operator.
    #[error("Batch interrupted")]
    Interrupted,

    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("max_concurrency {requested} exceeds the limit of {limit}")]
    ConcurrencyTooHigh { requested: usize, limit: usize },

    #[error("Item {0} has no key but keyed results were requested")]
    MissingKey(usize),

    #[error("Duplicate result key '{0}'")]
    DuplicateKey(String),
}

impl BatchError {
    /// Exit status the process terminates with for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BatchError::Aborted { exit_code, .. } => *exit_code,
            BatchError::Interrupted => INTERRUPT_EXIT_CODE,
            _ => RESOURCE_EXIT_CODE,
        }
    }
}

/// Top-level error for the `timmy` binary.
#[derive(Debug, Error)]
pub enum TimmyError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TimmyError {
    /// Exit status the process terminates with for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            TimmyError::Resource(e) => e.exit_code(),
            TimmyError::Batch(e) => e.exit_code(),
            _ => RESOURCE_EXIT_CODE,
        }
    }
}
