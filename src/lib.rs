//! timmy: bounded-concurrency remote execution.
//!
//! This library runs batches of independent operations (commands over ssh,
//! rsync/scp transfers) across many nodes with a hard concurrency cap,
//! per-command timeouts and a fail-fast abort on the first fault.

// Core modules
pub mod config;
pub mod error;
pub mod launcher;
pub mod lock;
pub mod remote;
pub mod scheduler;
pub mod utils;

// Front-end
pub mod cli;

// Re-export commonly used types
pub use config::Config;
pub use error::{
    ArgsError, BatchError, LaunchError, LockError, ResourceError, TimmyError, ABORT_EXIT_CODE,
    CREATE_DIR_EXIT_CODE, INTERRUPT_EXIT_CODE, NOOP_TRANSFER_EXIT_CODE, RESOURCE_EXIT_CODE,
};
pub use launcher::{launch, ExecutionResult};
pub use lock::{InstanceLock, LockGuard};
pub use remote::{RemoteCommand, Target};
pub use scheduler::{run_batch, run_batch_until, Args, BatchOptions, BatchOutput, Operation, WorkItem};
