//! Bounded-concurrency batch execution.
//!
//! This module runs a batch of independent work items across short-lived
//! workers:
//!
//! - **WorkItem**: an operation, its argument mapping and an optional key
//! - **Worker**: one task per item, gated by a shared semaphore, reporting
//!   through its own oneshot channel
//! - **run_batch**: dispatch in submission order, collect results, abort
//!   everything on the first fault or on Ctrl-C
//! - **operations**: the built-in remote execution and transfer operations
//!
//! # Architecture
//!
//! ```text
//!    items ──► dispatcher ──acquire──► Semaphore(max_concurrency)
//!                  │                          │
//!                  │ spawn                    │ permit
//!                  ▼                          ▼
//!             ┌─────────┐  ┌─────────┐  ┌─────────┐
//!             │ Worker 0│  │ Worker 1│  │ Worker N│
//!             └────┬────┘  └────┬────┘  └────┬────┘
//!                  │ oneshot    │            │        fault flag (watch)
//!                  ▼            ▼            ▼        ──► dispatcher
//!             drain in submission order ──► BatchOutput
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use timmy::config::Config;
//! use timmy::scheduler::{node_items, run_batch, Args, ExecOperation};
//!
//! let config = Config::default();
//! let op = Arc::new(ExecOperation::from_config(&config));
//! let nodes = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
//! let items = node_items(op, &nodes, &Args::new().with("command", "uptime"));
//!
//! let results = run_batch(items, &config.batch_options().keyed()).await?;
//! ```

pub mod job;
pub mod operations;
pub mod worker_pool;

pub use job::{operation_fn, Args, FnOperation, ItemState, Operation, WorkItem, WorkerFault, WorkerOutcome};
pub use operations::{node_items, ExecOperation, GetOperation, PullOperation, PutOperation};
pub use worker_pool::{
    run_batch, run_batch_until, BatchOptions, BatchOutput, Collect, Worker, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_REAP_TIMEOUT,
};
