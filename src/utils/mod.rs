//! Shared utility functions for timmy.
//!
//! Filesystem helpers used by the transfer operations and the CLI, plus
//! small value conversions.

pub mod fs;

pub use fs::{available_space, dir_structure, ensure_dir, filesystem_size};

use serde_json::Value;

/// Wraps a non-list value into a one-element list.
pub fn as_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}
