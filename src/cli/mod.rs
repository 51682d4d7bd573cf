//! Command-line interface for timmy.
//!
//! Provides the `exec`, `pull`, `get`, `put` and `tree` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
