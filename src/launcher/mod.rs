//! Shell command launching under a hard wall-clock timeout.
//!
//! Every command runs as the leader of its own process group so that a
//! timeout, an execution fault or a cancelled batch can signal the whole
//! group instead of only the immediate child.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use timmy::launcher::launch;
//!
//! let result = launch("uptime", Duration::from_secs(5), None, &[]).await?;
//! println!("{} (exit {})", result.stdout, result.exit_code);
//! ```

pub mod process;
pub mod reaper;
pub mod result;

pub use process::{launch, KILL_GRACE};
pub use reaper::{kill_descendants, kill_descendants_of, signal_group};
pub use result::ExecutionResult;
