//! Outcome of a launched command.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Captured output of one command.
///
/// A non-zero `exit_code` is not an error: callers branch on it, optionally
/// against a whitelist of acceptable codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Identity of the node the command ran against.
    pub target: String,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error with trailing newlines removed.
    pub stderr: String,
    /// Exit code, or `128 + signal` when the process was killed.
    pub exit_code: i32,
    /// Whether the launcher's timer fired.
    #[serde(default)]
    pub timed_out: bool,
    /// Wall-clock time spent.
    #[serde(default)]
    pub duration: Duration,
}

impl ExecutionResult {
    /// Creates a result with no output.
    pub fn new(target: impl Into<String>, exit_code: i32) -> Self {
        Self {
            target: target.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
            timed_out: false,
            duration: Duration::ZERO,
        }
    }

    /// Sets the captured stdout.
    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Sets the captured stderr.
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Sets the target identity.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Checks if the command exited with code 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Checks if the exit code is 0 or listed in `ok_codes`.
    pub fn is_acceptable(&self, ok_codes: &[i32]) -> bool {
        self.exit_code == 0 || ok_codes.contains(&self.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceptable_codes() {
        let result = ExecutionResult::new("node-1", 0);
        assert!(result.is_success());
        assert!(result.is_acceptable(&[]));

        let result = ExecutionResult::new("node-1", 2);
        assert!(!result.is_success());
        assert!(!result.is_acceptable(&[]));
        assert!(result.is_acceptable(&[1, 2]));
    }

    #[test]
    fn test_builder() {
        let result = ExecutionResult::new("", 1)
            .with_target("10.0.0.1")
            .with_stdout("out")
            .with_stderr("err");
        assert_eq!(result.target, "10.0.0.1");
        assert_eq!(result.stdout, "out");
        assert_eq!(result.stderr, "err");
        assert!(!result.timed_out);
    }
}
