//! Test assignment model
//!
//! One pulled path plus everything needed to execute it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a child process's stderr goes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Copy to the agent's own stderr
    #[default]
    Mirror,
    /// Interleave into the captured result stream
    Merge,
    /// Discard
    Quiet,
}

impl StderrMode {
    pub fn from_flags(merge: bool, quiet: bool) -> Self {
        if merge {
            StderrMode::Merge
        } else if quiet {
            StderrMode::Quiet
        } else {
            StderrMode::Mirror
        }
    }
}

impl fmt::Display for StderrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StderrMode::Mirror => write!(f, "mirror"),
            StderrMode::Merge => write!(f, "merge"),
            StderrMode::Quiet => write!(f, "quiet"),
        }
    }
}

/// A test file handed to a worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestAssignment {
    pub path: String,
    /// Command template; the path is appended as the last argument
    pub exec: String,
    pub env: Vec<(String, String)>,
    pub stderr: StderrMode,
}

impl TestAssignment {
    pub fn new(path: impl Into<String>, exec: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            exec: exec.into(),
            env: Vec::new(),
            stderr: StderrMode::default(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_mode_from_flags() {
        assert_eq!(StderrMode::from_flags(false, false), StderrMode::Mirror);
        assert_eq!(StderrMode::from_flags(true, true), StderrMode::Merge);
        assert_eq!(StderrMode::from_flags(false, true), StderrMode::Quiet);
    }

    #[test]
    fn test_assignment_builder() {
        let assignment = TestAssignment::new("t/01.t", "perl -Ilib")
            .with_env(vec![("A".to_string(), "1".to_string())])
            .with_stderr(StderrMode::Merge);

        assert_eq!(assignment.path, "t/01.t");
        assert_eq!(assignment.env.len(), 1);
        assert_eq!(assignment.stderr, StderrMode::Merge);
    }
}
