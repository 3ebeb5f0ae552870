//! Test result models for line-protocol test files
//!
//! Defines the parsed form of a result stream and the per-file completion state
//! tracked by the dispatcher.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version assumed when a stream carries no version header
pub const DEFAULT_TAP_VERSION: u32 = 12;

/// Directive attached to a single test line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveKind {
    Skip,
    Todo,
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectiveKind::Skip => write!(f, "SKIP"),
            DirectiveKind::Todo => write!(f, "TODO"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub kind: DirectiveKind,
    #[serde(default)]
    pub explanation: String,
}

/// One `ok` / `not ok` line of a result stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Testline {
    pub ok: bool,
    pub num: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<Directive>,
    #[serde(default)]
    pub diagnostic: String,
}

impl Testline {
    pub fn new(ok: bool, num: u32, description: impl Into<String>) -> Self {
        Self {
            ok,
            num,
            description: description.into(),
            directive: None,
            diagnostic: String::new(),
        }
    }

    pub fn with_directive(mut self, kind: DirectiveKind, explanation: impl Into<String>) -> Self {
        self.directive = Some(Directive {
            kind,
            explanation: explanation.into(),
        });
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = diagnostic.into();
        self
    }

    /// Whether this line counts as passing for its suite.
    ///
    /// TODO and SKIP lines never fail a suite, whatever their status.
    pub fn is_passing(&self) -> bool {
        self.ok || self.directive.is_some()
    }
}

impl fmt::Display for Testline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.ok {
            write!(f, "not ")?;
        }
        write!(f, "ok {}", self.num)?;
        if !self.description.is_empty() {
            write!(f, " - {}", self.description)?;
        }
        if let Some(directive) = &self.directive {
            write!(f, " # {}", directive.kind)?;
            if !directive.explanation.is_empty() {
                write!(f, " {}", directive.explanation)?;
            }
        }
        Ok(())
    }
}

/// Parsed result of one test file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub ok: bool,
    pub tests: Vec<Testline>,
    pub plan: u32,
    pub version: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

impl TestResult {
    /// Result standing in for a file that produced no usable stream.
    ///
    /// Carries exactly one failing line whose diagnostic is the cause.
    pub fn error(diagnostic: impl fmt::Display) -> Self {
        Self {
            ok: false,
            tests: vec![Testline::new(false, 1, "unexpected error").with_diagnostic(diagnostic.to_string())],
            plan: 1,
            version: DEFAULT_TAP_VERSION,
            duration_ms: 0,
        }
    }

    /// Append a synthetic failing line and mark the suite failed
    pub fn fail_with(&mut self, description: impl Into<String>, diagnostic: impl Into<String>) {
        let num = self.tests.len() as u32 + 1;
        self.tests
            .push(Testline::new(false, num, description).with_diagnostic(diagnostic));
        self.ok = false;
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn passed(&self) -> usize {
        self.tests.iter().filter(|t| t.is_passing()).count()
    }

    pub fn failed(&self) -> usize {
        self.tests.len() - self.passed()
    }

    pub fn failures(&self) -> impl Iterator<Item = &Testline> {
        self.tests.iter().filter(|t| !t.is_passing())
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} [{}ms]",
            if self.ok { "ok" } else { "FAILED" },
            self.passed(),
            self.tests.len(),
            self.duration_ms
        )
    }
}

/// State of one discovered file in the completion map
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    Pending,
    Completed(TestResult),
}

impl Completion {
    pub fn is_pending(&self) -> bool {
        matches!(self, Completion::Pending)
    }

    pub fn result(&self) -> Option<&TestResult> {
        match self {
            Completion::Pending => None,
            Completion::Completed(result) => Some(result),
        }
    }

    /// Pending entries count as failures for the verdict
    pub fn is_ok(&self) -> bool {
        self.result().map(|r| r.ok).unwrap_or(false)
    }
}

/// Snapshot of one file handed to a formatter
#[derive(Clone, Debug)]
pub struct ReportEntry {
    pub path: String,
    pub state: Completion,
}

impl ReportEntry {
    pub fn new(path: impl Into<String>, state: Completion) -> Self {
        Self {
            path: path.into(),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_result() {
        let result = TestResult::error("No such file or directory");
        assert!(!result.ok);
        assert_eq!(result.tests.len(), 1);
        assert_eq!(result.tests[0].diagnostic, "No such file or directory");
        assert_eq!(result.plan, 1);
    }

    #[test]
    fn test_fail_with_appends_line() {
        let mut result = TestResult {
            ok: true,
            tests: vec![Testline::new(true, 1, "first")],
            plan: 1,
            version: 13,
            duration_ms: 0,
        };
        result.fail_with("Test died with return code 3", "");
        assert!(!result.ok);
        assert_eq!(result.tests.len(), 2);
        assert_eq!(result.tests[1].num, 2);
        assert_eq!(result.failed(), 1);
    }

    #[test]
    fn test_todo_line_passes() {
        let line = Testline::new(false, 1, "later").with_directive(DirectiveKind::Todo, "not yet");
        assert!(line.is_passing());
        assert_eq!(line.to_string(), "not ok 1 - later # TODO not yet");
    }

    #[test]
    fn test_pending_is_not_ok() {
        assert!(!Completion::Pending.is_ok());
        assert!(Completion::Pending.result().is_none());
    }

    #[test]
    fn test_result_json_shape() {
        let result = TestResult::error("boom");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["tests"][0]["diagnostic"], "boom");

        let back: TestResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
