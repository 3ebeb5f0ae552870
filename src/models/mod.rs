//! Data models for distributed test runs
//!
//! This module contains the data structures shared by the dispatcher, the
//! agent and the workers.

mod assignment;
mod test_result;

pub use assignment::{StderrMode, TestAssignment};
pub use test_result::{Completion, DirectiveKind, ReportEntry, TestResult, Testline, DEFAULT_TAP_VERSION};
