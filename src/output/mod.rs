//! Output formatting module
//!
//! Renders the final per-file report and decides the exit code.

mod formatter;

pub use formatter::{FileStatus, Formatter, OutputFormat, ResultFormatter};
