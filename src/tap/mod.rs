//! Line-protocol (TAP) support
//!
//! Turns the text stream emitted by a test program into a [`TestResult`].
//!
//! [`TestResult`]: crate::models::TestResult

mod parser;

pub use parser::{ParseError, Parser};
