//! Test execution engine
//!
//! Worker lanes, the plugin chain wrapped around them, and the runner that
//! executes a single test program.

mod plugin;
mod runner;
mod worker;

pub use plugin::{Action, Plugin, PluginChain, PluginError, PluginRegistry, PluginSpec};
pub use runner::TestRunner;
pub use worker::{shared_queue, TestOutcome, Worker, WorkerPool};
