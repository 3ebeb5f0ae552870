//! Shared helpers: logging, timing, retry and word splitting

pub mod logger;
pub mod retry;
pub mod shell;
pub mod timer;

pub use retry::RetryPolicy;
pub use timer::Timer;
