//! Shared utilities: logging setup and timing

pub mod logger;
pub mod timer;

pub use logger::{init_logger, LogLevel, UnknownLogLevel};
pub use timer::{Stopwatch, Timer};
