//! Structured logging for equaforge processes.

pub mod logger;

pub use logger::{build_filter, init_logger, LOG_FILE_PREFIX};
