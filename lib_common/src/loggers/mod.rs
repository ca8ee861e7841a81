/// Process-wide `tracing` subscriber with console and rotating JSON file output.
pub mod loggerlocal;

pub use loggerlocal::{init_logging, LoggingOptions};
