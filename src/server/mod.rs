mod config;
mod daemon;
pub mod tcp;

pub use config::{CacheSection, LoggingSection, ServerConfig, ServerSection};
pub use daemon::Daemon;
pub use tcp::{serve, WriterCommand};
