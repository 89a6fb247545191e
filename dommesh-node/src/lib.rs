//! Library side of the dommesh node daemon: CLI, configuration, backend
//! construction and the domain registry.

pub mod backend;
pub mod cli;
pub mod config;
pub mod registry;

pub use backend::seed_mock_cluster;
pub use cli::Args;
pub use config::{Config, ConfigError};
pub use registry::{DomainRegistry, LogSink, PassSummary};
