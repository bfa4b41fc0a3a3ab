//! Configuration module

mod builder;
mod types;

pub use builder::OrchestratorConfigBuilder;
pub use types::OrchestratorConfig;
