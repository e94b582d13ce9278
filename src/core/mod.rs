// Shared infrastructure used by every layer of the engine

pub mod config;
pub mod errors;
pub mod logging;

pub use config::{CheckItem, EngineConfig, EngineConfigBuilder, LoggingConfig, NodeRequirements, Protocol};
pub use errors::{DeployError, ErrorDetail, Result};
