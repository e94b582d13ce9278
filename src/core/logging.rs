use tracing_subscriber::{fmt, EnvFilter};

use super::config::LoggingConfig;
use super::errors::{DeployError, Result};

/// Install the global fmt subscriber. `RUST_LOG` wins over `config.level`.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| DeployError::config_field(e.to_string(), "logging.level"))?;

    fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(true)
        .try_init()
        .map_err(|e| DeployError::internal(format!("tracing subscriber: {e}")))
}
