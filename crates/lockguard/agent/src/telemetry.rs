//! Tracing subscriber setup for the embedding process

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{AgentError, Result};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `config.filter`. Fails if a global subscriber is
/// already installed or the filter does not parse.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| AgentError::Telemetry(format!("invalid filter '{}': {}", config.filter, e)))?,
    };

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.json {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        subscriber
            .with(fmt_layer)
            .try_init()
            .map_err(|e| AgentError::Telemetry(e.to_string()))
    } else {
        let fmt_layer = fmt::layer().with_target(true);
        subscriber
            .with(fmt_layer)
            .try_init()
            .map_err(|e| AgentError::Telemetry(e.to_string()))
    }
}
