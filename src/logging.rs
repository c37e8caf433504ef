use tracing_subscriber::filter::ParseError;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LogConfig;

/// Install the global subscriber. `RUST_LOG` overrides `log.level`.
pub fn init(config: &LogConfig) -> Result<(), ParseError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.level)?,
    };

    let base = fmt::layer().with_target(true);
    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.json().with_current_span(false))
            .init();
    } else {
        tracing_subscriber::registry().with(env_filter).with(base).init();
    }
    Ok(())
}

fn parse_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    EnvFilter::try_new(directives)
}
