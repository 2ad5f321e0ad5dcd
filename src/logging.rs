use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// `RUST_LOG` when set, else `level` scoped to this crate with warnings from dependencies.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)))
}

fn default_directive(level: &str) -> String {
    format!("warn,clause_rag={}", level.trim().to_ascii_lowercase())
}

/// Install the global subscriber, logging to stderr. Later calls are ignored.
pub fn init(config: &LoggingConfig) {
    let registry = tracing_subscriber::registry().with(env_filter(&config.level));
    let result = if config.json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}
