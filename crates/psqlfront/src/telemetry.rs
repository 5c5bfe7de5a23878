//! Logging setup
//!
//! tracing subscriber with an env filter; log level comes from the CLI
//! (`RUST_LOG` wins when set), optional JSON output via `JSON_LOGS`.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the tracing subscriber.
pub fn init(log_level: &str) -> Result<()> {
    // "notice" is an original log level of the PostgreSQL world; tracing
    // has no counterpart, treat it as info
    let level = match log_level.to_lowercase().as_str() {
        "notice" => "info".to_string(),
        other => other.to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let json_logs = std::env::var("JSON_LOGS")
        .map(|v| v == "true")
        .unwrap_or(false);

    let subscriber = tracing_subscriber::registry().with(filter);
    if json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}
