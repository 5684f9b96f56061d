use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const FILTER_ENV: &str = "SAED_LOG";
pub const FORMAT_ENV: &str = "SAED_LOG_FORMAT";

/// Logs go to stderr; stdout carries the request protocol.
pub fn init() -> Result<()> {
    let filter = std::env::var(FILTER_ENV).unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::try_new(&filter)
        .with_context(|| format!("failed to parse {} '{}'", FILTER_ENV, filter))?;
    let json = std::env::var(FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(false)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .context("failed to initialize tracing subscriber")?;
    tracing::debug!(filter = %filter, json, "logging initialized");
    Ok(())
}
