//! SMTP check server binary

use anyhow::Context;
use smtp_check_server::{Config, SmtpCheckServer, setup_tracing_with_otel};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional explicit config path, otherwise the standard search paths
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);

    // Load configuration first (needed for logging and telemetry settings)
    let config = Config::load_from(config_path.as_deref()).with_context(|| match &config_path {
        Some(path) => format!("failed to load configuration from {}", path.display()),
        None => "failed to load configuration".to_string(),
    })?;

    let _telemetry_guard = setup_tracing_with_otel(&config.telemetry, &config.logging)
        .context("failed to initialize tracing")?;

    tracing::info!(checks = config.checks.len(), "SMTP check server starting");

    SmtpCheckServer::new(config, config_path)
        .run()
        .await
        .context("server failed")?;

    // Telemetry guard will flush spans on drop

    Ok(())
}
