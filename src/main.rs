//! # chatrelay
//!
//! Relay server binary: loads settings, starts the WebSocket/SockJS
//! listener and waits for ctrl-c.

#![deny(unsafe_code)]

mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chatrelay_server::metrics::install_recorder;
use chatrelay_server::{RelayServer, RouteTable, ServerConfig};
use chatrelay_settings::RelaySettings;
use clap::Parser;

/// STOMP-over-WebSocket chat relay.
#[derive(Parser, Debug)]
#[command(name = "chatrelay", version, about = "STOMP-over-WebSocket chat relay")]
struct Cli {
    /// Settings file (defaults to `$CHATRELAY_CONFIG` or `./chatrelay.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Processing delay before chat handlers run, in milliseconds.
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Log filter directive (overrides settings; `RUST_LOG` wins over both).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<RelaySettings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(chatrelay_settings::settings_path);
        let mut settings = chatrelay_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        self.apply(&mut settings);
        settings
            .validate()
            .context("Invalid command-line override")?;
        Ok(settings)
    }

    /// Command-line flags win over the settings file and environment.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(delay) = self.delay_ms {
            settings.broker.processing_delay_ms = delay;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;

    logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let config = ServerConfig::from(&settings);
    let mut server =
        RelayServer::new(config, RouteTable::chat()).context("Failed to build relay")?;
    match install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(err) => tracing::warn!(error = %err, "metrics recorder unavailable"),
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        "chatrelay listening on ws://{addr}{} ({} routes)",
        server.config().endpoint,
        server.relay().routes().paths().len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(server.relay(), vec![handle], None)
        .await;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_overrides() {
        let cli = Cli::try_parse_from([
            "chatrelay",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--delay-ms",
            "0",
            "--json-logs",
        ])
        .unwrap();
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.delay_ms, Some(0));
        assert!(cli.json_logs);
        assert!(cli.config.is_none());
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::try_parse_from(["chatrelay", "--port", "1234", "--log-level", "debug"])
            .unwrap();
        let mut settings = RelaySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 1234);
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.broker.processing_delay_ms, 100);
        assert!(!settings.logging.json);
    }

    #[test]
    fn settings_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatrelay.json");
        std::fs::write(
            &path,
            r#"{"server":{"port":7000},"broker":{"processingDelayMs":250}}"#,
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "chatrelay",
            "--config",
            path.to_str().unwrap(),
            "--delay-ms",
            "5",
        ])
        .unwrap();
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.server.port, 7000);
        assert_eq!(settings.broker.processing_delay_ms, 5);
    }

    #[test]
    fn invalid_flag_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatrelay.json");
        let config = path.to_str().unwrap();

        let cli =
            Cli::try_parse_from(["chatrelay", "--config", config, "--delay-ms", "600000"]).unwrap();
        assert!(cli.load_settings().is_err());

        let cli = Cli::try_parse_from(["chatrelay", "--config", config, "--host", ""]).unwrap();
        assert!(cli.load_settings().is_err());

        let cli = Cli::try_parse_from(["chatrelay", "--config", config, "--delay-ms", "0"]).unwrap();
        assert_eq!(cli.load_settings().unwrap().broker.processing_delay_ms, 0);
    }

    #[test]
    fn invalid_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatrelay.json");
        std::fs::write(&path, "{not json").unwrap();
        let cli = Cli::try_parse_from(["chatrelay", "--config", path.to_str().unwrap()]).unwrap();
        assert!(cli.load_settings().is_err());
    }

    #[tokio::test]
    async fn server_graceful_shutdown() {
        let config = ServerConfig::default();
        let server = RelayServer::new(config, RouteTable::chat()).unwrap();
        let (addr, handle) = server.listen().await.unwrap();

        let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert!(resp.status().is_success());

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            server
                .shutdown()
                .graceful_shutdown(server.relay(), vec![handle], None),
        )
        .await
        .expect("shutdown timed out");
        assert!(server.shutdown().is_shutting_down());
    }
}
