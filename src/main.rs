//! # relay
//!
//! Command-line entry point: run the stream server, follow a stream, or
//! publish a single event.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use relay_client::{ClientState, StreamClient, StreamClientConfig};
use relay_core::{Event, EventBus};
use relay_server::{PublishResponse, RelayServer, ServerConfig};
use relay_settings::{LoggingSettings, RelaySettings};
use relay_telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
use secrecy::SecretString;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "relay", about = "Real-time update relay", version)]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Per-module log level, e.g. `--log relay_client=debug`. Repeatable;
    /// wins over `logging.modules` in the settings file.
    #[arg(long = "log", global = true, value_parser = parse_module_level)]
    log: Vec<(String, Level)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the stream server until Ctrl-C.
    Serve {
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Follow a stream and print each event as a JSON line.
    Listen {
        /// Stream endpoint, e.g. `http://127.0.0.1:8787/api/events`.
        url: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
    /// Publish one event through the server's publish route.
    Publish {
        url: Option<String>,
        /// Event type, e.g. `task_created`.
        #[arg(long = "type")]
        event_type: String,
        /// JSON object payload.
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        token: Option<String>,
    },
}

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = init_telemetry(bootstrap_telemetry(&cli.log));
    let settings = load_settings(cli.settings.as_deref())?;
    apply_logging(&telemetry, &settings.logging, &cli.log);

    match cli.command {
        Command::Serve { host, port } => serve(&settings, host, port).await,
        Command::Listen { url, token } => listen(&settings, url, token).await,
        Command::Publish {
            url,
            event_type,
            payload,
            token,
        } => publish(&settings, url, event_type, &payload, token).await,
    }
}

/// Logging before settings are read: environment and command line only.
fn bootstrap_telemetry(cli_modules: &[(String, Level)]) -> TelemetryConfig {
    let level = std::env::var("RELAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let json = std::env::var("RELAY_LOG_JSON")
        .ok()
        .and_then(|v| relay_settings::loader::parse_bool(&v))
        .unwrap_or(false);
    cli_modules
        .iter()
        .fold(TelemetryConfig::from_level_str(&level, json), |config, (module, level)| {
            config.with_module_level(module.clone(), *level)
        })
}

/// Bring the running subscriber in line with the loaded settings.
fn apply_logging(telemetry: &TelemetryGuard, logging: &LoggingSettings, cli_modules: &[(String, Level)]) {
    telemetry.set_json(logging.json);
    if telemetry.env_filter_active() {
        tracing::debug!("RUST_LOG is set, ignoring configured log levels");
        return;
    }
    match Level::from_str(logging.level.trim()) {
        Ok(level) => telemetry.set_level(level),
        Err(_) => tracing::warn!(level = %logging.level, "unknown log level, keeping current"),
    }
    for (module, level) in &logging.modules {
        if cli_modules.iter().any(|(m, _)| m == module) {
            continue;
        }
        match Level::from_str(level.trim()) {
            Ok(level) => telemetry.set_module_level(module, level),
            Err(_) => tracing::warn!(module, level, "unknown module log level, ignoring"),
        }
    }
}

fn parse_module_level(arg: &str) -> std::result::Result<(String, Level), String> {
    let (module, level) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected MODULE=LEVEL, got `{arg}`"))?;
    let level = Level::from_str(level.trim()).map_err(|e| e.to_string())?;
    Ok((module.trim().to_string(), level))
}

fn load_settings(path: Option<&std::path::Path>) -> Result<RelaySettings> {
    let settings = match path {
        Some(path) => relay_settings::load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => relay_settings::load_settings().context("failed to load settings")?,
    };
    if relay_settings::init_settings(settings.clone()).is_err() {
        tracing::debug!("global settings already initialized");
    }
    Ok(settings)
}

async fn serve(settings: &RelaySettings, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = ServerConfig::from(&settings.server);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let mut server = RelayServer::new(config, EventBus::new());
    match relay_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "metrics disabled"),
    }

    let handle = server.start().await.context("failed to start relay server")?;
    tracing::info!(addr = %handle.local_addr(), "relay server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    let report = handle.shutdown(Some(SHUTDOWN_TIMEOUT)).await;
    if report.timed_out {
        tracing::warn!(streams_closed = report.streams_closed, "listener did not stop cleanly");
    }
    Ok(())
}

async fn listen(settings: &RelaySettings, url: Option<String>, token: Option<String>) -> Result<()> {
    let mut config = StreamClientConfig::from(&settings.client);
    if let Some(url) = url {
        config.url = url;
    }
    if let Some(token) = token {
        config.token = Some(SecretString::from(token));
    }

    let client = StreamClient::builder(config)
        .on_message(|event: &Event| match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to print event"),
        })
        .on_open(|| tracing::info!("listening"))
        .connect()
        .context("failed to create stream client")?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            client.close();
            Ok(())
        }
        state = client.finished() => match state {
            ClientState::Exhausted => bail!("gave up reconnecting to {}", client.url()),
            _ => Ok(()),
        },
    }
}

async fn publish(
    settings: &RelaySettings,
    url: Option<String>,
    event_type: String,
    payload: &str,
    token: Option<String>,
) -> Result<()> {
    let url = url.unwrap_or_else(|| settings.client.url.clone());
    let token = token.or_else(|| settings.client.token.clone());

    let payload: serde_json::Value =
        serde_json::from_str(payload).context("payload is not valid JSON")?;
    let Some(event) = Event::from_value(event_type, payload) else {
        bail!("payload must be a JSON object");
    };

    let mut request = reqwest::Client::new().post(&url).json(&event);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("publish rejected with HTTP {status}: {body}");
    }

    let published: PublishResponse = response
        .json()
        .await
        .context("unexpected publish response")?;
    println!("delivered to {} subscriber(s)", published.delivered);
    Ok(())
}
