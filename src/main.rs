use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use m3u_relay::{
    config::Config,
    observability::init_meter_provider,
    services::{build_http_client, build_relay_manager},
    web::{AppState, WebServer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "m3u-relay")]
#[command(version)]
#[command(about = "Shared upstream relay for live IPTV channels")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.log_level == "trace" {
        format!("m3u_relay={},tower_http=trace", cli.log_level)
    } else {
        format!("m3u_relay={}", cli.log_level)
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_filter.into());
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    info!("Starting M3U Relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        channels = config.channels.len(),
        relay_profiles = config.relay_profiles.len(),
        "Relay configuration validated"
    );

    let meter_provider = init_meter_provider();

    let client = build_http_client(&config)?;
    let relay_manager = build_relay_manager(&config, client);

    let shutdown = CancellationToken::new();
    let cleanup_task = relay_manager
        .codec_cache()
        .spawn_cleanup_task(config.probe.cleanup_interval, shutdown.clone());
    let status_task = relay_manager
        .spawn_status_report_task(config.relay.status_report_interval, shutdown.clone());

    let web_server = WebServer::new(
        &config.web.host,
        config.web.port,
        AppState::new(relay_manager.clone()),
    )?;
    info!(
        "Starting web server on {}:{}",
        web_server.host(),
        web_server.port()
    );

    let server_token = shutdown.clone();
    let server_handle =
        tokio::spawn(async move { web_server.serve_with_cancellation(server_token).await });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    let served = server_handle.await?;
    // a bind failure returns before any signal
    shutdown.cancel();

    let stopped = relay_manager.shutdown();
    info!(stopped, "Relay sessions stopped");
    let _ = tokio::join!(cleanup_task, status_task);
    if let Err(e) = meter_provider.shutdown() {
        tracing::warn!("Failed to shut down meter provider: {}", e);
    }

    served?;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down gracefully");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down gracefully");
    }
}
