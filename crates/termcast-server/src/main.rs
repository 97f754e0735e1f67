//! termcast-server entry point: CLI parsing, config resolution, and the
//! run-until-signal loop.

use clap::Parser;
use std::path::PathBuf;
use termcast_server::{Broker, BrokerConfig};
use tracing::{error, info};

/// termcast-server — terminal session broker
#[derive(Parser, Debug)]
#[command(name = "termcast-server", version, about = "Terminal session broker")]
struct Cli {
    /// HTTP port (the WebSocket listener binds port + 1)
    #[arg(short, long)]
    port: Option<u16>,

    /// Shell program spawned for new sessions
    #[arg(long)]
    shell: Option<String>,

    /// Argument passed to the shell (repeatable)
    #[arg(long = "shell-arg")]
    shell_args: Vec<String>,

    /// Working directory for new sessions
    #[arg(long)]
    cwd: Option<String>,

    /// Initial terminal columns
    #[arg(long)]
    cols: Option<u16>,

    /// Initial terminal rows
    #[arg(long)]
    rows: Option<u16>,

    /// Directory with the viewer front-end assets
    #[arg(long)]
    assets_dir: Option<String>,

    /// Seconds before an idle, viewerless session is collected (0 disables)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "~/.termcast/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting termcast-server"
    );

    // Load broker config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config = match BrokerConfig::load(
        Some(&config_path),
        cli.port,
        cli.shell.as_deref(),
        &cli.shell_args,
        cli.cwd.as_deref(),
        cli.cols,
        cli.rows,
        cli.assets_dir.as_deref(),
        cli.idle_timeout,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let broker = Broker::new(config);

    // Run until shutdown signal
    tokio::select! {
        result = broker.run() => {
            if let Err(e) = result {
                error!(error = %e, "broker error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("termcast-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
