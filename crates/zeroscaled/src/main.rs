//! zeroscaled: the zeroscale daemon.
//!
//! # Usage
//!
//! ```text
//! zeroscaled run --config zeroscale.toml --admin-port 9090
//! zeroscaled check --config zeroscale.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zeroscale_state::{ResourceScaler, format_duration};
use zeroscaled::{Daemon, FileBackend};

const DEFAULT_LOG_FILTER: &str = "info,zeroscaled=debug,zeroscale=debug";

#[derive(Parser)]
#[command(name = "zeroscaled", about = "zeroscale scale-to-zero daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the poller, autoscaler, DLX proxy and admin API.
    Run {
        /// Resource manifest with the `[scaler]` section.
        #[arg(long, default_value = "zeroscale.toml")]
        config: PathBuf,

        /// Port for the admin API.
        #[arg(long, default_value = "9090")]
        admin_port: u16,
    },
    /// Validate a manifest and print what it resolves to.
    Check {
        #[arg(long, default_value = "zeroscale.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config, admin_port } => run(config, admin_port).await,
        Command::Check { config } => check(config).await,
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(config: PathBuf, admin_port: u16) -> anyhow::Result<()> {
    info!(config = %config.display(), "zeroscaled starting");

    let backend = Arc::new(FileBackend::new(config));
    let daemon = Daemon::from_backend(backend).await?;

    let dlx_addr = daemon.config().dlx.listen_address;
    let dlx_listener = TcpListener::bind(dlx_addr)
        .await
        .with_context(|| format!("binding dlx listener on {dlx_addr}"))?;
    let admin_addr = SocketAddr::from(([0, 0, 0, 0], admin_port));
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("binding admin listener on {admin_addr}"))?;

    daemon
        .run(dlx_listener, Some(admin_listener), shutdown_signal())
        .await
}

async fn check(config: PathBuf) -> anyhow::Result<()> {
    let backend = FileBackend::new(&config);
    let scaler = backend
        .get_config()
        .await
        .with_context(|| format!("invalid scaler config in {}", config.display()))?;
    let resources = backend
        .get_resources()
        .await
        .with_context(|| format!("invalid resources in {}", config.display()))?;

    println!("namespace:        {}", scaler.autoscaler.namespace);
    println!(
        "scale interval:   {}",
        format_duration(scaler.autoscaler.scale_interval)
    );
    println!(
        "metric interval:  {}",
        format_duration(scaler.poller.metric_interval)
    );
    println!("dlx listen:       {}", scaler.dlx.listen_address);
    println!("resources:        {}", resources.len());
    for resource in &resources {
        println!("  {}", resource.name);
        if resource.scale_resources.is_empty() {
            println!("    (no rules, never scaled to zero)");
        }
        for rule in &resource.scale_resources {
            println!(
                "    {} over {} threshold {} ({:?})",
                rule.metric_name,
                format_duration(rule.window),
                rule.threshold,
                rule.reducer
            );
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
