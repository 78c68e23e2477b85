use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use udig_link::{
    default_keypair_path, ensure_keypair, keep_dialing, parse_port_maps, EgressServer, Services,
    StatusUpdate, UplinkServer,
};

/// udig link - exposes a local TCP service through a udig broker
#[derive(Parser, Debug)]
#[command(name = "udiglink")]
#[command(about = "Expose a local TCP service through a udig broker")]
struct Cli {
    /// Broker uplink address (host:port)
    #[arg(long, default_value = "uplink.udig.io:4000")]
    addr: String,

    /// Port map remote_port:local_host:local_port (repeatable or comma separated)
    #[arg(short = 'R', required = true)]
    remote: Vec<String>,

    /// Key pair file, created on first use
    #[arg(long)]
    keypair: Option<PathBuf>,

    /// Delay between reconnection attempts in milliseconds
    #[arg(long, default_value_t = 1000)]
    backoff_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("udig_link=info".parse()?)
                .add_directive("udig_common=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let maps = parse_port_maps(&cli.remote).context("Invalid -R port map")?;

    let keypair_path = cli
        .keypair
        .clone()
        .or_else(default_keypair_path)
        .context("No config directory found. Use --keypair")?;
    let keys = ensure_keypair(&keypair_path)?;
    tracing::info!("Using key pair {}", keypair_path.display());
    tracing::info!("Tunnel ID: {}", keys.tunnel_id());
    tracing::info!("Forwarding to {}", maps.egress);

    let (uplink, mut updates) = UplinkServer::new(keys, maps.ports);
    let services = Services::new(Arc::new(uplink), Arc::new(EgressServer::new(maps.egress)));

    // Addresses go to stdout so scripts can pick them up
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            match update {
                StatusUpdate::Ingress(addresses) => {
                    for address in addresses {
                        println!("{}", address);
                    }
                }
                StatusUpdate::Rejected(error) => {
                    tracing::error!("Broker rejected the link: {}", error);
                }
            }
        }
    });

    let backoff = Duration::from_millis(cli.backoff_ms);
    tokio::select! {
        _ = keep_dialing(cli.addr, services, backoff) => {}
        _ = shutdown_signal() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
