use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

use udig_broker::{BrokerConfig, DebugPlane, IngressPlane, Registrar, RouteTable, UplinkPlane};

/// udig broker - exposes links to the internet by tunnel name
#[derive(Parser, Debug)]
#[command(name = "udigd")]
#[command(about = "Reverse tunnel broker routing TLS connections by SNI")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "udigd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("udig_broker=info".parse()?)
                .add_directive("udig_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting udigd with config: {}", args.config.display());

    let config = BrokerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    tracing::info!("Domain: {}", config.domain);
    tracing::info!("Enabled ports: {:?}", config.ports);

    let tls_config = udig_common::load_server_config(&config.cert, &config.key)
        .context("Failed to load TLS configuration")?;
    let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let router = RouteTable::new();
    let registrar = Registrar::new(router.clone(), config.domain.clone(), config.ports.clone());

    let mut planes = JoinSet::new();

    // Bind everything up front so a busy port fails startup
    let ingress = IngressPlane::new(router.clone(), tls_acceptor);
    for addr in config.ingress_addrs() {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind ingress listener on {}", addr))?;
        planes.spawn(ingress.clone().run_with_listener(listener));
    }

    let uplink_listener = TcpListener::bind(config.uplink_addr)
        .await
        .with_context(|| format!("Failed to bind uplink listener on {}", config.uplink_addr))?;
    planes.spawn(UplinkPlane::new(registrar).run_with_listener(uplink_listener));

    if let Some(http_addr) = config.http_addr {
        let debug_listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("Failed to bind debug HTTP listener on {}", http_addr))?;
        planes.spawn(DebugPlane::new(router.clone()).run_with_listener(debug_listener));
    }

    tokio::select! {
        Some(result) = planes.join_next() => {
            tracing::error!("Listener stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    planes.shutdown().await;
    tracing::info!("Broker shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
