use hellogate::config::Config;
use hellogate::forward::ForwarderConfig;
use hellogate::proxy::ProxyServer;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hellogate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; defaults apply when no file is given
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hellogate.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting reverse proxy"
    );
    info!(
        bind = %config.proxy.bind,
        port = config.proxy.port,
        upstream_host = %config.upstream.host,
        upstream_port = config.upstream.port,
        request_timeout_secs = config.proxy.request_timeout_secs,
        client_idle_timeout_secs = config.proxy.client_idle_timeout_secs,
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        "Proxy configuration"
    );

    let bind_addr = config.proxy.bind_addr()?;
    let upstream_addr = config.upstream.addr()?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let forwarder_config = ForwarderConfig {
        max_idle_per_host: config.proxy.pool_max_idle_per_host,
        idle_timeout: config.proxy.pool_idle_timeout(),
    };

    let proxy = ProxyServer::with_forwarder_config(
        bind_addr,
        upstream_addr,
        config.proxy.request_timeout(),
        shutdown_rx,
        forwarder_config,
    )
    .with_client_idle_timeout(config.proxy.client_idle_timeout());

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    wait_for_shutdown_signal().await;

    // Signal shutdown and wait for the server to drain out of its accept loop
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}
