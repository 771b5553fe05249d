use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::{signal, time};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use userhub::storage::{unix_now, MemoryStorage, TokenStore};
use userhub::server::config::DEFAULT_CONFIG_PATH;
use userhub::{App, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "userhub-server")]
#[command(about = "Authentication, user directory and follow graph gRPC server", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "USERHUB_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Host to bind to, overriding the configuration
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Log every request and response
    #[arg(long)]
    request_logging: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match ServerConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), "failed to load configuration: {e}");
            return Err(e.into());
        }
    };

    if let Some(host) = args.host {
        config.grpc.host = host;
    }
    if let Some(port) = args.port {
        config.grpc.port = port;
    }
    config.grpc.request_logging |= args.request_logging;

    if let Err(e) = config.validate() {
        error!("configuration validation failed: {e}");
        return Err(e.into());
    }

    if config.metrics.enabled {
        let metrics_addr = config.metrics.addr()?;
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
        {
            Ok(()) => info!(address = %metrics_addr, "metrics server started"),
            Err(e) => error!("failed to start metrics server: {e}"),
        }
    }

    let app = App::new(&config).await?;
    spawn_token_cleanup(app.storage());

    let server = app.server();
    let mut server_handle = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            server.stop().await;
            server_handle.await
        }
        outcome = &mut server_handle => outcome,
    };

    match outcome {
        Ok(Ok(())) => {
            info!("server shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("server error: {e}");
            Err(e.into())
        }
        Err(e) => {
            error!("server task panicked: {e}");
            Err(e.into())
        }
    }
}

/// Purges expired refresh tokens once a minute, restarting the loop if it ever dies.
fn spawn_token_cleanup(storage: Arc<MemoryStorage>) {
    tokio::spawn(async move {
        loop {
            let storage = Arc::clone(&storage);
            let cleanup_handle = tokio::spawn(async move {
                let mut interval = time::interval(Duration::from_secs(60));
                loop {
                    interval.tick().await;
                    match storage.purge_expired_tokens(unix_now()).await {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "purged expired refresh tokens"),
                        Err(e) => warn!("refresh token cleanup failed: {e}"),
                    }
                }
            });

            match cleanup_handle.await {
                Ok(()) => error!("cleanup task terminated unexpectedly, restarting..."),
                Err(e) => error!("cleanup task panicked: {e:?}, restarting..."),
            }

            time::sleep(Duration::from_secs(5)).await;
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
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
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C signal"),
        _ = terminate => info!("received terminate signal"),
    }

    info!("initiating graceful shutdown (allowing in-flight requests to complete)");
}
