use mimalloc::MiMalloc;
use tether::config::{CONFIG, ConfigSource};
use tether::connector::{self, ConnectorOptions};
use tether::db::DriverRegistry;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = &CONFIG.basic;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false),
        )
        .init();

    std::panic::set_hook(Box::new(|panic| {
        error!(panic = %panic, "Unexpected fault");
    }));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        loglevel = %cfg.loglevel,
        config_path = %cfg.config_path.display(),
        install_dir = %cfg.install_dir.display(),
    );

    let registry = DriverRegistry::new();
    let handle = connector::spawn(ConnectorOptions::new(cfg.clone(), registry)).await?;

    if let Err(e) = handle.load_config(ConfigSource::Stored).await {
        error!(error = %e, "Initial configuration not loaded");
    }

    #[cfg(unix)]
    {
        let reload_handle = handle.clone();
        match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(mut hangup) => {
                tokio::spawn(async move {
                    while hangup.recv().await.is_some() {
                        info!("SIGHUP received, reloading configuration");
                        if let Err(e) = reload_handle.load_config(ConfigSource::Stored).await {
                            error!(error = %e, "Reload failed");
                        }
                    }
                });
            }
            Err(e) => warn!(error = %e, "SIGHUP handler not installed, reload on signal disabled"),
        }
    }

    shutdown_signal().await;
    info!("Shutting down");
    handle.shutdown().await;
    info!("Connector has shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
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
