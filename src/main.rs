use crate::config::Config;
use crate::controller::Controller;
use crate::inspector::KubeInspector;
use crate::registry::RegistryClient;
use crate::state::ControllerState;
use anyhow::Context;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod error;
mod inspector;
mod registry;
mod secret_string;
mod state;
mod tracker;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;

    init_logging(&config.log_level);
    info!("Starting kube-digest-sync {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Loaded configuration from {} with {} registries, {} images and {} deployments",
        config_path,
        config.registries.len(),
        config.images.len(),
        config.deployments.len()
    );

    if let Err(err) = run(config).await {
        error!("kube-digest-sync failed: {:#}", err);
        return Err(err);
    }

    info!("kube-digest-sync stopped gracefully");
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let kubeconfig = config.kubeconfig_path()?;
    let kube_client = inspector::create_client(kubeconfig.as_deref()).await?;
    let http_client = registry::create_client(&config)?;
    let state = Arc::new(ControllerState::new());

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let app = webserver::create_app(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind webserver to {}", addr))?;
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
    });

    let controller = Controller::new(
        config,
        RegistryClient::new(http_client),
        KubeInspector::new(kube_client),
        state,
    );
    let result = controller.run(shutdown.clone()).await;

    shutdown.cancel();
    server
        .await
        .context("Webserver task panicked")?
        .context("Webserver failed")?;

    match result {
        Err(err) if !err.is_cancelled() => Err(err).context("Controller failed"),
        _ => Ok(()),
    }
}

/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(level: &str) {
    let level = match level {
        "debug" | "info" | "warn" | "error" => level,
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {}", err);
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
    info!("Received shutdown signal");
    shutdown.cancel();
}
