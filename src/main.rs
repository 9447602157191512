//! apteryxd - the apteryx daemon.
//!
//! Loads configuration (defaults, `CONFIG_PATH` file, `APTERYX__*`
//! environment), binds the primary listener, and serves until SIGINT or
//! SIGTERM. Additional listeners are managed at runtime through writes to
//! `/apteryx/sockets/<guid>`.

use apteryx::Engine;
use apteryx::EngineConfig;
use apteryx::Result;
use apteryx::Server;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load()?;
    init_observability(&config);

    let engine = Engine::start(config);
    let server = Server::start(engine.clone()).await?;
    if let Some(uri) = server.uri() {
        info!(%uri, "apteryxd ready");
    }

    wait_for_shutdown().await;

    info!("shutting down");
    server.shutdown().await;
    engine.shutdown().await;
    Ok(())
}

fn init_observability(config: &EngineConfig) {
    let default_level = if config.engine.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn wait_for_shutdown() {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(err) => {
            error!(%err, "cannot install SIGINT handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(err) => {
            error!(%err, "cannot install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
}
