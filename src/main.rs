//! Portferry daemon entry point.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};
use tokio::net::UnixListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};

mod api;
mod config;
mod detect;
mod error;
mod manager;
mod runtime;
mod session;
mod store;
mod tunnel;
mod types;

use config::Config;
use detect::ProbeDetector;
use manager::{Manager, ManagerSettings};
use runtime::{ContainerRuntime, DockerRuntime};
use session::SessionCache;
use store::FileStore;
use tunnel::AgentTunnels;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting Portferry daemon with config: {:?}", cfg);

    // Fatal start-up errors: no usable state, no runtime, no agent client.
    let store = FileStore::open(cfg.state_path())
        .await
        .context("failed to open state store")?;
    let docker = Arc::new(
        DockerRuntime::connect()
            .await
            .context("failed to connect to Docker")?,
    );
    let tunnels = AgentTunnels::new(
        cfg.agent_api_url.clone(),
        cfg.forwarder_prefix.clone(),
        &cfg.extension_version,
        cfg.adapter_timeout(),
    )
    .context("failed to create agent client")?;

    // Shared endpoint table
    let cache = Arc::new(SessionCache::new());
    let manager = Arc::new(Manager::new(
        Arc::new(store),
        docker.clone(),
        Arc::new(tunnels),
        Arc::new(ProbeDetector::new(cfg.detect_timeout())),
        cache,
        ManagerSettings {
            target_host: cfg.target_host.clone(),
            adapter_timeout: cfg.adapter_timeout(),
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // API server
    let _ = std::fs::remove_file(&cfg.socket_path);
    let listener = UnixListener::bind(&cfg.socket_path)
        .with_context(|| format!("failed to listen on {}", cfg.socket_path.display()))?;
    info!("Listening on {}", cfg.socket_path.display());
    let app = api::router(api::AppState {
        manager: manager.clone(),
        converge_timeout: cfg.converge_timeout(),
    });
    let mut server_rx = shutdown_rx.clone();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_rx.wait_for(|stop| *stop).await;
            })
            .await
    });

    // Convergence loop; its first tick is the start-up convergence.
    let loop_manager = manager.clone();
    let interval = cfg.converge_interval();
    let pass_timeout = cfg.converge_timeout();
    let loop_rx = shutdown_rx.clone();
    let mut loop_handle = tokio::spawn(async move {
        loop_manager.run(interval, pass_timeout, loop_rx).await;
    });

    // Container lifecycle events trigger extra passes
    let (event_tx, mut event_rx) = mpsc::channel(128);
    let monitor_handle = tokio::spawn(async move {
        if let Err(e) = docker.monitor(event_tx).await {
            error!("Docker monitor failed: {}", e);
        }
    });
    let event_manager = manager.clone();
    let events_handle = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            info!("Container event: {:?}", event);
            event_manager.trigger();
        }
    });

    // Wait for whichever ends first, then shut down exactly once.
    let server_done = tokio::select! {
        r = signal::ctrl_c() => {
            match r {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            false
        }
        r = &mut server_handle => {
            match r {
                Ok(Ok(())) => warn!("API server exited, shutting down..."),
                Ok(Err(e)) => error!("API server failed: {}", e),
                Err(e) => error!("API server task panicked: {}", e),
            }
            true
        }
        _ = &mut loop_handle => {
            warn!("Convergence loop exited, shutting down...");
            false
        }
    };

    let _ = shutdown_tx.send(true);
    if let Err(e) = manager.shutdown(cfg.shutdown_timeout()).await {
        warn!("Error shutting down manager: {}", e);
    }

    if !server_done {
        match tokio::time::timeout(cfg.shutdown_timeout(), &mut server_handle).await {
            Ok(Ok(Err(e))) => error!("API server failed during shutdown: {}", e),
            Ok(_) => {}
            Err(_) => {
                warn!("API server did not drain in time");
                server_handle.abort();
            }
        }
    }
    loop_handle.abort();
    monitor_handle.abort();
    events_handle.abort();
    let _ = std::fs::remove_file(&cfg.socket_path);

    info!("Shutdown complete.");
    Ok(())
}
