//! pingnode - continuous network measurement agent
//!
//! Runs ping and TCP-connect probes on request and streams the results to
//! the backend.

mod backend;
mod config;
mod db;
mod node;
mod probe;
mod scheduler;
mod signal;
mod web;

#[cfg(test)]
mod testing;

use backend::{BackendPublisher, HeartbeatReporter};
use config::AgentConfig;
use db::Store;
use node::NodeIdentityCache;
use probe::CommandEchoRunner;
use scheduler::TaskRegistry;
use signal::StopSignal;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cfg = AgentConfig::load();

    // Initialize logging
    let level = if cfg.debug { "pingnode=debug" } else { "pingnode=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    tracing::info!("Starting pingnode on port {}...", cfg.http_port);
    tracing::info!("Using backend at {}", cfg.backend_url);

    // Node identity survives restarts
    let store = Arc::new(Store::new(&cfg.db_path)?);
    let identity = Arc::new(NodeIdentityCache::load(store));
    tracing::info!("Identity database at {}", cfg.db_path);

    let shutdown = StopSignal::new();

    let reporter = Arc::new(HeartbeatReporter::new(
        &cfg.backend_url,
        identity.clone(),
        cfg.heartbeat_interval,
    )?);
    match reporter.resolve().await {
        Ok(node) => tracing::info!(node_id = node.node_id, node_ip = %node.node_ip, "Node identity resolved"),
        Err(e) => tracing::warn!("Node identity not resolved yet, retrying with heartbeats: {}", e),
    }
    let heartbeat = reporter.start(shutdown.token());

    let publisher = BackendPublisher::new(&cfg.backend_url, identity)?;
    let registry = TaskRegistry::new(publisher, Arc::new(CommandEchoRunner::default()));
    registry.start();

    let server = Server::new(cfg, registry.clone());
    let mut stop = shutdown.token();
    let serve = server.start(async move { stop.stopped().await });

    tokio::pin!(serve);
    tokio::select! {
        res = &mut serve => {
            if let Err(e) = res {
                tracing::error!("Control server failed: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown requested");
            shutdown.stop();
            if let Err(e) = serve.await {
                tracing::error!("Control server failed during shutdown: {}", e);
            }
        }
    }

    shutdown.stop();
    registry.shutdown().await;
    if let Err(e) = heartbeat.await {
        tracing::warn!("Heartbeat loop ended abnormally: {}", e);
    }

    tracing::info!("pingnode stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM where the platform has it.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_requests_shutdown() {
        let waiter = tokio::spawn(shutdown_signal());
        // Let the handlers register before the signal is raised
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        let status = tokio::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .await
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
