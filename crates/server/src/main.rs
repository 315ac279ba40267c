use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use kvserve_server::api::{self, AppState, HealthState};
use kvserve_server::config::{ServerArgs, ServerConfig};
use kvserve_server::crypto::keystore::{KeyStore, PRIVATE_KEY};
use kvserve_server::crypto::rsa;
use kvserve_server::shutdown::shutdown_signal;
use kvserve_server::{loader, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cfg = ServerConfig::from(ServerArgs::parse());

    // Key material for the secure endpoints: clients encrypt against the
    // logged public key; the private key stays in process memory.
    let keys = Arc::new(KeyStore::new());
    let (private_pem, public_pem) = rsa::generate_keys().context("failed to generate RSA keys")?;
    tracing::info!("public key for secure endpoints:\n{public_pem}");
    keys.set(PRIVATE_KEY, &private_pem);

    let health = Arc::new(HealthState::new());
    let (runner_tx, runner_rx) = watch::channel(None);
    loader::spawn(cfg.clone(), health.clone(), runner_tx);

    let state = AppState::new(runner_rx.clone(), health, keys, cfg.model_name.clone());
    let router = api::create_router(state);

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), cfg.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(scheduler) = runner_rx.borrow().clone() {
        scheduler.stop();
    }

    Ok(())
}
