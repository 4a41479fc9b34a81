use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use relay_bridge::BridgeClient;
use relay_core::{config::Config, connection::ConnectionManager, store};
use relay_http::{keepalive, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_core::logging::init("relay")?;

    let cfg = Config::load()?;

    let opened = store::open(store::from_config(&cfg)?, &cfg.client_id).await;
    if opened.store.is_none() {
        tracing::warn!("session persistence unavailable; pairing will not survive a restart");
    }

    let client = Arc::new(BridgeClient::new(cfg.bridge_invocation()));
    let connection = Arc::new(ConnectionManager::new(
        client,
        opened.store,
        cfg.client_id.clone(),
    ));
    connection
        .initialize(opened.session)
        .await
        .context("failed to start the WhatsApp bridge")?;
    if let Err(e) = connection.wait_until_started(cfg.startup_timeout).await {
        let _ = connection.shutdown().await;
        return Err(e).context("WhatsApp bridge did not come up");
    }

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .with_context(|| format!("failed to bind port {}", cfg.port))?;
    if !cfg.production {
        tracing::info!("to connect WhatsApp, visit http://localhost:{}/qr", cfg.port);
    }

    let stop_keep_alive = CancellationToken::new();
    let keep_alive = cfg
        .keep_alive_target()
        .map(|url| keepalive::spawn(url, cfg.keep_alive_interval, stop_keep_alive.clone()));

    let state = AppState::new(connection.clone(), cfg.send_timeout);
    let served = relay_http::serve(listener, state, shutdown_signal()).await;

    tracing::info!("shutting down");
    stop_keep_alive.cancel();
    if let Some(handle) = keep_alive {
        let _ = handle.await;
    }
    if let Err(e) = connection.shutdown().await {
        tracing::warn!(error = %e, "failed to stop the WhatsApp bridge cleanly");
    }

    served.context("http server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
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
