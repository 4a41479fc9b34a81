use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use relay_core::{connection::ConnectionManager, dispatch::DispatchService, errors::Error, Result};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub connection: Arc<ConnectionManager>,
    pub dispatch: Arc<DispatchService>,
}

impl AppState {
    pub fn new(connection: Arc<ConnectionManager>, send_timeout: Duration) -> Self {
        let dispatch = Arc::new(DispatchService::new(connection.clone(), send_timeout));
        Self {
            connection,
            dispatch,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::pages::home))
        .route("/qr", get(handlers::pages::qr))
        .route("/qr-text", get(handlers::status::qr_text))
        .route("/health", get(handlers::status::health))
        .route("/send-whatsapp", post(handlers::send::send_whatsapp))
        .route("/test-extraction", post(handlers::send::test_extraction))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves; in-flight requests are allowed to finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "http server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Error::Io)
}
