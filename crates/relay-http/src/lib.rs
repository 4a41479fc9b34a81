//! HTTP gateway (axum).
//!
//! Exposes the dispatch service and the pairing status over HTTP, plus the keep-alive
//! pinger used on hosts that idle out quiet services.

pub mod handlers;
pub mod keepalive;
pub mod router;

pub use router::{router, serve, AppState};
