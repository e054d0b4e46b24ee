//! chain-cloud-relay - Storage-mining relay for Solana account data
//!
//! Provides:
//! - WebSocket gateway where devices register, sync a data block and answer
//!   account queries for rewards
//! - JSON-RPC `getAccountInfo` front door (cache, then devices, then upstream)
//! - Durable device/block registry in SQLite

pub mod account_cache;
pub mod app_error;
pub mod app_state;
pub mod config;
pub mod database;
pub mod device_registry;
pub mod gateway;
pub mod middleware;
pub mod protocol;
pub mod routes;
pub mod upstream_rpc;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue},
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
};

use crate::app_state::AppState;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// The HTTP front door. Browsers call it directly, so it answers CORS
/// preflights for any origin.
pub fn http_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/rpc", post(routes::rpc))
        .route("/stats", get(routes::stats))
        .route("/health", get(routes::health))
        .fallback(routes::not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(cors)
        .layer(from_fn(middleware::request_logging_middleware))
        .with_state(state)
}

/// The device-facing WebSocket server.
pub fn ws_router(state: &AppState) -> Router {
    state.gateway.clone().router()
}
