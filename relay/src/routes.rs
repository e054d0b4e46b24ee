//! HTTP front door
//!
//! `POST /rpc` resolves `getAccountInfo` in three tiers: cache, then the
//! devices holding the account's block, then the upstream node.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::account_cache::account_cache_key;
use crate::app_error::AppError;
use crate::app_state::AppState;
use crate::gateway::DEFAULT_ENCODING;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub connected_devices: usize,
    pub block_height: u64,
    pub uptime_secs: u64,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// JSON-RPC
// ============================================================================

/// A validated `getAccountInfo` call.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountInfoCall {
    pub id: Value,
    pub address: String,
    pub encoding: String,
}

/// Validate a raw JSON-RPC body down to a `getAccountInfo` call.
pub fn parse_rpc_request(body: &[u8]) -> Result<AccountInfoCall, AppError> {
    let request: Value = serde_json::from_slice(body).map_err(|_| AppError::ParseError)?;
    if !request.is_object() {
        return Err(AppError::ParseError);
    }

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or_default();
    if method != "getAccountInfo" {
        return Err(AppError::MethodNotFound { id });
    }

    let params = request.get("params").and_then(Value::as_array);
    let Some(address) = params
        .and_then(|p| p.first())
        .and_then(Value::as_str)
        .filter(|a| !a.is_empty())
    else {
        return Err(AppError::InvalidParams {
            id,
            message: "expected account address as first parameter".to_string(),
        });
    };
    let encoding = params
        .and_then(|p| p.get(1))
        .and_then(|config| config.get("encoding"))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_ENCODING);

    Ok(AccountInfoCall {
        id,
        address: address.to_string(),
        encoding: encoding.to_string(),
    })
}

/// Cached envelopes carry whatever id they were stored with.
fn with_request_id(mut envelope: Value, id: &Value) -> Value {
    if let Some(obj) = envelope.as_object_mut() {
        obj.insert("id".to_string(), id.clone());
    }
    envelope
}

/// Cache, then devices (bounded wait), then upstream.
async fn resolve_account_info(state: Arc<AppState>, call: AccountInfoCall) -> Value {
    let key = account_cache_key(&call.address, &call.encoding);

    if let Some(cached) = state.cache.get(&key).await {
        tracing::debug!("Cache hit for {}", key);
        return cached;
    }

    // Subscribe before fanning out so a fast answer is not missed.
    let mut writes = state.cache.subscribe();
    state
        .gateway
        .request_account_info(&call.id, &call.address, &call.encoding)
        .await;

    if tokio::time::timeout(state.device_wait, state.cache.wait_for_key(&mut writes, &key))
        .await
        .is_err()
    {
        tracing::debug!("No device answered for {} within {:?}", call.address, state.device_wait);
    }

    if let Some(cached) = state.cache.get(&key).await {
        return cached;
    }

    tracing::debug!("Falling back to upstream for {}", call.address);
    state.upstream.get_account_info(&call.address, &call.encoding).await
}

/// POST /rpc
pub async fn rpc(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Value>, AppError> {
    let call = parse_rpc_request(&body)?;
    let id = call.id.clone();

    // A panic while resolving becomes an internal error, not a dropped connection.
    let envelope = tokio::spawn(resolve_account_info(state, call))
        .await
        .map_err(|e| AppError::Internal {
            id: id.clone(),
            cause: e.into(),
        })?;

    Ok(Json(with_request_id(envelope, &id)))
}

// ============================================================================
// Service endpoints
// ============================================================================

/// GET /stats
pub async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let block_height = state.upstream.get_current_block_height().await.map_err(|e| {
        tracing::error!("Error fetching block height for stats: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: "Failed to fetch block height".to_string() }),
        )
    })?;

    Ok(Json(StatsResponse {
        connected_devices: state.registry.connected_count().await,
        block_height,
        uptime_secs: state.start_time.elapsed().as_secs(),
    }))
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse { error: "Not found".to_string() }),
    )
}
