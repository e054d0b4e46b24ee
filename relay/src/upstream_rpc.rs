//! Upstream Solana RPC client
//!
//! The fallback data source behind devices and the cache, and the source of
//! truth for block height when judging whether device data is fresh.
//!
//! Account lookups are masked: any upstream failure comes back as a
//! well-formed null-account response from [`UpstreamRpc::get_account_info`].
//! Callers that need to tell an outage apart from a missing account use
//! [`UpstreamRpc::try_get_account_info`]. Block height is never masked.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;

use crate::account_cache::{account_cache_key, AccountCache};
use crate::config::{FRESHNESS_THRESHOLD, UPSTREAM_TIMEOUT};

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid upstream response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no result in upstream response")]
    MissingResult,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// True when the reported chain position is strictly within
/// [`FRESHNESS_THRESHOLD`] slots of the current height. A position ahead of
/// the current height counts as fresh.
pub fn is_fresh(current_height: u64, reported: u64) -> bool {
    current_height.saturating_sub(reported) < FRESHNESS_THRESHOLD
}

/// The response served when the upstream cannot be reached.
pub fn null_account_response() -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": {
            "context": {
                "apiVersion": "0.0.0",
                "slot": 0
            },
            "value": null
        },
        "id": 1
    })
}

pub struct UpstreamRpc {
    url: String,
    client: reqwest::Client,
    cache: Arc<AccountCache>,
    cache_ttl: Duration,
}

impl UpstreamRpc {
    pub fn new(url: &str, cache: Arc<AccountCache>, cache_ttl: Duration) -> Self {
        let normalized_url = if url.starts_with("http") {
            url.to_string()
        } else {
            format!("https://{}", url)
        };

        Self {
            url: normalized_url,
            client: reqwest::Client::new(),
            cache,
            cache_ttl,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST a JSON-RPC call and return the whole response envelope.
    async fn request_raw(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let start = Instant::now();
        let resp = self
            .client
            .post(&self.url)
            .timeout(UPSTREAM_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let bytes = resp.bytes().await?;
        let envelope: Value = serde_json::from_slice(&bytes)?;

        tracing::debug!(
            "Upstream {} answered in {}ms ({} bytes)",
            method,
            start.elapsed().as_millis(),
            bytes.len()
        );

        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            let error: JsonRpcError = serde_json::from_value(error.clone())?;
            return Err(UpstreamError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        if envelope.get("result").is_none() {
            return Err(UpstreamError::MissingResult);
        }
        Ok(envelope)
    }

    /// `getAccountInfo` through the cache, surfacing upstream failures.
    /// Successful upstream responses are written back to the cache.
    pub async fn try_get_account_info(&self, address: &str, encoding: &str) -> Result<Value, UpstreamError> {
        let key = account_cache_key(address, encoding);
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        let params = json!([address, { "encoding": encoding }]);
        let response = self.request_raw("getAccountInfo", params).await?;
        self.cache.set(&key, response.clone(), self.cache_ttl).await;
        Ok(response)
    }

    /// `getAccountInfo` that never fails: upstream errors become a null account.
    pub async fn get_account_info(&self, address: &str, encoding: &str) -> Value {
        match self.try_get_account_info(address, encoding).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Error fetching account info for {}: {}", address, e);
                null_account_response()
            }
        }
    }

    /// Current slot of the upstream node. Errors propagate.
    pub async fn get_current_block_height(&self) -> Result<u64, UpstreamError> {
        let envelope = self.request_raw("getSlot", json!([])).await?;
        let result = envelope.get("result").cloned().ok_or(UpstreamError::MissingResult)?;
        Ok(serde_json::from_value(result)?)
    }

    /// Whether a device reporting `last_block_timestamp` is close enough to
    /// the chain head.
    pub async fn is_data_fresh(&self, last_block_timestamp: u64) -> Result<bool, UpstreamError> {
        let current = self.get_current_block_height().await?;
        Ok(is_fresh(current, last_block_timestamp))
    }
}
