//! Device protocol
//!
//! Every frame is a JSON object `{ "type": ..., "payload": ... }`.
//! Inbound frames are parsed in two steps (envelope, then payload) so a
//! bad payload gets a precise error reply instead of a generic one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Gateway → Device
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayMessage {
    /// Reply to REGISTER. Protocol errors also travel under this tag.
    Register(RegisterReply),
    AssignedBlock(BlockAssignment),
    AccountRequest(AccountRequest),
    Ping(PingPayload),
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RegisterReply {
    Registered {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockAssignment {
    pub block_index: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRequest {
    pub request_id: Value,
    pub account_address: String,
    pub encoding: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingPayload {
    /// Unix milliseconds
    pub timestamp: i64,
}

impl GatewayMessage {
    pub fn error(message: impl Into<String>) -> Self {
        GatewayMessage::Register(RegisterReply::Error { error: message.into() })
    }

    pub fn to_json(&self) -> String {
        // Serializing these plain structs cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ============================================================================
// Device → Gateway
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Register {
        public_key: String,
    },
    SyncComplete {
        device_id: String,
        data_hash: String,
        block_timestamp: u64,
    },
    AccountResponse(AccountResponse),
    Pong {
        device_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountResponse {
    pub public_key: String,
    pub data_hash: String,
    pub last_block_timestamp: u64,
    pub account_info: Value,
    /// Echo of the requested address; older clients omit it.
    pub account_address: Option<String>,
    pub encoding: Option<String>,
}

impl AccountResponse {
    /// Address the response is cached under: the echoed request address,
    /// else the account owner.
    pub fn cache_address(&self) -> Option<&str> {
        self.account_address
            .as_deref()
            .or_else(|| self.account_info.get("owner").and_then(Value::as_str))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    InvalidFormat,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Public key is required")]
    MissingPublicKey,
    #[error("Missing required fields for sync completion")]
    IncompleteSync,
    #[error("Missing required fields for account response")]
    IncompleteAccountResponse,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawRegister {
    public_key: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawSyncComplete {
    device_id: Option<String>,
    data_hash: Option<String>,
    block_timestamp: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawAccountResponse {
    public_key: Option<String>,
    data_hash: Option<String>,
    last_block_timestamp: Option<u64>,
    account_info: Option<Value>,
    account_address: Option<String>,
    encoding: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawPong {
    device_id: Option<String>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

/// Chain positions are stored as signed integers; larger values are invalid.
fn chain_position(n: Option<u64>) -> Option<u64> {
    n.filter(|n| *n <= i64::MAX as u64)
}

/// Payload fields of the wrong type are treated as missing.
fn payload<T: for<'de> Deserialize<'de> + Default>(value: Value) -> Option<T> {
    if value.is_null() {
        return Some(T::default());
    }
    serde_json::from_value(value).ok()
}

pub fn parse_device_message(text: &str) -> Result<DeviceMessage, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidFormat)?;

    match envelope.kind.as_str() {
        "REGISTER" => {
            let raw: RawRegister = payload(envelope.payload).ok_or(ProtocolError::MissingPublicKey)?;
            let public_key = non_empty(raw.public_key).ok_or(ProtocolError::MissingPublicKey)?;
            Ok(DeviceMessage::Register { public_key })
        }
        "SYNC_COMPLETE" => {
            let raw: RawSyncComplete = payload(envelope.payload).ok_or(ProtocolError::IncompleteSync)?;
            match (non_empty(raw.device_id), non_empty(raw.data_hash), chain_position(raw.block_timestamp)) {
                (Some(device_id), Some(data_hash), Some(block_timestamp)) => Ok(DeviceMessage::SyncComplete {
                    device_id,
                    data_hash,
                    block_timestamp,
                }),
                _ => Err(ProtocolError::IncompleteSync),
            }
        }
        "ACCOUNT_RESPONSE" => {
            let raw: RawAccountResponse =
                payload(envelope.payload).ok_or(ProtocolError::IncompleteAccountResponse)?;
            let account_info = raw.account_info.filter(|v| v.is_object());
            match (
                non_empty(raw.public_key),
                non_empty(raw.data_hash),
                chain_position(raw.last_block_timestamp),
                account_info,
            ) {
                (Some(public_key), Some(data_hash), Some(last_block_timestamp), Some(account_info)) => {
                    Ok(DeviceMessage::AccountResponse(AccountResponse {
                        public_key,
                        data_hash,
                        last_block_timestamp,
                        account_info,
                        account_address: non_empty(raw.account_address),
                        encoding: non_empty(raw.encoding),
                    }))
                }
                _ => Err(ProtocolError::IncompleteAccountResponse),
            }
        }
        "PONG" => {
            let raw: RawPong = payload(envelope.payload).unwrap_or_default();
            Ok(DeviceMessage::Pong {
                device_id: non_empty(raw.device_id),
            })
        }
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}
