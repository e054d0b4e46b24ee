//! Realtime gateway
//!
//! The WebSocket endpoint devices connect to. Per connection:
//! `Unregistered -> Registered -> Ready`, and `Disconnected` from any state
//! on close or liveness timeout. Frames from one socket are handled in
//! order; nothing is ordered across sockets.
//!
//! A background sweep pings every live device and evicts the ones whose
//! last PONG is older than [`CONNECTION_TIMEOUT`].

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::account_cache::{account_cache_key, AccountCache};
use crate::config::{CONNECTION_TIMEOUT, PING_INTERVAL};
use crate::device_registry::{ConnectionHandle, DeviceRegistry, Outbound};
use crate::protocol::{
    parse_device_message, AccountRequest, AccountResponse, DeviceMessage, GatewayMessage, PingPayload,
    RegisterReply,
};
use crate::upstream_rpc::UpstreamRpc;

/// Default encoding when a request does not name one.
pub const DEFAULT_ENCODING: &str = "base58";

/// Routing hint from account address to block: sum of UTF-16 code units
/// modulo the block count. Collisions are expected.
pub fn block_index_for_account(address: &str, block_count: u32) -> i64 {
    if block_count == 0 {
        return 0;
    }
    let sum: u64 = address.encode_utf16().map(u64::from).sum();
    (sum % block_count as u64) as i64
}

/// Where a single socket is in the device protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unregistered,
    Registered { device_id: String },
    Ready { device_id: String },
}

impl ConnectionState {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            ConnectionState::Unregistered => None,
            ConnectionState::Registered { device_id } | ConnectionState::Ready { device_id } => Some(device_id),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub evicted: Vec<String>,
}

pub struct Gateway {
    registry: Arc<DeviceRegistry>,
    cache: Arc<AccountCache>,
    upstream: Arc<UpstreamRpc>,
    cache_ttl: Duration,
}

impl Gateway {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        cache: Arc<AccountCache>,
        upstream: Arc<UpstreamRpc>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            upstream,
            cache_ttl,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Accepts upgrades on `/` and `/ws`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .with_state(self)
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let conn = ConnectionHandle::new(tx);
        let mut state = ConnectionState::Unregistered;

        tracing::info!("New connection {}", conn.id());

        // Writer: drains the queue until the socket dies or a close is requested.
        let mut send_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Outbound::Text(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&conn, &mut state, text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                            Ok(text) => self.handle_text(&conn, &mut state, text).await,
                            Err(_) => {
                                conn.send(&GatewayMessage::error("Invalid message format"));
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("WebSocket error on {}: {}", conn.id(), e);
                            break;
                        }
                    }
                }
                // Writer finished: evicted or the socket is unwritable.
                _ = &mut send_task => break,
            }
        }

        send_task.abort();

        self.registry.release_connection(conn.id()).await;
        tracing::info!("Connection {} closed", conn.id());
    }

    /// Dispatch one inbound frame. Protocol violations are answered inline
    /// and leave the connection open.
    pub async fn handle_text(&self, conn: &ConnectionHandle, state: &mut ConnectionState, text: &str) {
        let message = match parse_device_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Rejected frame on {}: {}", conn.id(), e);
                conn.send(&GatewayMessage::error(e.to_string()));
                return;
            }
        };

        match message {
            DeviceMessage::Register { public_key } => self.handle_register(conn, state, &public_key).await,
            DeviceMessage::SyncComplete {
                device_id,
                data_hash,
                block_timestamp,
            } => {
                self.handle_sync_complete(conn, state, &device_id, &data_hash, block_timestamp)
                    .await
            }
            DeviceMessage::AccountResponse(response) => self.handle_account_response(response).await,
            DeviceMessage::Pong { device_id } => {
                if let Some(device_id) = device_id {
                    self.registry.update_device_ping(&device_id).await;
                }
            }
        }
    }

    async fn handle_register(&self, conn: &ConnectionHandle, state: &mut ConnectionState, public_key: &str) {
        match self.registry.register_device(conn.clone(), public_key).await {
            Ok(registration) => {
                if let Some(assignment) = registration.assignment {
                    conn.send(&GatewayMessage::AssignedBlock(assignment));
                }
                conn.send(&GatewayMessage::Register(RegisterReply::Registered {
                    device_id: registration.device_id.clone(),
                }));
                *state = ConnectionState::Registered {
                    device_id: registration.device_id,
                };
            }
            Err(e) => {
                tracing::error!("Error registering device {}: {}", public_key, e);
                conn.send(&GatewayMessage::error("Error registering device"));
            }
        }
    }

    async fn handle_sync_complete(
        &self,
        conn: &ConnectionHandle,
        state: &mut ConnectionState,
        device_id: &str,
        data_hash: &str,
        block_timestamp: u64,
    ) {
        match state.device_id() {
            None => {
                conn.send(&GatewayMessage::error("Device is not registered"));
                return;
            }
            Some(own) if own != device_id => {
                conn.send(&GatewayMessage::error("Device id does not match this connection"));
                return;
            }
            Some(_) => {}
        }

        if !self.registry.mark_device_ready(device_id).await {
            conn.send(&GatewayMessage::error("Device is not connected"));
            return;
        }
        self.registry.record_device_sync(device_id, data_hash, block_timestamp).await;
        *state = ConnectionState::Ready {
            device_id: device_id.to_string(),
        };

        tracing::info!("Device {} completed sync with hash {}", device_id, data_hash);
    }

    /// Accept a device's account data only when it is fresh: then credit the
    /// device and cache the data as a `getAccountInfo` response.
    async fn handle_account_response(&self, response: AccountResponse) {
        match self.upstream.is_data_fresh(response.last_block_timestamp).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    "Received outdated data from {} (slot {}), skipping",
                    response.public_key,
                    response.last_block_timestamp
                );
                return;
            }
            Err(e) => {
                tracing::error!("Error checking data freshness: {}", e);
                return;
            }
        }

        let Some(device_id) = self.registry.device_id_for_public_key(&response.public_key).await else {
            tracing::debug!("Account response from unknown device {}", response.public_key);
            return;
        };
        let Some(address) = response.cache_address() else {
            tracing::warn!("Account response from {} names no account", device_id);
            return;
        };

        self.registry.update_device_reward(&device_id).await;

        let encoding = response.encoding.as_deref().unwrap_or(DEFAULT_ENCODING);
        let key = account_cache_key(address, encoding);
        let data = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "context": {
                    "apiVersion": "1.0.0",
                    "slot": response.last_block_timestamp,
                },
                "value": response.account_info,
            }
        });
        self.cache.set(&key, data, self.cache_ttl).await;

        if let Some(block) = self
            .registry
            .get_connected_device(&device_id)
            .await
            .and_then(|d| d.data_block_index)
        {
            self.registry.record_block_data(block, &response.data_hash).await;
        }

        tracing::info!("Cached account data for {} from device {}", address, device_id);
    }

    /// Fan a `getAccountInfo` out to the ready devices owning the account's
    /// block. Returns how many devices were asked.
    pub async fn request_account_info(&self, request_id: &Value, account_address: &str, encoding: &str) -> usize {
        let block_index = block_index_for_account(account_address, self.registry.block_count());
        self.registry.record_block_access(block_index).await;

        let devices = self.registry.get_devices_for_block(block_index).await;
        if devices.is_empty() {
            tracing::debug!("No devices available for block {}", block_index);
            return 0;
        }

        let message = GatewayMessage::AccountRequest(AccountRequest {
            request_id: request_id.clone(),
            account_address: account_address.to_string(),
            encoding: encoding.to_string(),
        });
        let sent = devices.iter().filter(|d| d.handle.send(&message)).count();

        tracing::info!(
            "Sent account request to {} devices for account {}",
            sent,
            account_address
        );
        sent
    }

    /// One liveness pass: evict devices silent for longer than the timeout,
    /// ping the rest.
    pub async fn sweep_connections(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let timestamp = Utc::now().timestamp_millis();

        for (device_id, device) in self.registry.get_all_connected_devices().await {
            if now.saturating_duration_since(device.last_ping) > CONNECTION_TIMEOUT {
                // No-op if the device re-registered on another socket meanwhile.
                if self.registry.release_connection(device.handle.id()).await.is_some() {
                    tracing::info!("Device {} timed out, disconnecting", device_id);
                    device.handle.close();
                    report.evicted.push(device_id);
                }
                continue;
            }

            if device.handle.send(&GatewayMessage::Ping(PingPayload { timestamp })) {
                report.pinged += 1;
            }
        }

        report
    }

    /// Run [`Gateway::sweep_connections`] every [`PING_INTERVAL`].
    pub fn spawn_liveness_sweep(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let report = self.sweep_connections(Instant::now()).await;
                if !report.evicted.is_empty() || report.pinged > 0 {
                    tracing::debug!(
                        "Liveness sweep: pinged {}, evicted {}",
                        report.pinged,
                        report.evicted.len()
                    );
                }
            }
        })
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| gateway.handle_socket(socket))
}
