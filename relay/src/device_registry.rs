//! Device registry
//!
//! Owns the durable device records, the block assignment policy and the
//! table of live connections. The live table is process-local and never
//! persisted; it is keyed by device id.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::RewardAmount;
use crate::database::{DataBlockRecord, Database, DeviceRecord};
use crate::protocol::{BlockAssignment, GatewayMessage};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Frames queued for a socket's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Sending half of a device socket. Cloning it does not open a new socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id: Uuid::new_v4(), tx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a message. Returns false once the socket is gone.
    pub fn send(&self, msg: &GatewayMessage) -> bool {
        self.tx.send(Outbound::Text(msg.to_json())).is_ok()
    }

    /// Ask the writer to close the socket.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A device with a live, registered socket.
#[derive(Debug, Clone)]
pub struct ConnectedDevice {
    pub handle: ConnectionHandle,
    pub public_key: String,
    pub device_id: String,
    pub data_block_index: Option<i64>,
    /// Set once the device reports it finished syncing its block
    pub is_ready: bool,
    pub last_ping: Instant,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub device_id: String,
    /// Present only when this registration gave the device its first block
    pub assignment: Option<BlockAssignment>,
}

/// Pick the block with the strictly lowest usage. On ties the earliest
/// block in `blocks` wins.
pub fn least_used_block<'a>(
    blocks: &'a [DataBlockRecord],
    usage: &HashMap<i64, i64>,
) -> Option<&'a DataBlockRecord> {
    let mut best: Option<(&DataBlockRecord, i64)> = None;
    for block in blocks {
        let count = usage.get(&block.block_index).copied().unwrap_or(0);
        match best {
            Some((_, best_count)) if count >= best_count => {}
            _ => best = Some((block, count)),
        }
    }
    best.map(|(block, _)| block)
}

pub struct DeviceRegistry {
    db: Database,
    connected: RwLock<HashMap<String, ConnectedDevice>>,
    /// Held across the durable write and the live-table change of every
    /// registration and disconnect, so the two always agree.
    presence: Mutex<()>,
    reward_amount: RewardAmount,
    block_count: u32,
}

impl DeviceRegistry {
    pub fn new(db: Database, reward_amount: RewardAmount, block_count: u32) -> Self {
        Self {
            db,
            connected: RwLock::new(HashMap::new()),
            presence: Mutex::new(()),
            reward_amount,
            block_count,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Find or create the device for `public_key`, mark it online, give it a
    /// block if it has none, and (re)insert it into the live table as not
    /// ready. The caller pushes the assignment to the device when present.
    pub async fn register_device(
        &self,
        handle: ConnectionHandle,
        public_key: &str,
    ) -> Result<Registration, RegistryError> {
        let _presence = self.presence.lock().await;
        let device = self.db.upsert_device_online(public_key).await?;

        let (data_block_index, assignment) = match device.data_block_index {
            Some(index) => (Some(index), None),
            None => {
                let chosen = self.assign_data_block().await?;
                // Another registration of the same key may have won the race.
                let actual = self
                    .db
                    .assign_block_if_unset(&device.id, chosen.block_index)
                    .await?
                    .unwrap_or(chosen.block_index);
                let assignment = if actual == chosen.block_index {
                    chosen
                } else {
                    self.describe_block(actual).await?
                };
                (Some(actual), Some(assignment))
            }
        };

        let entry = ConnectedDevice {
            handle,
            public_key: public_key.to_string(),
            device_id: device.id.clone(),
            data_block_index,
            is_ready: false,
            last_ping: Instant::now(),
        };
        self.connected.write().await.insert(device.id.clone(), entry);

        tracing::info!(
            "Device {} registered for {} (block {:?})",
            device.id,
            public_key,
            data_block_index
        );

        Ok(Registration {
            device_id: device.id,
            assignment,
        })
    }

    /// Least-used block over all durable devices, bootstrapping the block
    /// set on first use.
    pub async fn assign_data_block(&self) -> Result<BlockAssignment, RegistryError> {
        let blocks = self.db.list_blocks().await?;
        if blocks.is_empty() {
            self.db.bootstrap_blocks(self.block_count).await?;
            return Ok(BlockAssignment {
                block_index: 0,
                description: Some("Initial data block 0".to_string()),
            });
        }

        let usage = self.db.block_usage().await?;
        // `blocks` is non-empty here.
        let block = least_used_block(&blocks, &usage).unwrap_or(&blocks[0]);
        Ok(BlockAssignment {
            block_index: block.block_index,
            description: Some(
                block
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Data block {}", block.block_index)),
            ),
        })
    }

    async fn describe_block(&self, block_index: i64) -> Result<BlockAssignment, RegistryError> {
        let description = self
            .db
            .get_block(block_index)
            .await?
            .and_then(|b| b.description)
            .unwrap_or_else(|| format!("Data block {}", block_index));
        Ok(BlockAssignment {
            block_index,
            description: Some(description),
        })
    }

    /// Mark the device offline and drop its live entry. Unknown ids are a no-op.
    pub async fn handle_disconnect(&self, device_id: &str) {
        let _presence = self.presence.lock().await;
        self.disconnect_locked(device_id).await;
    }

    /// Disconnect whichever device is registered on `connection_id`.
    /// Does nothing once the device has re-registered on another socket.
    /// Returns the device id when an entry was dropped.
    pub async fn release_connection(&self, connection_id: Uuid) -> Option<String> {
        let _presence = self.presence.lock().await;
        let device_id = self.device_for_connection(connection_id).await?;
        self.disconnect_locked(&device_id).await;
        Some(device_id)
    }

    /// Caller holds `presence`.
    async fn disconnect_locked(&self, device_id: &str) {
        if let Err(e) = self.db.mark_device_offline(device_id).await {
            tracing::error!("Error handling disconnect for device {}: {}", device_id, e);
        }
        if self.connected.write().await.remove(device_id).is_some() {
            tracing::info!("Device {} disconnected", device_id);
        }
    }

    /// Live, ready devices assigned to `block_index`.
    pub async fn get_devices_for_block(&self, block_index: i64) -> Vec<ConnectedDevice> {
        self.connected
            .read()
            .await
            .values()
            .filter(|d| d.is_ready && d.data_block_index == Some(block_index))
            .cloned()
            .collect()
    }

    /// Count one accepted response and credit the fixed reward.
    pub async fn update_device_reward(&self, device_id: &str) {
        match self.db.add_device_reward(device_id, self.reward_amount.units()).await {
            Ok(true) => tracing::debug!("Rewarded device {} with {}", device_id, self.reward_amount),
            Ok(false) => tracing::debug!("Reward skipped, device {} not found", device_id),
            Err(e) => tracing::error!("Error updating reward for device {}: {}", device_id, e),
        }
    }

    /// Persist the hash and chain position a device reported after syncing.
    pub async fn record_device_sync(&self, device_id: &str, data_hash: &str, block_timestamp: u64) {
        if let Err(e) = self.db.record_device_sync(device_id, data_hash, block_timestamp).await {
            tracing::error!("Error recording sync for device {}: {}", device_id, e);
        }
    }

    pub async fn record_block_access(&self, block_index: i64) {
        if let Err(e) = self.db.record_block_access(block_index).await {
            tracing::warn!("Error recording access for block {}: {}", block_index, e);
        }
    }

    pub async fn record_block_data(&self, block_index: i64, data_hash: &str) {
        if let Err(e) = self.db.record_block_data(block_index, data_hash).await {
            tracing::warn!("Error recording data for block {}: {}", block_index, e);
        }
    }

    /// Live entry only; the durable record is untouched.
    pub async fn mark_device_ready(&self, device_id: &str) -> bool {
        match self.connected.write().await.get_mut(device_id) {
            Some(device) => {
                device.is_ready = true;
                true
            }
            None => false,
        }
    }

    pub async fn update_device_ping(&self, device_id: &str) {
        self.update_device_ping_at(device_id, Instant::now()).await;
    }

    pub async fn update_device_ping_at(&self, device_id: &str, at: Instant) {
        if let Some(device) = self.connected.write().await.get_mut(device_id) {
            device.last_ping = at;
        }
    }

    /// Snapshot of the live table.
    pub async fn get_all_connected_devices(&self) -> HashMap<String, ConnectedDevice> {
        self.connected.read().await.clone()
    }

    pub async fn connected_count(&self) -> usize {
        self.connected.read().await.len()
    }

    pub async fn get_connected_device(&self, device_id: &str) -> Option<ConnectedDevice> {
        self.connected.read().await.get(device_id).cloned()
    }

    /// Device registered on the socket `connection_id`, if any.
    pub async fn device_for_connection(&self, connection_id: Uuid) -> Option<String> {
        self.connected
            .read()
            .await
            .values()
            .find(|d| d.handle.id() == connection_id)
            .map(|d| d.device_id.clone())
    }

    pub async fn device_id_for_public_key(&self, public_key: &str) -> Option<String> {
        self.connected
            .read()
            .await
            .values()
            .find(|d| d.public_key == public_key)
            .map(|d| d.device_id.clone())
    }

    pub async fn get_device(&self, device_id: &str) -> Option<DeviceRecord> {
        match self.db.get_device(device_id).await {
            Ok(device) => device,
            Err(e) => {
                tracing::error!("Error loading device {}: {}", device_id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> DeviceRegistry {
        let db = Database::connect_in_memory().await.unwrap();
        DeviceRegistry::new(db, RewardAmount(1_000), 10)
    }

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(tx), rx)
    }

    fn block(id: i64, index: i64) -> DataBlockRecord {
        DataBlockRecord {
            id,
            block_index: index,
            description: None,
            access_count: 0,
            latest_data_hash: None,
            last_updated: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_least_used_block_prefers_first_on_tie() {
        let blocks = vec![block(1, 0), block(2, 1), block(3, 2)];

        let usage = HashMap::new();
        assert_eq!(least_used_block(&blocks, &usage).unwrap().block_index, 0);

        let usage = HashMap::from([(0, 2), (1, 1), (2, 1)]);
        assert_eq!(least_used_block(&blocks, &usage).unwrap().block_index, 1);

        let usage = HashMap::from([(0, 1), (1, 1)]);
        assert_eq!(least_used_block(&blocks, &usage).unwrap().block_index, 2);

        assert!(least_used_block(&[], &usage).is_none());
    }

    #[tokio::test]
    async fn test_first_registration_bootstraps_blocks() {
        let registry = registry().await;
        let (h, _rx) = handle();

        let reg = registry.register_device(h, "wallet-1").await.unwrap();
        let assignment = reg.assignment.expect("new device gets a block");
        assert_eq!(assignment.block_index, 0);
        assert_eq!(registry.database().list_blocks().await.unwrap().len(), 10);
        assert_eq!(registry.database().count_devices().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_new_devices_spread_across_blocks() {
        let registry = registry().await;
        let mut seen = Vec::new();
        for i in 0..10 {
            let (h, _rx) = handle();
            let reg = registry.register_device(h, &format!("wallet-{i}")).await.unwrap();
            seen.push(reg.assignment.unwrap().block_index);
        }
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<i64>>());

        // Every block now has one device; the next one goes to block 0.
        let (h, _rx) = handle();
        let reg = registry.register_device(h, "wallet-10").await.unwrap();
        assert_eq!(reg.assignment.unwrap().block_index, 0);
    }

    #[tokio::test]
    async fn test_assignment_picks_a_least_used_block() {
        let registry = registry().await;
        for i in 0..7 {
            let (h, _rx) = handle();
            registry.register_device(h, &format!("wallet-{i}")).await.unwrap();
        }

        let before = registry.database().block_usage().await.unwrap();
        let (h, _rx) = handle();
        let chosen = registry
            .register_device(h, "wallet-new")
            .await
            .unwrap()
            .assignment
            .unwrap()
            .block_index;

        let chosen_before = before.get(&chosen).copied().unwrap_or(0);
        for block in registry.database().list_blocks().await.unwrap() {
            let count = before.get(&block.block_index).copied().unwrap_or(0);
            assert!(count >= chosen_before, "block {} was less used", block.block_index);
        }
    }

    #[tokio::test]
    async fn test_reregistration_keeps_block_and_count() {
        let registry = registry().await;
        let (h, _rx) = handle();
        let first = registry.register_device(h, "wallet-1").await.unwrap();
        let block = first.assignment.unwrap().block_index;

        registry.handle_disconnect(&first.device_id).await;

        let (h, _rx) = handle();
        let second = registry.register_device(h, "wallet-1").await.unwrap();
        assert_eq!(second.device_id, first.device_id);
        assert!(second.assignment.is_none());
        assert_eq!(registry.database().count_devices().await.unwrap(), 1);

        let live = registry.get_connected_device(&second.device_id).await.unwrap();
        assert_eq!(live.data_block_index, Some(block));
        assert!(!live.is_ready);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let registry = registry().await;
        let (h, _rx) = handle();
        let reg = registry.register_device(h, "wallet-1").await.unwrap();

        registry.handle_disconnect(&reg.device_id).await;
        let once = registry.get_device(&reg.device_id).await.unwrap();
        registry.handle_disconnect(&reg.device_id).await;
        let twice = registry.get_device(&reg.device_id).await.unwrap();

        assert!(!once.is_online);
        assert_eq!(once.is_online, twice.is_online);
        assert_eq!(once.data_block_index, twice.data_block_index);
        assert_eq!(registry.connected_count().await, 0);

        registry.handle_disconnect("no-such-device").await;
    }

    #[tokio::test]
    async fn test_devices_for_block_requires_ready_and_matching_block() {
        let registry = registry().await;
        let (h, _rx) = handle();
        let reg = registry.register_device(h, "wallet-1").await.unwrap();
        let block = reg.assignment.unwrap().block_index;

        assert!(registry.get_devices_for_block(block).await.is_empty());

        assert!(registry.mark_device_ready(&reg.device_id).await);
        let devices = registry.get_devices_for_block(block).await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, reg.device_id);

        assert!(registry.get_devices_for_block(block + 1).await.is_empty());
        assert!(!registry.mark_device_ready("unknown").await);
    }

    #[tokio::test]
    async fn test_reward_updates() {
        let registry = registry().await;
        let (h, _rx) = handle();
        let reg = registry.register_device(h, "wallet-1").await.unwrap();

        registry.update_device_reward(&reg.device_id).await;
        registry.update_device_reward(&reg.device_id).await;
        registry.update_device_reward("unknown").await;

        let device = registry.get_device(&reg.device_id).await.unwrap();
        assert_eq!(device.provided_responses, 2);
        assert_eq!(device.reward_earned, 2_000);
    }

    #[tokio::test]
    async fn test_old_socket_close_keeps_new_registration() {
        let registry = registry().await;
        let (old, _old_rx) = handle();
        let old_id = old.id();
        let first = registry.register_device(old, "wallet-1").await.unwrap();

        // Re-register first, then the old socket's close arrives.
        let (new, _new_rx) = handle();
        let new_id = new.id();
        registry.register_device(new, "wallet-1").await.unwrap();
        assert_eq!(registry.release_connection(old_id).await, None);

        let live = registry.get_connected_device(&first.device_id).await.unwrap();
        assert_eq!(live.handle.id(), new_id);
        assert!(registry.get_device(&first.device_id).await.unwrap().is_online);

        // The new socket's own close still cleans up.
        assert_eq!(registry.release_connection(new_id).await, Some(first.device_id.clone()));
        assert_eq!(registry.connected_count().await, 0);
        assert!(!registry.get_device(&first.device_id).await.unwrap().is_online);
    }

    #[tokio::test]
    async fn test_concurrent_reconnect_and_close() {
        let registry = registry().await;
        let (old, _old_rx) = handle();
        let old_id = old.id();
        let first = registry.register_device(old, "wallet-1").await.unwrap();

        let (new, _new_rx) = handle();
        let new_id = new.id();
        let (registered, _) = tokio::join!(
            registry.register_device(new, "wallet-1"),
            registry.release_connection(old_id)
        );
        registered.unwrap();

        // Whichever ran first, the new socket ends up live and online.
        let live = registry.get_connected_device(&first.device_id).await;
        assert_eq!(live.map(|d| d.handle.id()), Some(new_id));
        assert!(registry.get_device(&first.device_id).await.unwrap().is_online);
    }

    #[tokio::test]
    async fn test_lookup_by_connection_and_key() {
        let registry = registry().await;
        let (h, _rx) = handle();
        let conn = h.id();
        let reg = registry.register_device(h, "wallet-1").await.unwrap();

        assert_eq!(registry.device_for_connection(conn).await, Some(reg.device_id.clone()));
        assert_eq!(registry.device_id_for_public_key("wallet-1").await, Some(reg.device_id));
        assert_eq!(registry.device_for_connection(Uuid::new_v4()).await, None);
    }

    #[tokio::test]
    async fn test_sync_is_recorded() {
        let registry = registry().await;
        let (h, _rx) = handle();
        let reg = registry.register_device(h, "wallet-1").await.unwrap();

        registry.record_device_sync(&reg.device_id, "hash-1", 1234).await;
        let device = registry.get_device(&reg.device_id).await.unwrap();
        assert_eq!(device.data_hash.as_deref(), Some("hash-1"));
        assert_eq!(device.last_block_sync, 1234);
    }

    #[tokio::test]
    async fn test_handle_send_and_close() {
        let (h, mut rx) = handle();
        assert!(h.send(&GatewayMessage::error("x")));
        h.close();
        assert!(matches!(rx.recv().await, Some(Outbound::Text(_))));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        drop(rx);
        assert!(h.is_closed());
        assert!(!h.send(&GatewayMessage::error("x")));
    }
}
