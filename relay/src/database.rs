//! Durable device registry tables
//!
//! Two tables: `devices` (unique by public key) and `data_blocks` (unique by
//! block index). Counters are bumped in SQL so callers never write back a
//! value read before an await.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{prelude::FromRow, Pool, Sqlite};
use tokio::time::Instant;

/// Durable record of a device, created on first registration.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DeviceRecord {
    pub id: String,
    pub public_key: String,
    pub last_block_sync: i64,
    pub data_block_index: Option<i64>,
    pub is_online: bool,
    pub data_hash: Option<String>,
    pub last_seen: Option<i64>,
    pub provided_responses: i64,
    /// Accumulated reward in units of 10^-9
    pub reward_earned: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DataBlockRecord {
    pub id: i64,
    pub block_index: i64,
    pub description: Option<String>,
    pub access_count: i64,
    pub latest_data_hash: Option<String>,
    pub last_updated: Option<i64>,
    pub created_at: i64,
}

/// SQLite integers are signed; larger values are rejected, never wrapped.
fn to_sql_integer(value: u64) -> Result<i64, sqlx::Error> {
    i64::try_from(value).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Database { pool }
    }

    /// Open a pool for `url` and apply the migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        let db = Database::new(pool);
        db.migrate().await?;
        Ok(db)
    }

    /// Single-connection in-memory database, used by tests.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Database::new(pool);
        db.migrate().await?;
        Ok(db)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)
    }

    // ========== Devices ==========

    /// Create the device if its public key is new, otherwise mark it online.
    /// Either way the row comes back online with a fresh `last_seen`.
    pub async fn upsert_device_online(&self, public_key: &str) -> Result<DeviceRecord, sqlx::Error> {
        let now = Instant::now();
        let ts = Utc::now().timestamp();
        let id = uuid::Uuid::new_v4().to_string();

        let device = sqlx::query_as::<_, DeviceRecord>(
            r#"
            INSERT INTO devices (
                id, public_key, is_online, last_seen, created_at, updated_at
            ) VALUES (?, ?, 1, ?, ?, ?)
            ON CONFLICT(public_key) DO UPDATE SET
                is_online = 1,
                last_seen = excluded.last_seen,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(public_key)
        .bind(ts)
        .bind(ts)
        .bind(ts)
        .fetch_one(&self.pool)
        .await?;

        let elapsed = now.elapsed().as_millis();
        if elapsed >= 1000 {
            tracing::warn!("Long Query: device upsert took {}ms", elapsed);
        }
        Ok(device)
    }

    pub async fn get_device(&self, id: &str) -> Result<Option<DeviceRecord>, sqlx::Error> {
        sqlx::query_as::<_, DeviceRecord>("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn count_devices(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await
    }

    /// Assign a block only if the device still has none.
    /// Returns the index the device ends up with.
    pub async fn assign_block_if_unset(&self, id: &str, block_index: i64) -> Result<Option<i64>, sqlx::Error> {
        let ts = Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE devices
            SET data_block_index = ?, updated_at = ?
            WHERE id = ? AND data_block_index IS NULL
            "#,
        )
        .bind(block_index)
        .bind(ts)
        .bind(id)
        .execute(&self.pool)
        .await?;

        sqlx::query_scalar::<_, Option<i64>>("SELECT data_block_index FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map(Option::flatten)
    }

    /// Returns false when no row matched.
    pub async fn mark_device_offline(&self, id: &str) -> Result<bool, sqlx::Error> {
        let ts = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE devices SET is_online = 0, last_seen = ?, updated_at = ? WHERE id = ?",
        )
        .bind(ts)
        .bind(ts)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns false when no row matched. The total saturates at `i64::MAX`.
    pub async fn add_device_reward(&self, id: &str, reward_units: u64) -> Result<bool, sqlx::Error> {
        let units = to_sql_integer(reward_units)?;
        let ts = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET provided_responses = provided_responses + 1,
                reward_earned = CASE
                    WHEN reward_earned > 9223372036854775807 - ? THEN 9223372036854775807
                    ELSE reward_earned + ?
                END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(units)
        .bind(units)
        .bind(ts)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_device_sync(&self, id: &str, data_hash: &str, block_sync: u64) -> Result<bool, sqlx::Error> {
        let block_sync = to_sql_integer(block_sync)?;
        let ts = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET data_hash = ?, last_block_sync = ?, last_seen = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(data_hash)
        .bind(block_sync)
        .bind(ts)
        .bind(ts)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of durable devices assigned to each block index.
    pub async fn block_usage(&self) -> Result<HashMap<i64, i64>, sqlx::Error> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT data_block_index, COUNT(*)
            FROM devices
            WHERE data_block_index IS NOT NULL
            GROUP BY data_block_index
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    // ========== Data blocks ==========

    /// All blocks in insertion order.
    pub async fn list_blocks(&self) -> Result<Vec<DataBlockRecord>, sqlx::Error> {
        sqlx::query_as::<_, DataBlockRecord>("SELECT * FROM data_blocks ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
    }

    /// Create blocks `0..count` in one transaction. Existing indices are left alone.
    pub async fn bootstrap_blocks(&self, count: u32) -> Result<(), sqlx::Error> {
        let ts = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for index in 0..count {
            sqlx::query(
                r#"
                INSERT INTO data_blocks (block_index, description, created_at)
                VALUES (?, ?, ?)
                ON CONFLICT(block_index) DO NOTHING
                "#,
            )
            .bind(index as i64)
            .bind(format!("Initial data block {}", index))
            .bind(ts)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        tracing::info!("Bootstrapped {} data blocks", count);
        Ok(())
    }

    pub async fn record_block_access(&self, block_index: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE data_blocks SET access_count = access_count + 1 WHERE block_index = ?")
            .bind(block_index)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_block_data(&self, block_index: i64, data_hash: &str) -> Result<(), sqlx::Error> {
        let ts = Utc::now().timestamp();
        sqlx::query("UPDATE data_blocks SET latest_data_hash = ?, last_updated = ? WHERE block_index = ?")
            .bind(data_hash)
            .bind(ts)
            .bind(block_index)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_block(&self, block_index: i64) -> Result<Option<DataBlockRecord>, sqlx::Error> {
        sqlx::query_as::<_, DataBlockRecord>("SELECT * FROM data_blocks WHERE block_index = ?")
            .bind(block_index)
            .fetch_optional(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_creates_then_reuses() {
        let db = Database::connect_in_memory().await.unwrap();

        let first = db.upsert_device_online("wallet-1").await.unwrap();
        assert!(first.is_online);
        assert_eq!(first.data_block_index, None);
        assert_eq!(db.count_devices().await.unwrap(), 1);

        assert!(db.mark_device_offline(&first.id).await.unwrap());
        let second = db.upsert_device_online("wallet-1").await.unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.is_online);
        assert_eq!(db.count_devices().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_assign_block_only_once() {
        let db = Database::connect_in_memory().await.unwrap();
        db.bootstrap_blocks(3).await.unwrap();
        let device = db.upsert_device_online("wallet-1").await.unwrap();

        assert_eq!(db.assign_block_if_unset(&device.id, 2).await.unwrap(), Some(2));
        assert_eq!(db.assign_block_if_unset(&device.id, 0).await.unwrap(), Some(2));
        assert_eq!(db.block_usage().await.unwrap().get(&2), Some(&1));
    }

    #[tokio::test]
    async fn test_reward_accumulates() {
        let db = Database::connect_in_memory().await.unwrap();
        let device = db.upsert_device_online("wallet-1").await.unwrap();

        assert!(db.add_device_reward(&device.id, 1_000).await.unwrap());
        assert!(db.add_device_reward(&device.id, 1_000).await.unwrap());
        assert!(!db.add_device_reward("missing", 1_000).await.unwrap());

        let device = db.get_device(&device.id).await.unwrap().unwrap();
        assert_eq!(device.provided_responses, 2);
        assert_eq!(device.reward_earned, 2_000);
    }

    #[tokio::test]
    async fn test_out_of_range_values_never_wrap() {
        let db = Database::connect_in_memory().await.unwrap();
        let device = db.upsert_device_online("wallet-1").await.unwrap();

        assert!(db.add_device_reward(&device.id, u64::MAX).await.is_err());
        assert!(db.record_device_sync(&device.id, "h", u64::MAX).await.is_err());
        let unchanged = db.get_device(&device.id).await.unwrap().unwrap();
        assert_eq!(unchanged.reward_earned, 0);
        assert_eq!(unchanged.provided_responses, 0);

        // The largest representable reward saturates instead of overflowing.
        let max = i64::MAX as u64;
        assert!(db.add_device_reward(&device.id, max).await.unwrap());
        assert!(db.add_device_reward(&device.id, max).await.unwrap());
        let saturated = db.get_device(&device.id).await.unwrap().unwrap();
        assert_eq!(saturated.reward_earned, i64::MAX);
        assert_eq!(saturated.provided_responses, 2);
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let db = Database::connect_in_memory().await.unwrap();
        db.bootstrap_blocks(10).await.unwrap();
        db.bootstrap_blocks(10).await.unwrap();

        let blocks = db.list_blocks().await.unwrap();
        assert_eq!(blocks.len(), 10);
        assert_eq!(blocks[0].block_index, 0);
        assert_eq!(blocks[9].description.as_deref(), Some("Initial data block 9"));
    }

    #[tokio::test]
    async fn test_block_counters() {
        let db = Database::connect_in_memory().await.unwrap();
        db.bootstrap_blocks(2).await.unwrap();

        db.record_block_access(1).await.unwrap();
        db.record_block_access(1).await.unwrap();
        db.record_block_data(1, "hash-abc").await.unwrap();

        let block = db.get_block(1).await.unwrap().unwrap();
        assert_eq!(block.access_count, 2);
        assert_eq!(block.latest_data_hash.as_deref(), Some("hash-abc"));
        assert!(block.last_updated.is_some());
    }
}
