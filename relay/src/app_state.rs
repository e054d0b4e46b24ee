use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::account_cache::AccountCache;
use crate::config::{RelayConfig, BLOCK_COUNT};
use crate::database::Database;
use crate::device_registry::DeviceRegistry;
use crate::gateway::Gateway;
use crate::upstream_rpc::UpstreamRpc;

/// Shared by the HTTP handlers, the gateway and the background sweep.
pub struct AppState {
    // Server start time for uptime tracking
    pub start_time: Instant,

    pub registry: Arc<DeviceRegistry>,
    pub cache: Arc<AccountCache>,
    pub upstream: Arc<UpstreamRpc>,
    pub gateway: Arc<Gateway>,

    /// Upper bound on how long `/rpc` waits for a device to answer.
    pub device_wait: Duration,
}

impl AppState {
    /// Wire the components together around an open database and cache.
    pub fn new(config: &RelayConfig, db: Database, cache: AccountCache) -> Self {
        let cache = Arc::new(cache);
        let upstream = Arc::new(UpstreamRpc::new(&config.solana_rpc_url, cache.clone(), config.cache_ttl));
        let registry = Arc::new(DeviceRegistry::new(db, config.reward_amount, BLOCK_COUNT));
        let gateway = Arc::new(Gateway::new(
            registry.clone(),
            cache.clone(),
            upstream.clone(),
            config.cache_ttl,
        ));

        Self {
            start_time: Instant::now(),
            registry,
            cache,
            upstream,
            gateway,
            device_wait: config.device_wait,
        }
    }
}
