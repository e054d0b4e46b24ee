//! Relay configuration
//!
//! Every option is a plain environment override of a hardcoded default.
//! Missing or unparsable values fall back to the default silently.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Interval between liveness sweeps over the connection table.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A connection whose last ping is older than this is evicted.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum distance (in slots) between the chain height and a device's
/// reported position for its data to count as fresh.
pub const FRESHNESS_THRESHOLD: u64 = 50;

/// Number of data blocks created at bootstrap and used for routing.
pub const BLOCK_COUNT: u32 = 10;

/// Timeout for every call to the upstream Solana RPC node.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed decimal places of reward amounts (same precision as SOL).
pub const REWARD_DECIMALS: u32 = 9;

/// Which store backs the account cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    Redis,
    Memory,
}

impl FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(CacheBackendKind::Redis),
            "memory" => Ok(CacheBackendKind::Memory),
            other => Err(format!("unknown cache backend: {other}")),
        }
    }
}

/// Reward paid per accepted account response, in units of 10^-9.
/// Parsing rejects amounts above `i64::MAX` units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct RewardAmount(pub u64);

impl RewardAmount {
    pub fn units(&self) -> u64 {
        self.0
    }
}

impl FromStr for RewardAmount {
    type Err = String;

    /// Parses a non-negative decimal such as `0.000001` or `3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err("empty reward amount".to_string());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid reward amount: {s}"));
        }
        if frac.len() > REWARD_DECIMALS as usize {
            return Err(format!("reward amount has more than {REWARD_DECIMALS} decimals: {s}"));
        }

        let scale = 10u64.pow(REWARD_DECIMALS);
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| format!("invalid reward amount: {s}"))?
        };
        let frac_units: u64 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{:0<width$}", frac, width = REWARD_DECIMALS as usize);
            padded.parse().map_err(|_| format!("invalid reward amount: {s}"))?
        };

        whole
            .checked_mul(scale)
            .and_then(|w| w.checked_add(frac_units))
            .filter(|units| *units <= i64::MAX as u64)
            .map(RewardAmount)
            .ok_or_else(|| format!("reward amount out of range: {s}"))
    }
}

impl fmt::Display for RewardAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = 10u64.pow(REWARD_DECIMALS);
        write!(
            f,
            "{}.{:0width$}",
            self.0 / scale,
            self.0 % scale,
            width = REWARD_DECIMALS as usize
        )
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub http_port: u16,
    pub ws_port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub cache_backend: CacheBackendKind,
    pub redis_url: String,
    pub solana_rpc_url: String,
    pub reward_amount: RewardAmount,
    pub cache_ttl: Duration,
    pub device_wait: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            http_port: 3000,
            ws_port: 8080,
            database_url: "sqlite://chain_cloud.db?mode=rwc".to_string(),
            db_max_connections: 5,
            cache_backend: CacheBackendKind::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            solana_rpc_url: "https://api.devnet.solana.com".to_string(),
            reward_amount: RewardAmount(1_000),
            cache_ttl: Duration::from_secs(60),
            device_wait: Duration::from_millis(2000),
        }
    }
}

impl RelayConfig {
    /// Build the config from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| {
            let host = lookup("REDIS_HOST").unwrap_or_else(|| "localhost".to_string());
            let port = lookup("REDIS_PORT").unwrap_or_else(|| "6379".to_string());
            format!("redis://{}:{}", host, port)
        });

        Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            http_port: parse_or(&lookup, "PORT", defaults.http_port),
            ws_port: parse_or(&lookup, "WS_PORT", defaults.ws_port),
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", defaults.db_max_connections),
            cache_backend: parse_or(&lookup, "CACHE_BACKEND", defaults.cache_backend),
            redis_url,
            solana_rpc_url: lookup("SOLANA_RPC_URL").unwrap_or(defaults.solana_rpc_url),
            reward_amount: parse_or(&lookup, "REWARD_AMOUNT", defaults.reward_amount),
            cache_ttl: Duration::from_secs(parse_or(&lookup, "CACHE_TTL_SECS", defaults.cache_ttl.as_secs())),
            device_wait: Duration::from_millis(parse_or(
                &lookup,
                "DEVICE_WAIT_MS",
                defaults.device_wait.as_millis() as u64,
            )),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let config = RelayConfig::from_lookup(|_| None);
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.ws_port, 8080);
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.cache_backend, CacheBackendKind::Redis);
        assert_eq!(config.reward_amount, RewardAmount(1_000));
        assert_eq!(config.device_wait, Duration::from_secs(2));
    }

    #[test]
    fn test_overrides() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("PORT", "4000"),
            ("WS_PORT", "9090"),
            ("REDIS_HOST", "cache"),
            ("REDIS_PORT", "6380"),
            ("CACHE_BACKEND", "Memory"),
            ("REWARD_AMOUNT", "0.5"),
        ]));
        assert_eq!(config.http_port, 4000);
        assert_eq!(config.ws_port, 9090);
        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.cache_backend, CacheBackendKind::Memory);
        assert_eq!(config.reward_amount, RewardAmount(500_000_000));
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("PORT", "not-a-port"),
            ("REWARD_AMOUNT", "-1"),
            ("CACHE_BACKEND", "memcached"),
        ]));
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.reward_amount, RewardAmount(1_000));
        assert_eq!(config.cache_backend, CacheBackendKind::Redis);
    }

    #[test]
    fn test_redis_url_wins_over_host_port() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("REDIS_URL", "redis://10.0.0.1:7000"),
            ("REDIS_HOST", "ignored"),
        ]));
        assert_eq!(config.redis_url, "redis://10.0.0.1:7000");
    }

    #[test]
    fn test_reward_amount_parse_and_display() {
        assert_eq!("0.000001".parse::<RewardAmount>().unwrap(), RewardAmount(1_000));
        assert_eq!("2".parse::<RewardAmount>().unwrap(), RewardAmount(2_000_000_000));
        assert_eq!(".25".parse::<RewardAmount>().unwrap(), RewardAmount(250_000_000));
        assert!("0.0000000001".parse::<RewardAmount>().is_err());
        assert!("abc".parse::<RewardAmount>().is_err());
        assert!("".parse::<RewardAmount>().is_err());
        // Totals are stored as signed 64-bit integers.
        assert_eq!(
            "9223372036.854775807".parse::<RewardAmount>().unwrap(),
            RewardAmount(i64::MAX as u64)
        );
        assert!("9223372036.854775808".parse::<RewardAmount>().is_err());
        assert!("18446744073".parse::<RewardAmount>().is_err());

        assert_eq!(RewardAmount(1_000).to_string(), "0.000001000");
        assert_eq!(RewardAmount(2_500_000_000).to_string(), "2.500000000");
    }
}
