//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use agora_shared::constants::{
    DEFAULT_CHALLENGE_TTL_SECS, DEFAULT_HTTP_PORT, DEFAULT_ONLINE_TIMEOUT_SECS,
    DEFAULT_SEND_INTERVAL_MS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API and WebSocket endpoint.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./agora.db`
    pub database_path: PathBuf,

    /// Window within which a user counts as online.
    /// Env: `ONLINE_TIMEOUT_SECS`
    /// Default: `30`
    pub online_timeout: Duration,

    /// Minimum gap between two sends before a challenge is issued.
    /// Env: `SEND_INTERVAL_MS`
    /// Default: `725`
    pub send_interval: Duration,

    /// Lifetime of an unsolved challenge.
    /// Env: `CHALLENGE_TTL_SECS`
    /// Default: `300`
    pub challenge_ttl: Duration,

    /// Outbound queue depth per connection. Events beyond it are dropped
    /// for that connection only.
    /// Env: `SUBSCRIBER_QUEUE_CAPACITY`
    /// Default: `256`
    pub subscriber_queue_capacity: usize,

    /// Create the reserved admin, a default room and a default section.
    /// Env: `SEED_DEFAULTS` (true/false)
    /// Default: `true`
    pub seed_defaults: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./agora.db"),
            online_timeout: Duration::from_secs(DEFAULT_ONLINE_TIMEOUT_SECS),
            send_interval: Duration::from_millis(DEFAULT_SEND_INTERVAL_MS),
            challenge_ttl: Duration::from_secs(DEFAULT_CHALLENGE_TTL_SECS),
            subscriber_queue_capacity: 256,
            seed_defaults: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parsed::<SocketAddr>(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.trim().is_empty()) {
            config.database_path = PathBuf::from(path);
        }

        if let Some(secs) = parsed::<u64>(&lookup, "ONLINE_TIMEOUT_SECS") {
            config.online_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = parsed::<u64>(&lookup, "SEND_INTERVAL_MS") {
            config.send_interval = Duration::from_millis(ms);
        }

        if let Some(secs) = parsed::<u64>(&lookup, "CHALLENGE_TTL_SECS") {
            config.challenge_ttl = Duration::from_secs(secs);
        }

        if let Some(n) = parsed::<usize>(&lookup, "SUBSCRIBER_QUEUE_CAPACITY") {
            if n == 0 {
                tracing::warn!("SUBSCRIBER_QUEUE_CAPACITY must be positive, using default");
            } else {
                config.subscriber_queue_capacity = n;
            }
        }

        if let Some(val) = lookup("SEED_DEFAULTS") {
            config.seed_defaults = val != "false" && val != "0";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.online_timeout, Duration::from_secs(30));
        assert_eq!(config.send_interval, Duration::from_millis(725));
        assert_eq!(config.challenge_ttl, Duration::from_secs(300));
        assert!(config.seed_defaults);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATABASE_PATH", "/tmp/x.db"),
            ("SEND_INTERVAL_MS", "100"),
            ("SEED_DEFAULTS", "false"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.send_interval, Duration::from_millis(100));
        assert!(!config.seed_defaults);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("ONLINE_TIMEOUT_SECS", "soon"),
            ("SUBSCRIBER_QUEUE_CAPACITY", "0"),
        ]);
        let defaults = ServerConfig::default();
        assert_eq!(config.http_addr, defaults.http_addr);
        assert_eq!(config.online_timeout, defaults.online_timeout);
        assert_eq!(config.subscriber_queue_capacity, defaults.subscriber_queue_capacity);
    }
}
