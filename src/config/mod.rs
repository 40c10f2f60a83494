// =============================================================================
// Matrixon Sliding Sync Proxy - Configuration Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Process-wide configuration. Values come from an optional TOML file merged
//   with `SYNCV3_`-prefixed environment variables, so deployments of the
//   original proxy keep working unchanged.
//
// =============================================================================

use std::{net::SocketAddr, path::Path, time::Duration};

use figment::{
    providers::{Env, Format, Toml},
    value::{Uncased, UncasedStr},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Sub tables that can be set through `SYNCV3_<TABLE>_<KEY>` variables
static SUB_TABLES: [&str; 3] = ["poller", "sliding_sync", "cache"];

/// Short environment names used by the original deployment
static ENV_ALIASES: [(&str, &str); 4] = [
    ("db", "database_url"),
    ("bindaddr", "bind_address"),
    ("prom", "prometheus_address"),
    ("pprof", "pprof_address"),
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Homeserver client-server API base URL, e.g. `https://matrix-client.matrix.org`
    pub server: String,

    /// Encrypts stored access tokens; must stay the same for the lifetime of the database
    pub secret: String,

    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// `memory` or `postgresql`; unset means `postgresql` when `database_url` is given
    #[serde(default)]
    pub database_backend: Option<String>,

    /// Postgres connection string, required by the `postgresql` backend
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_log")]
    pub log: String,

    #[serde(default, deserialize_with = "deserialize_flag")]
    pub debug: bool,

    /// Serve Prometheus metrics on this address when set
    #[serde(default)]
    pub prometheus_address: Option<SocketAddr>,

    /// Accepted for compatibility, profiling is not served by this proxy
    #[serde(default)]
    pub pprof_address: Option<String>,

    #[serde(default)]
    pub poller: PollerConfig,

    #[serde(default)]
    pub sliding_sync: SlidingSyncConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// Upstream poller tunables
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Long-poll timeout sent to the homeserver
    pub poll_timeout_ms: u64,

    /// First backoff delay after a transient failure
    pub backoff_base_ms: u64,

    /// Backoff ceiling
    pub backoff_max_ms: u64,

    /// Immediate retries at the same cursor for a truncated response
    pub max_partial_retries: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 30_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            max_partial_retries: 3,
        }
    }
}

impl PollerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Client-facing engine tunables
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SlidingSyncConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_window_size: u64,
    pub default_timeline_limit: u64,
    pub max_timeline_limit: u64,
    pub session_ttl_s: u64,
    pub cleanup_interval_s: u64,
    pub max_sessions_per_device: usize,
}

impl Default for SlidingSyncConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 60_000,
            max_window_size: 100,
            default_timeline_limit: 10,
            max_timeline_limit: 50,
            session_ttl_s: 30 * 60,
            cleanup_interval_s: 60,
            max_sessions_per_device: 10,
        }
    }
}

impl SlidingSyncConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_s)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_s)
    }

    /// Clamp a requested long-poll timeout
    pub fn wait_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_timeout_ms)
            .min(self.max_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Shared cache retention
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Timeline events kept per room
    pub timeline_retention: usize,

    /// How many commits behind the head a client cursor may be
    pub cursor_retention: u64,

    /// Recency granularity for the room ordering; 0 orders by exact timestamp
    pub recency_bucket_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            timeline_retention: 50,
            cursor_retention: 10_000,
            recency_bucket_ms: 0,
        }
    }
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8008))
}

fn default_log() -> String {
    "info".to_owned()
}

/// Accepts `true`, `1`, `"1"`, `"true"` and friends
fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Str(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Int(value) => value != 0,
        Flag::Str(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
    })
}

impl Config {
    /// Load from an optional TOML file and `SYNCV3_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            info!("📁 Using configuration file: {}", path.display());
            figment = figment.merge(Toml::file(path));
        }

        let figment = figment.merge(Env::prefixed("SYNCV3_").map(env_key));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| Error::bad_config(e.to_string()))?;
        config.validate()?;
        debug!("🔧 Configuration loaded: backend={}", config.backend());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.server.starts_with("http://") || self.server.starts_with("https://")) {
            return Err(Error::bad_config(
                "server must be an http(s) URL of the homeserver",
            ));
        }

        if self.secret.is_empty() {
            return Err(Error::bad_config("secret must not be empty"));
        }

        match self.backend() {
            "memory" => {}
            "postgresql" if self.database_url.is_none() => {
                return Err(Error::bad_config(
                    "database_url is required for the postgresql backend",
                ));
            }
            "postgresql" => {}
            other => {
                return Err(Error::bad_config(format!(
                    "unknown database_backend {other}"
                )))
            }
        }

        if self.sliding_sync.max_window_size == 0 {
            return Err(Error::bad_config("sliding_sync.max_window_size must be positive"));
        }

        if self.sliding_sync.cleanup_interval_s == 0 {
            return Err(Error::bad_config("sliding_sync.cleanup_interval_s must be positive"));
        }

        Ok(())
    }

    /// Storage engine to open
    pub fn backend(&self) -> &str {
        match (&self.database_backend, &self.database_url) {
            (Some(backend), _) => backend,
            (None, Some(_)) => "postgresql",
            (None, None) => "memory",
        }
    }

    /// Effective tracing filter
    pub fn log_filter(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log
        }
    }
}

fn env_key(key: &UncasedStr) -> Uncased<'_> {
    let key = key.as_str().to_ascii_lowercase();

    for (alias, target) in ENV_ALIASES {
        if key == alias {
            return Uncased::from(target.to_owned());
        }
    }

    for table in SUB_TABLES {
        if let Some(rest) = key.strip_prefix(&(table.to_owned() + "_")) {
            return Uncased::from(format!("{table}.{rest}"));
        }
    }

    Uncased::from(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Serialized;

    fn base() -> Figment {
        Figment::new()
            .merge(Serialized::default("server", "https://matrix.example.org"))
            .merge(Serialized::default("secret", "s3cr3t"))
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_figment(base()).unwrap();

        assert_eq!(config.bind_address, default_bind_address());
        assert_eq!(config.backend(), "memory");
        assert_eq!(config.poller.backoff_max_ms, 60_000);
        assert_eq!(config.cache.timeline_retention, 50);
        assert!(!config.debug);
        assert_eq!(config.log_filter(), "info");
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let figment = Figment::new().merge(Serialized::default("server", "https://hs"));
        assert!(Config::from_figment(figment).is_err());
    }

    #[test]
    fn test_postgres_requires_url() {
        let figment = base().merge(Serialized::default("database_backend", "postgresql"));
        assert!(matches!(Config::from_figment(figment), Err(Error::BadConfig(_))));
    }

    #[test]
    fn test_database_url_alone_selects_postgres() {
        let config = Config::from_figment(
            base().merge(Serialized::default("database_url", "postgres://u@h/db")),
        )
        .unwrap();
        assert_eq!(config.backend(), "postgresql");

        let config = Config::from_figment(
            base()
                .merge(Serialized::default("database_url", "postgres://u@h/db"))
                .merge(Serialized::default("database_backend", "memory")),
        )
        .unwrap();
        assert_eq!(config.backend(), "memory");
    }

    #[test]
    fn test_db_env_alias_selects_postgres() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SYNCV3_SERVER", "https://matrix.example.org");
            jail.set_env("SYNCV3_SECRET", "s3cr3t");
            jail.set_env("SYNCV3_DB", "postgres://u@h/db");

            let config = Config::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.database_url.as_deref(), Some("postgres://u@h/db"));
            assert_eq!(config.backend(), "postgresql");
            Ok(())
        });
    }

    #[test]
    fn test_debug_flag_accepts_numbers() {
        let config = Config::from_figment(base().merge(Serialized::default("debug", 1))).unwrap();
        assert!(config.debug);
        assert_eq!(config.log_filter(), "debug");

        let config =
            Config::from_figment(base().merge(Serialized::default("debug", "0"))).unwrap();
        assert!(!config.debug);
    }

    #[test]
    fn test_wait_timeout_is_clamped() {
        let config = SlidingSyncConfig::default();
        assert_eq!(config.wait_timeout(None), Duration::from_millis(30_000));
        assert_eq!(config.wait_timeout(Some(5)), Duration::from_millis(5));
        assert_eq!(config.wait_timeout(Some(10_000_000)), Duration::from_millis(60_000));
    }

    #[test]
    fn test_env_key_mapping() {
        assert_eq!(env_key(UncasedStr::new("DB")).as_str(), "database_url");
        assert_eq!(env_key(UncasedStr::new("BINDADDR")).as_str(), "bind_address");
        assert_eq!(env_key(UncasedStr::new("POLLER_BACKOFF_MAX_MS")).as_str(), "poller.backoff_max_ms");
        assert_eq!(env_key(UncasedStr::new("SERVER")).as_str(), "server");
    }
}
