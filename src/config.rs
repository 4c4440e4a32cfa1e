use std::path::PathBuf;

use crate::model::{DAY_MS, Ms};

/// Tunables consumed by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Minimum distance between "now" and the first proposable start.
    pub min_lead_time_ms: Ms,
    pub horizon_days: u32,
    pub capture_max_attempts: u32,
    pub capture_backoff_ms: u64,
    /// Pending authorizations older than this are expired by the reaper.
    pub authorization_ttl_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_lead_time_ms: 0,
            horizon_days: 180,
            capture_max_attempts: 3,
            capture_backoff_ms: 200,
            authorization_ttl_ms: 7 * DAY_MS,
        }
    }
}

/// Process configuration, read from `BOOKD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|s| s.parse().ok())
        }

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            min_lead_time_ms: parsed(&lookup, "BOOKD_MIN_LEAD_TIME_MS")
                .unwrap_or(defaults.min_lead_time_ms),
            horizon_days: parsed(&lookup, "BOOKD_HORIZON_DAYS")
                .unwrap_or(defaults.horizon_days)
                .clamp(1, crate::limits::MAX_HORIZON_DAYS),
            capture_max_attempts: parsed(&lookup, "BOOKD_CAPTURE_MAX_ATTEMPTS")
                .unwrap_or(defaults.capture_max_attempts)
                .clamp(1, crate::limits::MAX_CAPTURE_ATTEMPTS),
            capture_backoff_ms: parsed(&lookup, "BOOKD_CAPTURE_BACKOFF_MS")
                .unwrap_or(defaults.capture_backoff_ms),
            authorization_ttl_ms: parsed(&lookup, "BOOKD_AUTHORIZATION_TTL_MS")
                .unwrap_or(defaults.authorization_ttl_ms),
        };

        Self {
            port: parsed(&lookup, "BOOKD_PORT").unwrap_or(5433),
            bind: lookup("BOOKD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("BOOKD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: lookup("BOOKD_PASSWORD").unwrap_or_else(|| "bookd".into()),
            max_connections: parsed(&lookup, "BOOKD_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&lookup, "BOOKD_COMPACT_THRESHOLD").unwrap_or(1000),
            tls_cert: lookup("BOOKD_TLS_CERT"),
            tls_key: lookup("BOOKD_TLS_KEY"),
            metrics_port: parsed(&lookup, "BOOKD_METRICS_PORT"),
            engine,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookd.wal")
    }
}
