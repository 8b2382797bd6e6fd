//! Harvester configuration
//!
//! Loaded from the environment (and a `.env` file when present). Every setting has a
//! `DEFAULT_*` constant; `validate()` rejects values the pipeline cannot run with.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::queue::{DrainConfig, ProbeExhaustion};
use crate::stages::IdentifySettings;

// ============================================================================
// Storage
// ============================================================================

/// Default registry database
pub const DEFAULT_DATABASE_URL: &str = "sqlite://harvest.db?mode=rwc";

/// Default maximum connections per pool
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

// ============================================================================
// Collaborators
// ============================================================================

pub const DEFAULT_API_BASE_URL: &str = "https://api.osf.io/v2/";

/// Default base of record identity URIs
pub const DEFAULT_RECORD_BASE_URL: &str = "https://osf.io/";

pub const DEFAULT_STORE_BASE_URL: &str = "http://localhost:8080/api/";

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

// ============================================================================
// Queues and stages
// ============================================================================

/// Default run registry stream prefix
pub const DEFAULT_STREAM_BASE: &str = "harvest";

pub const DEFAULT_TRANSFORM_QUEUE: &str = "harvest.transform";

pub const DEFAULT_INGEST_QUEUE: &str = "harvest.ingest";

pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

pub const DEFAULT_USER_LOOKBACK_HOURS: i64 = 48;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

pub const DEFAULT_PROBE_FAIL_TOLERANCE: u32 = 10;

pub const DEFAULT_PROBE_GRACE_SECS: u64 = 10;

/// Default listener back-off while its queue is empty
pub const DEFAULT_LISTENER_IDLE_MS: u64 = 200;

/// Claims older than this are released at startup (1 hour)
pub const DEFAULT_STALE_CLAIM_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub queues: QueueConfig,
    pub identify: IdentifyConfig,
    pub drain: DrainSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Run and publish registries
    pub url: String,
    /// Durable queues; may be the same database
    pub queue_url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub record_base_url: String,
    pub page_size: u32,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub stream_base: String,
    pub transform_base: String,
    pub ingest_base: String,
    pub listener_idle_ms: u64,
    pub stale_claim_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyConfig {
    pub default_lookback_hours: i64,
    pub user_lookback_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainSettings {
    pub poll_interval_ms: u64,
    pub probe_fail_tolerance: u32,
    pub probe_grace_secs: u64,
    pub on_exhaustion: ProbeExhaustion,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                queue_url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            },
            source: SourceConfig {
                api_base_url: DEFAULT_API_BASE_URL.to_string(),
                api_token: None,
                record_base_url: DEFAULT_RECORD_BASE_URL.to_string(),
                page_size: DEFAULT_PAGE_SIZE,
                http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            },
            store: StoreConfig {
                base_url: DEFAULT_STORE_BASE_URL.to_string(),
                token: None,
            },
            queues: QueueConfig {
                stream_base: DEFAULT_STREAM_BASE.to_string(),
                transform_base: DEFAULT_TRANSFORM_QUEUE.to_string(),
                ingest_base: DEFAULT_INGEST_QUEUE.to_string(),
                listener_idle_ms: DEFAULT_LISTENER_IDLE_MS,
                stale_claim_secs: DEFAULT_STALE_CLAIM_SECS,
            },
            identify: IdentifyConfig {
                default_lookback_hours: DEFAULT_LOOKBACK_HOURS,
                user_lookback_hours: DEFAULT_USER_LOOKBACK_HOURS,
            },
            drain: DrainSettings {
                poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
                probe_fail_tolerance: DEFAULT_PROBE_FAIL_TOLERANCE,
                probe_grace_secs: DEFAULT_PROBE_GRACE_SECS,
                on_exhaustion: ProbeExhaustion::AssumeDrained,
            },
        }
    }
}

impl HarvestConfig {
    /// Load configuration from environment and defaults
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or("HARVEST_DATABASE_URL", DEFAULT_DATABASE_URL);
        let on_exhaustion = match env_opt("HARVEST_PROBE_EXHAUSTION") {
            Some(value) => value.parse::<ProbeExhaustion>()?,
            None => ProbeExhaustion::AssumeDrained,
        };

        let config = HarvestConfig {
            database: DatabaseConfig {
                queue_url: env_or("HARVEST_QUEUE_URL", &database_url),
                url: database_url,
                max_connections: env_parse(
                    "HARVEST_DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
            },
            source: SourceConfig {
                api_base_url: env_or("HARVEST_API_BASE_URL", DEFAULT_API_BASE_URL),
                api_token: env_opt("HARVEST_API_TOKEN"),
                record_base_url: env_or("HARVEST_RECORD_BASE_URL", DEFAULT_RECORD_BASE_URL),
                page_size: env_parse("HARVEST_PAGE_SIZE", DEFAULT_PAGE_SIZE),
                http_timeout_secs: env_parse("HARVEST_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
            },
            store: StoreConfig {
                base_url: env_or("HARVEST_STORE_BASE_URL", DEFAULT_STORE_BASE_URL),
                token: env_opt("HARVEST_STORE_TOKEN"),
            },
            queues: QueueConfig {
                stream_base: env_or("HARVEST_STREAM_BASE", DEFAULT_STREAM_BASE),
                transform_base: env_or("HARVEST_TRANSFORM_QUEUE", DEFAULT_TRANSFORM_QUEUE),
                ingest_base: env_or("HARVEST_INGEST_QUEUE", DEFAULT_INGEST_QUEUE),
                listener_idle_ms: env_parse("HARVEST_LISTENER_IDLE_MS", DEFAULT_LISTENER_IDLE_MS),
                stale_claim_secs: env_parse("HARVEST_STALE_CLAIM_SECS", DEFAULT_STALE_CLAIM_SECS),
            },
            identify: IdentifyConfig {
                default_lookback_hours: env_parse(
                    "HARVEST_DEFAULT_LOOKBACK_HOURS",
                    DEFAULT_LOOKBACK_HOURS,
                ),
                user_lookback_hours: env_parse(
                    "HARVEST_USER_LOOKBACK_HOURS",
                    DEFAULT_USER_LOOKBACK_HOURS,
                ),
            },
            drain: DrainSettings {
                poll_interval_ms: env_parse("HARVEST_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
                probe_fail_tolerance: env_parse(
                    "HARVEST_PROBE_FAIL_TOLERANCE",
                    DEFAULT_PROBE_FAIL_TOLERANCE,
                ),
                probe_grace_secs: env_parse("HARVEST_PROBE_GRACE_SECS", DEFAULT_PROBE_GRACE_SECS),
                on_exhaustion,
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() || self.database.queue_url.is_empty() {
            anyhow::bail!("Database URLs cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        for (name, value) in [
            ("API base URL", &self.source.api_base_url),
            ("record base URL", &self.source.record_base_url),
            ("store base URL", &self.store.base_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", name, value, e))?;
        }

        if self.source.page_size == 0 {
            anyhow::bail!("Page size must be greater than 0");
        }
        if self.source.http_timeout_secs == 0 {
            anyhow::bail!("HTTP timeout must be greater than 0");
        }

        for (name, value) in [
            ("stream base", &self.queues.stream_base),
            ("transform queue", &self.queues.transform_base),
            ("ingest queue", &self.queues.ingest_base),
        ] {
            if value.is_empty() {
                anyhow::bail!("The {} name cannot be empty", name);
            }
        }
        if self.queues.transform_base == self.queues.ingest_base {
            anyhow::bail!("Transform and ingest queues must have different base names");
        }

        if self.identify.default_lookback_hours <= 0 || self.identify.user_lookback_hours <= 0 {
            anyhow::bail!("Lookback windows must be positive");
        }
        if self.drain.poll_interval_ms == 0 {
            anyhow::bail!("Poll interval must be greater than 0");
        }

        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.source.http_timeout_secs)
    }

    pub fn listener_idle(&self) -> Duration {
        Duration::from_millis(self.queues.listener_idle_ms)
    }

    pub fn stale_claim_age(&self) -> Duration {
        Duration::from_secs(self.queues.stale_claim_secs)
    }

    pub fn drain_config(&self) -> DrainConfig {
        DrainConfig {
            poll_interval: Duration::from_millis(self.drain.poll_interval_ms),
            probe_failure_tolerance: self.drain.probe_fail_tolerance,
            grace_period: Duration::from_secs(self.drain.probe_grace_secs),
            on_exhaustion: self.drain.on_exhaustion,
        }
    }

    pub fn identify_settings(&self) -> IdentifySettings {
        IdentifySettings {
            stream_base: self.queues.stream_base.clone(),
            default_lookback: chrono::Duration::hours(self.identify.default_lookback_hours),
            user_lookback: chrono::Duration::hours(self.identify.user_lookback_hours),
        }
    }
}
