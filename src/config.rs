//! TOML configuration.
//!
//! Every field has a default, so an empty file (or no section at all) yields a
//! runnable in-process setup with only the HTTP frontend enabled.

use crate::archiver::ArchiverOptions;
use crate::coalescer::CoalescerConfig;
use crate::error::{GilesError, Result};
use crate::pool::Backoff;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub archiver: ArchiverSection,
    pub mongo: MongoSection,
    pub btrdb: BtrdbSection,
    pub bosswave: BosswaveSection,
    pub http: HttpSection,
    pub tcpjson: TcpJsonSection,
    pub msgpackudp: MsgPackUdpSection,
    pub websocket: WebSocketSection,
    pub profile: ProfileSection,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| GilesError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        text.parse()
    }
}

impl FromStr for Config {
    type Err = GilesError;

    fn from_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| GilesError::Config(e.to_string()))
    }
}

/// Which time-series engine readings are flushed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Btrdb,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverSection {
    pub engine: EngineKind,
    pub log_level: String,
    pub coalesce_max: usize,
    pub coalesce_timeout_ms: u64,
    pub flush_workers: usize,
    pub subscriber_capacity: usize,
    pub query_cache_capacity: usize,
    pub query_cache_ttl_secs: u64,
}

impl Default for ArchiverSection {
    fn default() -> Self {
        let options = ArchiverOptions::default();
        Self {
            engine: EngineKind::default(),
            log_level: "info".to_string(),
            coalesce_max: options.coalescer.max,
            coalesce_timeout_ms: options.coalescer.timeout.as_millis() as u64,
            flush_workers: options.coalescer.workers,
            subscriber_capacity: options.subscriber_capacity,
            query_cache_capacity: options.query_cache_capacity,
            query_cache_ttl_secs: options.query_cache_ttl.as_secs(),
        }
    }
}

impl ArchiverSection {
    pub fn options(&self) -> ArchiverOptions {
        ArchiverOptions {
            coalescer: CoalescerConfig {
                max: self.coalesce_max.max(1),
                timeout: Duration::from_millis(self.coalesce_timeout_ms),
                workers: self.flush_workers.max(1),
            },
            subscriber_capacity: self.subscriber_capacity.max(1),
            query_cache_capacity: self.query_cache_capacity,
            query_cache_ttl: Duration::from_secs(self.query_cache_ttl_secs),
        }
    }
}

/// Metadata store settings. Only the in-process store is bundled; `address`
/// is accepted so existing deployments keep parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoSection {
    pub address: Option<String>,
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BtrdbSection {
    pub address: String,
    pub connections: usize,
    pub backoff_initial_ms: u64,
    pub backoff_ceiling_secs: u64,
}

impl Default for BtrdbSection {
    fn default() -> Self {
        let backoff = Backoff::default();
        Self {
            address: "127.0.0.1:4410".to_string(),
            connections: 20,
            backoff_initial_ms: backoff.initial.as_millis() as u64,
            backoff_ceiling_secs: backoff.ceiling.as_secs(),
        }
    }
}

impl BtrdbSection {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.backoff_initial_ms.max(1)),
            ceiling: Duration::from_secs(self.backoff_ceiling_secs.max(1)),
        }
    }
}

/// Message bus frontend, spoken over MQTT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BosswaveSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub ingest_topic: String,
    pub query_topic: String,
    pub response_topic: String,
}

impl Default for BosswaveSection {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "giles".to_string(),
            keep_alive_secs: 30,
            ingest_topic: "giles/ingest".to_string(),
            query_topic: "giles/query".to_string(),
            response_topic: "giles/response".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self { enabled: true, address: "0.0.0.0".to_string(), port: 8079 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpJsonSection {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

impl Default for TcpJsonSection {
    fn default() -> Self {
        Self { enabled: false, address: "0.0.0.0".to_string(), port: 8002 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgPackUdpSection {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MsgPackUdpSection {
    fn default() -> Self {
        Self { enabled: false, port: 8003 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSection {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self { enabled: false, address: "0.0.0.0".to_string(), port: 8078 }
    }
}

/// Periodic statistics logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSection {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for ProfileSection {
    fn default() -> Self {
        Self { enabled: false, interval_secs: 60 }
    }
}

impl ProfileSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
        assert!(config.http.enabled);
        assert_eq!(config.archiver.coalesce_max, 16_384);
        assert_eq!(config.archiver.engine, EngineKind::Btrdb);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = r#"
            [archiver]
            engine = "memory"
            coalesce_timeout_ms = 250

            [btrdb]
            connections = 4
        "#
        .parse()
        .unwrap();
        assert_eq!(config.archiver.engine, EngineKind::Memory);
        assert_eq!(config.archiver.options().coalescer.timeout, Duration::from_millis(250));
        assert_eq!(config.archiver.flush_workers, 8);
        assert_eq!(config.btrdb.connections, 4);
        assert_eq!(config.btrdb.address, "127.0.0.1:4410");
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let err = "[archiver]\nengine = \"cassandra\"".parse::<Config>().unwrap_err();
        assert!(matches!(err, GilesError::Config(_)));
    }
}
