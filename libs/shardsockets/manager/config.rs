//! Manager-level configuration.

use crate::core::compression::TransportCompression;
use crate::core::config::{IdentifyProperties, ShardConfig, DEFAULT_GATEWAY_URL};
use crate::core::protocol::API_VERSION;
use crate::traits::{GatewayError, Result};
use std::time::Duration;

/// Minimum legal spacing between identify admissions in one concurrency
/// bucket.
pub const DEFAULT_SPAWN_SHARD_DELAY: Duration = Duration::from_millis(5_300);

/// How shard ids inside one concurrency bucket are split into workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerAssignment {
    /// Deal shard ids round-robin across a fixed number of workers.
    RoundRobin { workers: u32 },
    /// Cut the bucket's shard list into contiguous blocks of this size.
    Contiguous { shards_per_worker: u32 },
}

/// Full gateway topology and pacing configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: u64,
    pub url: String,
    pub version: u8,
    pub compression: TransportCompression,
    pub payload_compression: bool,
    pub properties: IdentifyProperties,
    pub total_shards: u32,
    pub first_shard_id: u32,
    pub last_shard_id: u32,
    /// Identify admission slots granted by the gateway (`max_concurrency`).
    pub max_concurrency: u32,
    pub spawn_shard_delay: Duration,
    pub worker_assignment: WorkerAssignment,
    /// When true, member requests carry a nonce and collect chunk responses.
    pub collect_member_responses: bool,
    /// Guild fill percentage above which a reshard is started.
    pub reshard_threshold_percent: f64,
    pub reshard_check_interval: Duration,
}

impl GatewayConfig {
    pub fn builder(token: impl Into<String>) -> GatewayConfigBuilder {
        GatewayConfigBuilder::new(token)
    }

    /// Per-shard connection config for a generation with `total_shards`.
    pub fn shard_config(&self, total_shards: u32) -> ShardConfig {
        ShardConfig {
            token: self.token.clone(),
            intents: self.intents,
            url: self.url.clone(),
            version: self.version,
            total_shards,
            compression: self.compression,
            payload_compression: self.payload_compression,
            properties: self.properties.clone(),
        }
    }
}

/// Builder for [`GatewayConfig`]; only the token is required.
#[derive(Debug, Clone)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
    last_shard_id: Option<u32>,
}

impl GatewayConfigBuilder {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            config: GatewayConfig {
                token: token.into(),
                intents: 0,
                url: DEFAULT_GATEWAY_URL.to_owned(),
                version: API_VERSION,
                compression: TransportCompression::None,
                payload_compression: false,
                properties: IdentifyProperties::default(),
                total_shards: 1,
                first_shard_id: 0,
                last_shard_id: 0,
                max_concurrency: 1,
                spawn_shard_delay: DEFAULT_SPAWN_SHARD_DELAY,
                worker_assignment: WorkerAssignment::Contiguous {
                    shards_per_worker: 25,
                },
                collect_member_responses: true,
                reshard_threshold_percent: 80.0,
                reshard_check_interval: Duration::from_secs(8 * 60 * 60),
            },
            last_shard_id: None,
        }
    }

    pub fn intents(mut self, intents: u64) -> Self {
        self.config.intents = intents;
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn compression(mut self, compression: TransportCompression) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn payload_compression(mut self, enabled: bool) -> Self {
        self.config.payload_compression = enabled;
        self
    }

    pub fn properties(mut self, properties: IdentifyProperties) -> Self {
        self.config.properties = properties;
        self
    }

    pub fn total_shards(mut self, total: u32) -> Self {
        self.config.total_shards = total;
        self
    }

    pub fn shard_range(mut self, first: u32, last: u32) -> Self {
        self.config.first_shard_id = first;
        self.last_shard_id = Some(last);
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn spawn_shard_delay(mut self, delay: Duration) -> Self {
        self.config.spawn_shard_delay = delay;
        self
    }

    pub fn worker_assignment(mut self, assignment: WorkerAssignment) -> Self {
        self.config.worker_assignment = assignment;
        self
    }

    pub fn collect_member_responses(mut self, enabled: bool) -> Self {
        self.config.collect_member_responses = enabled;
        self
    }

    pub fn reshard_threshold_percent(mut self, percent: f64) -> Self {
        self.config.reshard_threshold_percent = percent;
        self
    }

    pub fn reshard_check_interval(mut self, interval: Duration) -> Self {
        self.config.reshard_check_interval = interval;
        self
    }

    pub fn build(mut self) -> Result<GatewayConfig> {
        if self.config.token.is_empty() {
            return Err(GatewayError::Configuration("token must not be empty".into()));
        }
        if self.config.total_shards == 0 {
            return Err(GatewayError::Configuration(
                "total_shards must be at least 1".into(),
            ));
        }
        if self.config.max_concurrency == 0 {
            return Err(GatewayError::Configuration(
                "max_concurrency must be at least 1".into(),
            ));
        }
        self.config.last_shard_id = self
            .last_shard_id
            .unwrap_or(self.config.total_shards - 1);
        if self.config.first_shard_id > self.config.last_shard_id {
            return Err(GatewayError::Configuration(
                "first_shard_id must not exceed last_shard_id".into(),
            ));
        }
        if self.config.last_shard_id >= self.config.total_shards {
            return Err(GatewayError::Configuration(
                "last_shard_id must be below total_shards".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_a_single_shard() {
        let config = GatewayConfig::builder("token").build().unwrap();
        assert_eq!(config.total_shards, 1);
        assert_eq!(config.first_shard_id, 0);
        assert_eq!(config.last_shard_id, 0);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn shard_range_defaults_to_the_full_topology() {
        let config = GatewayConfig::builder("token")
            .total_shards(8)
            .build()
            .unwrap();
        assert_eq!(config.last_shard_id, 7);
    }

    #[test]
    fn rejects_empty_token_and_bad_ranges() {
        assert!(GatewayConfig::builder("").build().is_err());
        assert!(GatewayConfig::builder("token")
            .total_shards(4)
            .shard_range(3, 1)
            .build()
            .is_err());
        assert!(GatewayConfig::builder("token")
            .total_shards(4)
            .shard_range(0, 9)
            .build()
            .is_err());
    }
}
