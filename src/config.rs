// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Daemon configuration.
//!
//! All options come from the environment at startup. The operator key is the
//! only required option; everything else has a default suitable for a local
//! development pool.

use anyhow::{anyhow, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool identity. Used as the topic namespace and signed into snapshots.
    pub pool_ens: String,
    /// Hex-encoded operator private key. Signing key for outgoing snapshots.
    pub operator_private_key: String,
    /// Seal cadence in seconds.
    pub epoch_duration_secs: u64,
    /// Claim reclamation horizon in seconds.
    pub claim_timeout_secs: u64,
    /// Heartbeat staleness threshold for the offline transition, in seconds.
    pub miner_timeout_secs: u64,
    /// Address of the content-store gateway.
    pub content_store_api: String,
    /// Address of the durable sidecar.
    pub sidecar_url: String,
    /// Address of the pub/sub gateway.
    pub pubsub_gateway: String,

    // Supervisor cadences. Overridable mainly so tests can tighten them.
    pub state_publish_interval_secs: u64,
    pub epoch_check_interval_secs: u64,
    pub claim_check_interval_secs: u64,
    pub heartbeat_check_interval_secs: u64,
}

impl PoolConfig {
    /// Build configuration from the environment.
    ///
    /// Fails if `OPERATOR_PRIVATE_KEY` is unset: a daemon that cannot sign
    /// its snapshots must refuse to start.
    pub fn from_env() -> Result<Self> {
        let operator_private_key = env::var("OPERATOR_PRIVATE_KEY")
            .map_err(|_| anyhow!("OPERATOR_PRIVATE_KEY is not set; refusing to start"))?;

        Ok(Self {
            pool_ens: env_or("POOL_ENS", "swarmpool.eth"),
            operator_private_key,
            epoch_duration_secs: env_parse("EPOCH_DURATION_SECS", 3600),
            claim_timeout_secs: env_parse("CLAIM_TIMEOUT_SECS", 300),
            miner_timeout_secs: env_parse("MINER_TIMEOUT_SECS", 120),
            content_store_api: env_or("CONTENT_STORE_API", "http://127.0.0.1:5522"),
            sidecar_url: env_or("SIDECAR_URL", "http://127.0.0.1:7379"),
            pubsub_gateway: env_or("PUBSUB_GATEWAY", "http://127.0.0.1:8645"),
            state_publish_interval_secs: env_parse("STATE_PUBLISH_INTERVAL_SECS", 10),
            epoch_check_interval_secs: env_parse("EPOCH_CHECK_INTERVAL_SECS", 60),
            claim_check_interval_secs: env_parse("CLAIM_CHECK_INTERVAL_SECS", 30),
            heartbeat_check_interval_secs: env_parse("HEARTBEAT_CHECK_INTERVAL_SECS", 30),
        })
    }

    /// Full topic name under the pool namespace, e.g. `swarmpool.eth/claims`.
    pub fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.pool_ens, suffix)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_ens: "swarmpool.eth".to_string(),
            operator_private_key: String::new(),
            epoch_duration_secs: 3600,
            claim_timeout_secs: 300,
            miner_timeout_secs: 120,
            content_store_api: "http://127.0.0.1:5522".to_string(),
            sidecar_url: "http://127.0.0.1:7379".to_string(),
            pubsub_gateway: "http://127.0.0.1:8645".to_string(),
            state_publish_interval_secs: 10,
            epoch_check_interval_secs: 60,
            claim_check_interval_secs: 30,
            heartbeat_check_interval_secs: 30,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_namespaced_under_pool() {
        let config = PoolConfig::default();
        assert_eq!(config.topic("jobs"), "swarmpool.eth/jobs");
        assert_eq!(config.topic("epochs/sealed"), "swarmpool.eth/epochs/sealed");
    }

    #[test]
    fn defaults_match_protocol_cadences() {
        let config = PoolConfig::default();
        assert_eq!(config.epoch_duration_secs, 3600);
        assert_eq!(config.claim_timeout_secs, 300);
        assert_eq!(config.miner_timeout_secs, 120);
    }
}
