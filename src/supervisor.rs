// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Liveness and timeout supervision.
//!
//! Four periodic tasks, all cooperative and all tolerant of a missed tick:
//! the state publisher, the epoch manager, the claim-timeout checker, and
//! the heartbeat monitor. Each loop observes the shared shutdown flag at
//! its head and exits cleanly. The work of each tick is a separate method
//! taking an explicit `now`, so tests drive time directly.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::crypto::OperatorSigner;
use crate::epoch::EpochEngine;
use crate::schema::SNAPSHOT_VERSION;
use crate::state::PoolState;
use crate::storage::{ContentStore, SidecarStore};
use crate::transport::Transport;

/// Cooperative shutdown signal shared by the router and the periodic
/// tasks. Triggering it wakes sleeping tasks immediately; a task that is
/// mid-tick finishes its tick first.
pub struct Shutdown {
    running: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            notify: Notify::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Sleep for `duration` unless shutdown triggers first. Returns whether
    /// the daemon is still running.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = self.notify.notified() => {}
        }
        self.is_running()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }
}

/// Build the pool-state snapshot published for explorers and miners.
pub fn build_state_snapshot(state: &PoolState, operator: &str, now: i64) -> Value {
    json!({
        "type": "pool_state",
        "version": SNAPSHOT_VERSION,
        "pool": state.pool,
        "ts": now,
        "totals": {
            "jobs": state.total_jobs,
            "proofs": state.total_proofs,
            "volume": state.total_volume,
            "sealed_epochs": state.sealed_epochs,
        },
        "epoch": {
            "id": state.epoch.id,
            "name": state.epoch.name,
            "open_at": state.epoch.open_at,
            "jobs": state.epoch.jobs,
            "volume": state.epoch.volume,
            "proofs": state.epoch.proofs.len(),
        },
        "pending_jobs": state.pending_jobs,
        "claimed_jobs": state.claimed_jobs,
        "miners": state.active_miners,
        "stats": {
            "miners_online": state.online_miners(),
            "miners_total": state.active_miners.len(),
        },
        "last_updated": state.last_updated,
        "signing": {
            "scheme": "eip191",
            "did": format!("ens:{}", operator),
            "payload_hash": "",
            "signature": ""
        }
    })
}

pub struct Supervisor {
    config: Arc<PoolConfig>,
    state: Arc<RwLock<PoolState>>,
    store: Arc<dyn ContentStore>,
    sidecar: Arc<dyn SidecarStore>,
    transport: Arc<dyn Transport>,
    signer: Arc<OperatorSigner>,
    engine: Arc<EpochEngine>,
}

impl Supervisor {
    pub fn new(
        config: Arc<PoolConfig>,
        state: Arc<RwLock<PoolState>>,
        store: Arc<dyn ContentStore>,
        sidecar: Arc<dyn SidecarStore>,
        transport: Arc<dyn Transport>,
        signer: Arc<OperatorSigner>,
        engine: Arc<EpochEngine>,
    ) -> Self {
        Self {
            config,
            state,
            store,
            sidecar,
            transport,
            signer,
            engine,
        }
    }

    /// Sign and upload the current pool state, cache its identifier, and
    /// announce it. Consumers tolerate stale state, so any failure here is
    /// logged and retried on the next tick.
    pub async fn publish_state(&self, now: i64) -> Result<String> {
        let snapshot = {
            let state = self.state.read().await;
            build_state_snapshot(&state, self.signer.ens(), now)
        };
        let signed = self.signer.sign_snapshot(snapshot).await?;
        let cid = self
            .store
            .upload_json(&signed)
            .await
            .map_err(|e| anyhow!("state upload failed: {}", e))?;

        if let Err(e) = self.sidecar.set("pool:state:cid", &cid, None).await {
            warn!("failed to cache state cid: {}", e);
        }

        let event = json!({ "cid": cid, "timestamp": now });
        if let Err(e) = self
            .transport
            .publish(&self.config.topic("state"), &event)
            .await
        {
            warn!("failed to announce state: {}", e);
        }

        debug!("published pool state as {}", cid);
        Ok(cid)
    }

    /// Reclaim claims whose timeout has passed, returning their jobs to
    /// pending. The previous claimant is never banned.
    pub async fn check_claim_timeouts(&self, now: i64) {
        let reclaimed = {
            let mut state = self.state.write().await;
            state.reclaim_expired(now)
        };
        for (job_cid, miner) in reclaimed {
            info!("claim timed out: {} (was {})", job_cid, miner);
            let event = json!({ "job_cid": job_cid, "miner": miner, "timestamp": now });
            if let Err(e) = self
                .transport
                .publish(&self.config.topic("claims/timeout"), &event)
                .await
            {
                warn!("failed to announce claim timeout for {}: {}", job_cid, e);
            }
        }
    }

    /// Flip miners with stale heartbeats to offline.
    pub async fn check_heartbeats(&self, now: i64) {
        let transitioned = {
            let mut state = self.state.write().await;
            state.mark_stale_offline(now, self.config.miner_timeout_secs)
        };
        for miner in transitioned {
            info!("miner went offline: {}", miner);
        }
    }

    /// Seal the epoch when due.
    pub async fn check_epoch(&self, now: i64) {
        if self.engine.seal_due(now).await {
            if let Err(e) = self.engine.seal_and_rotate(now).await {
                warn!("epoch seal failed, will retry: {}", e);
            }
        }
    }

    pub async fn run_state_publisher(&self, shutdown: Arc<Shutdown>) {
        let interval = Duration::from_secs(self.config.state_publish_interval_secs);
        while shutdown.sleep(interval).await {
            if let Err(e) = self.publish_state(Utc::now().timestamp()).await {
                warn!("state publish failed, will retry: {}", e);
            }
        }
    }

    pub async fn run_epoch_manager(&self, shutdown: Arc<Shutdown>) {
        let interval = Duration::from_secs(self.config.epoch_check_interval_secs);
        while shutdown.sleep(interval).await {
            self.check_epoch(Utc::now().timestamp()).await;
        }
    }

    pub async fn run_claim_timeout_checker(&self, shutdown: Arc<Shutdown>) {
        let interval = Duration::from_secs(self.config.claim_check_interval_secs);
        while shutdown.sleep(interval).await {
            self.check_claim_timeouts(Utc::now().timestamp()).await;
        }
    }

    pub async fn run_heartbeat_monitor(&self, shutdown: Arc<Shutdown>) {
        let interval = Duration::from_secs(self.config.heartbeat_check_interval_secs);
        while shutdown.sleep(interval).await {
            self.check_heartbeats(Utc::now().timestamp()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemorySidecar, MockContentStore};
    use crate::transport::MockTransport;

    struct Fixture {
        supervisor: Supervisor,
        state: Arc<RwLock<PoolState>>,
        store: Arc<MockContentStore>,
        sidecar: Arc<MemorySidecar>,
        transport: Arc<MockTransport>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(PoolConfig::default());
        let state = Arc::new(RwLock::new(PoolState::new("swarmpool.eth", 1_000)));
        let store = Arc::new(MockContentStore::new());
        let sidecar = Arc::new(MemorySidecar::new());
        let transport = Arc::new(MockTransport::new());
        let signer = Arc::new(OperatorSigner::random("operator.swarmos.eth"));
        let engine = Arc::new(EpochEngine::new(
            config.clone(),
            state.clone(),
            store.clone(),
            sidecar.clone(),
            transport.clone(),
            signer.clone(),
        ));
        let supervisor = Supervisor::new(
            config,
            state.clone(),
            store.clone(),
            sidecar.clone(),
            transport.clone(),
            signer,
            engine,
        );
        Fixture {
            supervisor,
            state,
            store,
            sidecar,
            transport,
        }
    }

    #[tokio::test]
    async fn publish_state_uploads_and_announces() {
        let f = fixture();
        {
            let mut state = f.state.write().await;
            state.upsert_miner("alice.eth", vec![], vec![], "solo".to_string(), 1_000);
            state.accept_job("bafyjob", 1.5, 1_000);
        }

        let cid = f.supervisor.publish_state(2_000).await.unwrap();

        let snapshot = f.store.fetch_json(&cid).await.unwrap().unwrap();
        assert_eq!(snapshot["type"], "pool_state");
        assert_eq!(snapshot["totals"]["jobs"], 1);
        assert_eq!(snapshot["stats"]["miners_online"], 1);
        assert_eq!(snapshot["pending_jobs"][0], "bafyjob");
        assert!(snapshot["signing"]["signature"]
            .as_str()
            .unwrap()
            .starts_with("eip191:0x"));

        assert_eq!(
            f.sidecar.get("pool:state:cid").await.unwrap().as_deref(),
            Some(cid.as_str())
        );
        let events = f.transport.published_on("state");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["cid"].as_str().unwrap(), cid);
    }

    #[tokio::test]
    async fn timed_out_claim_returns_to_pending_once() {
        let f = fixture();
        {
            let mut state = f.state.write().await;
            state.upsert_miner("alice.eth", vec![], vec![], "solo".to_string(), 1_000);
            state.accept_job("bafyjob", 1.0, 1_000);
            state.accept_claim("bafyjob", "alice.eth", 1_000, 300);
        }

        f.supervisor.check_claim_timeouts(1_300).await;
        assert!(f.transport.published_on("claims/timeout").is_empty());

        f.supervisor.check_claim_timeouts(1_301).await;
        let events = f.transport.published_on("claims/timeout");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["job_cid"], "bafyjob");
        assert_eq!(events[0]["miner"], "alice.eth");

        // a second sweep emits nothing more
        f.supervisor.check_claim_timeouts(1_400).await;
        assert_eq!(f.transport.published_on("claims/timeout").len(), 1);

        let state = f.state.read().await;
        assert!(state.pending_jobs.contains(&"bafyjob".to_string()));
        assert!(state.claimed_jobs.is_empty());
    }

    #[tokio::test]
    async fn stale_heartbeat_flips_miner_offline() {
        let f = fixture();
        {
            let mut state = f.state.write().await;
            state.upsert_miner("alice.eth", vec![], vec![], "solo".to_string(), 1_000);
        }

        f.supervisor.check_heartbeats(1_121).await;
        let state = f.state.read().await;
        assert_eq!(
            state.active_miners["alice.eth"].status,
            crate::state::MinerStatus::Offline
        );
        assert!(state.active_miners.contains_key("alice.eth"));
    }

    #[tokio::test]
    async fn publish_failure_is_survivable() {
        let f = fixture();
        f.store.fail_uploads(true);
        assert!(f.supervisor.publish_state(2_000).await.is_err());

        f.store.fail_uploads(false);
        assert!(f.supervisor.publish_state(2_010).await.is_ok());
    }
}
