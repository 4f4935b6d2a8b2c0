// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Daemon assembly: adapters in, tasks out.
//!
//! `PoolDaemon` owns the shared pool state and the shutdown signal, wires
//! the router, epoch engine and supervisor together, and handles restart
//! recovery. The recovery rule is the protocol's canonical one: the ledger
//! is authoritative. Whatever the previous process successfully published
//! (latest state snapshot, sealed epoch history, per-epoch proof logs) is
//! restored; claims are soft state and always come back empty.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::crypto::{OperatorSigner, SignatureVerifier};
use crate::epoch::EpochEngine;
use crate::router::MessageRouter;
use crate::state::{EpochState, MinerRecord, PoolState, ProofRecord};
use crate::storage::{ContentStore, SidecarStore};
use crate::supervisor::{Shutdown, Supervisor};
use crate::transport::Transport;

pub struct PoolDaemon {
    config: Arc<PoolConfig>,
    state: Arc<RwLock<PoolState>>,
    store: Arc<dyn ContentStore>,
    sidecar: Arc<dyn SidecarStore>,
    router: Arc<MessageRouter>,
    supervisor: Arc<Supervisor>,
    engine: Arc<EpochEngine>,
    shutdown: Arc<Shutdown>,
    handles: Vec<JoinHandle<()>>,
}

impl PoolDaemon {
    /// Assemble the daemon. Fails when the operator key is unusable; a
    /// daemon that cannot sign must refuse to start.
    pub fn new(
        config: PoolConfig,
        store: Arc<dyn ContentStore>,
        verifier: Arc<dyn SignatureVerifier>,
        transport: Arc<dyn Transport>,
        sidecar: Arc<dyn SidecarStore>,
    ) -> Result<Self> {
        let signer = Arc::new(
            OperatorSigner::from_key(&config.operator_private_key, &config.pool_ens)
                .context("operator signing key unavailable")?,
        );
        Self::with_signer(config, store, verifier, transport, sidecar, signer)
    }

    /// Assemble with an explicit signer. Tests use this with a throwaway
    /// key.
    pub fn with_signer(
        config: PoolConfig,
        store: Arc<dyn ContentStore>,
        verifier: Arc<dyn SignatureVerifier>,
        transport: Arc<dyn Transport>,
        sidecar: Arc<dyn SidecarStore>,
        signer: Arc<OperatorSigner>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let now = Utc::now().timestamp();
        let state = Arc::new(RwLock::new(PoolState::new(&config.pool_ens, now)));

        let engine = Arc::new(EpochEngine::new(
            config.clone(),
            state.clone(),
            store.clone(),
            sidecar.clone(),
            transport.clone(),
            signer.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            config.clone(),
            state.clone(),
            store.clone(),
            verifier,
            transport.clone(),
            sidecar.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            config.clone(),
            state.clone(),
            store.clone(),
            sidecar.clone(),
            transport,
            signer,
            engine.clone(),
        ));

        Ok(Self {
            config,
            state,
            store,
            sidecar,
            router,
            supervisor,
            engine,
            shutdown: Shutdown::new(),
            handles: Vec::new(),
        })
    }

    /// Restore state, open the first epoch if needed, and spawn the router
    /// plus the four supervision loops.
    pub async fn start(&mut self) -> Result<()> {
        let now = Utc::now().timestamp();

        if let Err(e) = self.restore().await {
            warn!("restore from ledger failed, starting fresh: {}", e);
        }
        self.engine.open_initial(now).await;

        let router = self.router.clone();
        let shutdown = self.shutdown.clone();
        self.handles
            .push(tokio::spawn(async move { router.run(shutdown).await }));

        let supervisor = self.supervisor.clone();
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            supervisor.run_state_publisher(shutdown).await
        }));

        let supervisor = self.supervisor.clone();
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            supervisor.run_epoch_manager(shutdown).await
        }));

        let supervisor = self.supervisor.clone();
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            supervisor.run_claim_timeout_checker(shutdown).await
        }));

        let supervisor = self.supervisor.clone();
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            supervisor.run_heartbeat_monitor(shutdown).await
        }));

        info!("pool daemon started for {}", self.config.pool_ens);
        Ok(())
    }

    /// Trigger shutdown and wait for every task to observe it.
    pub async fn stop(&mut self) {
        self.shutdown.trigger();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("pool daemon stopped");
    }

    pub fn state(&self) -> Arc<RwLock<PoolState>> {
        self.state.clone()
    }

    pub fn router(&self) -> Arc<MessageRouter> {
        self.router.clone()
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    pub fn engine(&self) -> Arc<EpochEngine> {
        self.engine.clone()
    }

    /// Rebuild pool state from the last published snapshot and the durable
    /// sidecar. Prior claims are never restored: they expire with the
    /// process that accepted them, and miners simply re-claim.
    async fn restore(&self) -> Result<()> {
        let Some(state_cid) = self.sidecar.get("pool:state:cid").await? else {
            info!("no published state found; starting fresh");
            return Ok(());
        };
        let Some(snapshot) = self.store.fetch_json(&state_cid).await? else {
            warn!("last state snapshot {} is gone from the store", state_cid);
            return Ok(());
        };

        let history = self
            .sidecar
            .lrange("pool:epochs:history", 0, -1)
            .await
            .unwrap_or_default();

        // The active epoch: prefer the sidecar's `pool:epoch:current`,
        // which is written at every rotation and so can be newer than the
        // last state snapshot. When it is newer, counters start fresh;
        // whatever was never published never happened.
        let snapshot_epoch = &snapshot["epoch"];
        let snapshot_epoch_id = snapshot_epoch["id"].as_str().unwrap_or_default().to_string();
        let current: Option<Value> = self
            .sidecar
            .get("pool:epoch:current")
            .await?
            .and_then(|raw| serde_json::from_str(&raw).ok());

        let mut epoch = EpochState::default();
        match current {
            Some(current) if current["id"].as_str() != Some(snapshot_epoch_id.as_str()) => {
                epoch.id = current["id"].as_str().unwrap_or_default().to_string();
                epoch.name = current["name"].as_str().unwrap_or_default().to_string();
                epoch.open_at = current["open_at"].as_i64().unwrap_or(0);
            }
            _ => {
                epoch.id = snapshot_epoch_id;
                epoch.name = snapshot_epoch["name"].as_str().unwrap_or_default().to_string();
                epoch.open_at = snapshot_epoch["open_at"].as_i64().unwrap_or(0);
                epoch.jobs = snapshot_epoch["jobs"].as_u64().unwrap_or(0);
                epoch.volume = snapshot_epoch["volume"].as_f64().unwrap_or(0.0);
            }
        }

        // Current epoch proof log, durable in the sidecar, newest first.
        if !epoch.id.is_empty() {
            let key = format!("pool:epoch:{}:proofs", epoch.id);
            let entries = self.sidecar.lrange(&key, 0, -1).await.unwrap_or_default();
            epoch.proofs = entries
                .iter()
                .rev()
                .filter_map(|raw| serde_json::from_str::<ProofRecord>(raw).ok())
                .collect();
        }

        // Jobs settled in sealed epochs stay recognizable so a replayed
        // announcement remains a no-op.
        let mut settled_jobs = HashSet::new();
        for epoch_id in &history {
            let key = format!("pool:epoch:{}:proofs", epoch_id);
            for raw in self.sidecar.lrange(&key, 0, -1).await.unwrap_or_default() {
                if let Ok(record) = serde_json::from_str::<ProofRecord>(&raw) {
                    settled_jobs.insert(record.job_cid);
                }
            }
        }

        // All reads done; apply in one synchronous critical section.
        let mut state = self.state.write().await;

        state.total_jobs = snapshot["totals"]["jobs"].as_u64().unwrap_or(0);
        state.total_proofs = snapshot["totals"]["proofs"].as_u64().unwrap_or(0);
        state.total_volume = snapshot["totals"]["volume"].as_f64().unwrap_or(0.0);
        state.sealed_epochs = history.len() as u64;

        if let Some(pending) = snapshot["pending_jobs"].as_array() {
            state.pending_jobs = pending
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }

        // Prior claims expire with the process that accepted them; their
        // jobs go straight back to pending.
        if let Some(claimed) = snapshot["claimed_jobs"].as_object() {
            for job_cid in claimed.keys() {
                if !state.pending_jobs.iter().any(|c| c == job_cid) {
                    state.pending_jobs.push(job_cid.clone());
                }
            }
        }

        if let Some(miners) = snapshot["miners"].as_object() {
            state.active_miners = miners
                .iter()
                .filter_map(|(ens, record)| {
                    serde_json::from_value::<MinerRecord>(record.clone())
                        .ok()
                        .map(|m| (ens.clone(), m))
                })
                .collect();
        }

        state.last_epoch_seal = epoch.open_at;
        state.epoch = epoch;
        state.settled_jobs = settled_jobs;
        state.claimed_jobs.clear();

        info!(
            "restored pool state from {}: {} jobs, {} proofs, {} pending, {} miners, epoch {}",
            state_cid,
            state.total_jobs,
            state.total_proofs,
            state.pending_jobs.len(),
            state.active_miners.len(),
            state.epoch.id
        );
        Ok(())
    }
}
