// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Message router: the single ingestion loop.
//!
//! Subscribes to the five inbound topics under the pool namespace and
//! dispatches each message to its handler by topic substring. Handlers run
//! to completion before the next message is dequeued, which is what makes
//! claim arbitration trivial: the first claim the router observes wins, and
//! there is no other tie-breaker.
//!
//! A handler rejecting a message is the normal case, not a failure: the
//! mempool is open, and anything unverifiable, malformed, or out of
//! protocol is dropped without touching state. Nothing a handler does can
//! terminate the loop.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::crypto::SignatureVerifier;
use crate::schema::{
    self, ClaimMessage, HeartbeatMessage, JobAnnouncement, ProofMessage,
};
use crate::state::{PoolState, ProofRecord};
use crate::storage::{ContentStore, SidecarStore};
use crate::supervisor::Shutdown;
use crate::transport::{Transport, TransportMessage};
use chrono::Utc;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("content fetch miss for {0}")]
    FetchMiss(String),
    #[error("signature did not resolve to {0}")]
    InvalidSignature(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub struct MessageRouter {
    config: Arc<PoolConfig>,
    state: Arc<RwLock<PoolState>>,
    store: Arc<dyn ContentStore>,
    verifier: Arc<dyn SignatureVerifier>,
    transport: Arc<dyn Transport>,
    sidecar: Arc<dyn SidecarStore>,
}

impl MessageRouter {
    pub fn new(
        config: Arc<PoolConfig>,
        state: Arc<RwLock<PoolState>>,
        store: Arc<dyn ContentStore>,
        verifier: Arc<dyn SignatureVerifier>,
        transport: Arc<dyn Transport>,
        sidecar: Arc<dyn SidecarStore>,
    ) -> Self {
        Self {
            config,
            state,
            store,
            verifier,
            transport,
            sidecar,
        }
    }

    /// The ingestion loop. Runs until shutdown triggers; an in-flight
    /// handler always runs to completion.
    pub async fn run(&self, shutdown: Arc<Shutdown>) {
        for topic in ["jobs", "claims", "proofs", "miners", "heartbeats"] {
            let full = self.config.topic(topic);
            if let Err(e) = self.transport.subscribe(&full).await {
                warn!("failed to subscribe to {}: {}", full, e);
            }
        }
        info!("router subscribed under {}", self.config.pool_ens);

        while shutdown.is_running() {
            match self.transport.get_message(Duration::from_secs(1)).await {
                Ok(Some(message)) => self.dispatch(message).await,
                Ok(None) => {}
                Err(e) => {
                    warn!("transport read error: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("router stopped");
    }

    /// Dispatch one message by topic substring. Handler outcomes are logged
    /// and swallowed here; drops never propagate.
    pub async fn dispatch(&self, message: TransportMessage) {
        let topic = message.topic.clone();
        let result = if topic.contains("heartbeats") {
            self.handle_heartbeat(&message.payload).await
        } else if topic.contains("claims") {
            self.handle_claim(&message.payload).await
        } else if topic.contains("proofs") {
            self.handle_proof(&message.payload).await
        } else if topic.contains("miners") {
            self.handle_registration(&message.payload).await
        } else if topic.contains("jobs") {
            self.handle_announcement(&message.payload).await
        } else {
            debug!("ignoring message on unrecognized topic {}", topic);
            Ok(())
        };

        if let Err(e) = result {
            debug!("dropped message on {}: {}", topic, e);
        }
    }

    /// Job announcement: fetch the blob, verify it against the announcing
    /// client, and admit the job to the pending set.
    async fn handle_announcement(&self, payload: &Value) -> Result<(), RouterError> {
        let announcement: JobAnnouncement = serde_json::from_value(payload.clone())
            .map_err(|e| RouterError::Malformed(e.to_string()))?;

        // Duplicate suppression: an already-tracked cid is a silent no-op.
        if self.state.read().await.tracks(&announcement.cid) {
            debug!("duplicate announcement for {}", announcement.cid);
            return Ok(());
        }

        let blob = self
            .store
            .fetch_json(&announcement.cid)
            .await
            .map_err(|e| RouterError::FetchMiss(format!("{}: {}", announcement.cid, e)))?
            .ok_or_else(|| RouterError::FetchMiss(announcement.cid.clone()))?;

        let valid = self
            .verifier
            .verify(&blob, &announcement.client)
            .await
            .map_err(|e| RouterError::Malformed(e.to_string()))?;
        if !valid {
            return Err(RouterError::InvalidSignature(announcement.client));
        }

        let job = schema::parse_job_blob(&blob)
            .ok_or_else(|| RouterError::Malformed("job blob missing client".to_string()))?;
        if job.job_type.is_empty() || job.model.is_empty() {
            return Err(RouterError::Malformed(
                "job blob missing job_type or model".to_string(),
            ));
        }

        let now = Utc::now().timestamp();
        {
            let mut state = self.state.write().await;
            // Re-check under the write guard; the read above was advisory.
            if state.tracks(&announcement.cid) {
                return Ok(());
            }
            state.accept_job(&announcement.cid, job.reward, now);
        }

        if let Err(e) = self.store.pin(&announcement.cid).await {
            warn!("failed to pin job {}: {}", announcement.cid, e);
        }

        let event = json!({
            "cid": announcement.cid,
            "job_type": job.job_type,
            "model": job.model,
            "reward": job.reward,
            "timestamp": now,
        });
        self.emit("jobs/new", &event).await;

        info!(
            "accepted job {} ({} / {})",
            announcement.cid, job.job_type, job.model
        );
        Ok(())
    }

    /// Claim: first valid claimant observed by the router wins the job.
    async fn handle_claim(&self, payload: &Value) -> Result<(), RouterError> {
        let claim: ClaimMessage = serde_json::from_value(payload.clone())
            .map_err(|e| RouterError::Malformed(e.to_string()))?;

        {
            let state = self.state.read().await;
            if !state.pending_jobs.iter().any(|c| c == &claim.job_cid) {
                return Err(RouterError::Protocol(format!(
                    "claim on non-pending job {}",
                    claim.job_cid
                )));
            }
            if !state.active_miners.contains_key(&claim.miner) {
                return Err(RouterError::Protocol(format!(
                    "claim from unregistered miner {}",
                    claim.miner
                )));
            }
        }

        // Signature check happens before any state mutation.
        let valid = self
            .verifier
            .verify(payload, &claim.miner)
            .await
            .map_err(|e| RouterError::Malformed(e.to_string()))?;
        if !valid {
            return Err(RouterError::InvalidSignature(claim.miner));
        }

        let now = Utc::now().timestamp();
        let accepted = {
            let mut state = self.state.write().await;
            state.accept_claim(
                &claim.job_cid,
                &claim.miner,
                now,
                self.config.claim_timeout_secs,
            )
        };
        if !accepted {
            // Lost the race to an earlier claim; dropped silently.
            return Err(RouterError::Protocol(format!(
                "job {} already claimed",
                claim.job_cid
            )));
        }

        let event = json!({
            "job_cid": claim.job_cid,
            "miner": claim.miner,
            "timestamp": now,
        });
        self.emit("claims/accepted", &event).await;

        info!("claim accepted: {} -> {}", claim.job_cid, claim.miner);
        Ok(())
    }

    /// Proof: only the registered claimant may prove its claimed job, and
    /// the proof blob must be complete and self-consistent.
    async fn handle_proof(&self, payload: &Value) -> Result<(), RouterError> {
        let proof: ProofMessage = serde_json::from_value(payload.clone())
            .map_err(|e| RouterError::Malformed(e.to_string()))?;

        {
            let state = self.state.read().await;
            match state.claimed_jobs.get(&proof.job_cid) {
                Some(entry) if entry.miner == proof.miner => {}
                Some(entry) => {
                    return Err(RouterError::Protocol(format!(
                        "proof for {} from {}, claimant is {}",
                        proof.job_cid, proof.miner, entry.miner
                    )));
                }
                None => {
                    return Err(RouterError::Protocol(format!(
                        "proof for unclaimed job {}",
                        proof.job_cid
                    )));
                }
            }
        }

        let blob = self
            .store
            .fetch_json(&proof.proof_cid)
            .await
            .map_err(|e| RouterError::FetchMiss(format!("{}: {}", proof.proof_cid, e)))?
            .ok_or_else(|| RouterError::FetchMiss(proof.proof_cid.clone()))?;

        let valid = self
            .verifier
            .verify(&blob, &proof.miner)
            .await
            .map_err(|e| RouterError::Malformed(e.to_string()))?;
        if !valid {
            return Err(RouterError::InvalidSignature(proof.miner));
        }

        let body = schema::parse_proof_blob(&blob).ok_or_else(|| {
            RouterError::Malformed("proof blob missing required fields".to_string())
        })?;
        if body.job_cid != proof.job_cid {
            return Err(RouterError::Protocol(format!(
                "proof blob names job {}, announcement names {}",
                body.job_cid, proof.job_cid
            )));
        }

        let now = Utc::now().timestamp();
        let record = ProofRecord {
            job_cid: proof.job_cid.clone(),
            proof_cid: proof.proof_cid.clone(),
            miner: proof.miner.clone(),
            ts: now,
        };
        let epoch_id = {
            let mut state = self.state.write().await;
            state.accept_proof(record.clone(), now);
            state.epoch.id.clone()
        };

        // Durable sidecar append; the in-memory log is rebuilt from this on
        // restart.
        let key = format!("pool:epoch:{}:proofs", epoch_id);
        let entry = serde_json::to_string(&record).unwrap_or_default();
        if let Err(e) = self.sidecar.lpush(&key, &entry).await {
            warn!("sidecar proof append failed for {}: {}", proof.job_cid, e);
        }

        if let Err(e) = self.store.pin(&proof.proof_cid).await {
            warn!("failed to pin proof {}: {}", proof.proof_cid, e);
        }

        let event = json!({
            "job_cid": proof.job_cid,
            "proof_cid": proof.proof_cid,
            "miner": proof.miner,
            "timestamp": now,
        });
        self.emit("proofs/accepted", &event).await;

        info!("proof accepted: {} by {}", proof.job_cid, proof.miner);
        Ok(())
    }

    /// Miner registration: upsert, preserving completed-job credit.
    async fn handle_registration(&self, payload: &Value) -> Result<(), RouterError> {
        let registration = schema::parse_registration(payload)
            .ok_or_else(|| RouterError::Malformed("registration without identity".to_string()))?;

        let valid = self
            .verifier
            .verify(payload, &registration.ens)
            .await
            .map_err(|e| RouterError::Malformed(e.to_string()))?;
        if !valid {
            return Err(RouterError::InvalidSignature(registration.ens));
        }

        let now = Utc::now().timestamp();
        {
            let mut state = self.state.write().await;
            state.upsert_miner(
                &registration.ens,
                registration.gpus,
                registration.models,
                registration.mode,
                now,
            );
        }

        let event = json!({ "miner": registration.ens, "timestamp": now });
        self.emit("miners/joined", &event).await;

        info!("miner joined: {}", registration.ens);
        Ok(())
    }

    /// Heartbeat: refresh liveness for known miners; unknown miners must
    /// register first and are ignored here.
    async fn handle_heartbeat(&self, payload: &Value) -> Result<(), RouterError> {
        let heartbeat: HeartbeatMessage = serde_json::from_value(payload.clone())
            .map_err(|e| RouterError::Malformed(e.to_string()))?;

        let valid = self
            .verifier
            .verify(payload, &heartbeat.miner)
            .await
            .map_err(|e| RouterError::Malformed(e.to_string()))?;
        if !valid {
            return Err(RouterError::InvalidSignature(heartbeat.miner));
        }

        let now = Utc::now().timestamp();
        let known = {
            let mut state = self.state.write().await;
            state.heartbeat(&heartbeat.miner, now)
        };
        if !known {
            debug!("heartbeat from unregistered miner {}", heartbeat.miner);
        }
        Ok(())
    }

    async fn emit(&self, suffix: &str, payload: &Value) {
        let topic = self.config.topic(suffix);
        if let Err(e) = self.transport.publish(&topic, payload).await {
            warn!("failed to publish on {}: {}", topic, e);
        }
    }
}
