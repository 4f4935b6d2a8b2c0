// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Epoch lifecycle: opening, proof accumulation, sealing, payouts.
//!
//! Sealing is a deterministic pure function of the proof log and the
//! accumulated volume, so two operators replaying the same log produce the
//! same settlements and the same root. The root is sort-and-concatenate
//! SHA-256 over proof content identifiers: not a Merkle tree in the strict
//! sense, but the form existing verifiers expect. A binary tree could ship
//! later under a new version tag.

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::crypto::OperatorSigner;
use crate::schema::SNAPSHOT_VERSION;
use crate::state::{PoolState, ProofRecord};
use crate::storage::{ContentStore, SidecarStore, StorageError};
use crate::transport::Transport;

/// Share of epoch volume distributed to miners; the rest funds hive ops.
pub const MINER_POOL_SHARE: f64 = 0.75;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("snapshot signing failed: {0}")]
    Signing(String),
    #[error("snapshot upload failed: {0}")]
    Upload(#[from] StorageError),
}

/// Round a payout to 4 decimal places.
pub fn round4(amount: f64) -> f64 {
    (amount * 10_000.0).round() / 10_000.0
}

/// Deterministic root over a proof log: sort the proof content identifiers
/// lexicographically, concatenate with no separator, SHA-256, hex, `0x`
/// prefix. An empty log yields `0x` followed by 64 zeros.
pub fn merkle_root(proof_cids: &[String]) -> String {
    if proof_cids.is_empty() {
        return format!("0x{}", "0".repeat(64));
    }
    let mut sorted = proof_cids.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    for cid in &sorted {
        hasher.update(cid.as_bytes());
    }
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// Per-epoch settlement: miner payouts plus the hive-operations share.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlements {
    pub miner_pool: f64,
    pub hive_ops: f64,
    pub miners: BTreeMap<String, f64>,
    /// Dust carried forward when the epoch sealed with no proofs.
    pub rollover: f64,
}

impl Settlements {
    pub fn to_json(&self) -> Value {
        json!({
            "miner_pool": round4(self.miner_pool),
            "hive_ops": round4(self.hive_ops),
            "miners": self.miners,
            "rollover": round4(self.rollover),
            "rollover_policy": "zero-proof epochs carry the miner pool forward as dust",
        })
    }
}

/// Split epoch volume across miners by proof count.
pub fn compute_settlements(proofs: &[ProofRecord], volume: f64) -> Settlements {
    let miner_pool = volume * MINER_POOL_SHARE;
    let hive_ops = volume - miner_pool;

    if proofs.is_empty() {
        return Settlements {
            miner_pool,
            hive_ops,
            miners: BTreeMap::new(),
            rollover: miner_pool,
        };
    }

    let total = proofs.len() as f64;
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for proof in proofs {
        *counts.entry(proof.miner.clone()).or_default() += 1;
    }

    let miners = counts
        .into_iter()
        .map(|(miner, count)| (miner, round4(miner_pool * count as f64 / total)))
        .collect();

    Settlements {
        miner_pool,
        hive_ops,
        miners,
        rollover: 0.0,
    }
}

/// Deterministic epoch naming from the open time.
pub fn epoch_descriptor(open_at: i64) -> (String, String) {
    let id = format!("epoch-{}", open_at);
    let name = Utc
        .timestamp_opt(open_at, 0)
        .single()
        .map(|t| t.format("epoch-%Y%m%d-%H%M").to_string())
        .unwrap_or_else(|| id.clone());
    (id, name)
}

/// Owns the active epoch descriptor: opens epochs, seals them, publishes
/// the sealed manifest, and rotates to the successor.
pub struct EpochEngine {
    config: Arc<PoolConfig>,
    state: Arc<RwLock<PoolState>>,
    store: Arc<dyn ContentStore>,
    sidecar: Arc<dyn SidecarStore>,
    transport: Arc<dyn Transport>,
    signer: Arc<OperatorSigner>,
}

impl EpochEngine {
    pub fn new(
        config: Arc<PoolConfig>,
        state: Arc<RwLock<PoolState>>,
        store: Arc<dyn ContentStore>,
        sidecar: Arc<dyn SidecarStore>,
        transport: Arc<dyn Transport>,
        signer: Arc<OperatorSigner>,
    ) -> Self {
        Self {
            config,
            state,
            store,
            sidecar,
            transport,
            signer,
        }
    }

    /// Open the first epoch if none is active. Called once at startup,
    /// after any restore.
    pub async fn open_initial(&self, now: i64) {
        {
            let state = self.state.read().await;
            if !state.epoch.id.is_empty() {
                return;
            }
        }
        let (id, name) = epoch_descriptor(now);
        {
            let mut state = self.state.write().await;
            state.epoch.id = id.clone();
            state.epoch.name = name.clone();
            state.epoch.open_at = now;
            state.last_epoch_seal = now;
        }
        self.announce_open(&id, &name, now).await;
    }

    /// Whether the seal condition holds.
    pub async fn seal_due(&self, now: i64) -> bool {
        let state = self.state.read().await;
        now >= state.last_epoch_seal + self.config.epoch_duration_secs as i64
    }

    /// Seal the active epoch and open its successor. Returns the sealed
    /// snapshot identifier, or `None` when the epoch was already in the
    /// sealed history (restart replay). On upload failure the epoch stays
    /// active and the caller retries on its next tick.
    pub async fn seal_and_rotate(&self, now: i64) -> Result<Option<String>, SealError> {
        let epoch = {
            let state = self.state.read().await;
            state.epoch.clone()
        };
        if epoch.id.is_empty() {
            return Ok(None);
        }

        // A seal that uploaded but crashed before rotating must not credit
        // miners twice on replay.
        let history = self
            .sidecar
            .lrange("pool:epochs:history", 0, -1)
            .await
            .unwrap_or_default();
        if history.iter().any(|id| id == &epoch.id) {
            warn!(
                "epoch {} already sealed; rotating without re-publishing",
                epoch.id
            );
            self.rotate(now).await;
            return Ok(None);
        }

        let settlements = compute_settlements(&epoch.proofs, epoch.volume);
        let proof_cids: Vec<String> = epoch.proofs.iter().map(|p| p.proof_cid.clone()).collect();
        let root = merkle_root(&proof_cids);

        let snapshot = json!({
            "type": "epoch",
            "version": SNAPSHOT_VERSION,
            "epoch_id": epoch.id,
            "name": epoch.name,
            "status": "sealed",
            "open_at": epoch.open_at,
            "close_at": now,
            "jobs": epoch.jobs,
            "proof_count": epoch.proofs.len(),
            "proofs": epoch.proofs,
            "volume": format!("{:.4}", epoch.volume),
            "settlements": settlements.to_json(),
            "merkle_root": root,
            "pool": self.config.pool_ens,
            "ts": now,
            "signing": {
                "scheme": "eip191",
                "did": format!("ens:{}", self.signer.ens()),
                "payload_hash": "",
                "signature": ""
            }
        });

        let signed = self
            .signer
            .sign_snapshot(snapshot)
            .await
            .map_err(|e| SealError::Signing(e.to_string()))?;

        // The upload is the commit point: if it fails the epoch remains
        // active and nothing below runs.
        let cid = self.store.upload_json(&signed).await?;
        if let Err(e) = self.store.pin(&cid).await {
            warn!("failed to pin sealed epoch {}: {}", epoch.id, e);
        }

        if let Err(e) = self
            .sidecar
            .set(&format!("pool:epoch:{}", epoch.id), &cid, None)
            .await
        {
            warn!("sidecar write for sealed epoch {} failed: {}", epoch.id, e);
        }
        if let Err(e) = self.sidecar.lpush("pool:epochs:history", &epoch.id).await {
            warn!("sidecar history push for {} failed: {}", epoch.id, e);
        }

        let sealed_event = json!({
            "epoch_id": epoch.id,
            "cid": cid,
            "jobs": epoch.jobs,
            "volume": format!("{:.4}", epoch.volume),
            "timestamp": now,
        });
        if let Err(e) = self
            .transport
            .publish(&self.config.topic("epochs/sealed"), &sealed_event)
            .await
        {
            warn!("failed to announce sealed epoch {}: {}", epoch.id, e);
        }

        info!(
            "sealed epoch {} ({} proofs, volume {:.4}) as {}",
            epoch.id,
            epoch.proofs.len(),
            epoch.volume,
            cid
        );

        self.rotate(now).await;
        Ok(Some(cid))
    }

    async fn rotate(&self, now: i64) {
        let (id, name) = epoch_descriptor(now);
        {
            let mut state = self.state.write().await;
            state.rotate_epoch(id.clone(), name.clone(), now);
        }
        self.announce_open(&id, &name, now).await;
    }

    async fn announce_open(&self, id: &str, name: &str, now: i64) {
        let current = json!({ "id": id, "name": name, "open_at": now });
        if let Err(e) = self
            .sidecar
            .set("pool:epoch:current", &current.to_string(), None)
            .await
        {
            warn!("sidecar write for current epoch failed: {}", e);
        }

        let opened = json!({ "epoch_id": id, "name": name, "timestamp": now });
        if let Err(e) = self
            .transport
            .publish(&self.config.topic("epochs/opened"), &opened)
            .await
        {
            warn!("failed to announce opened epoch {}: {}", id, e);
        }
        info!("opened epoch {} ({})", id, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemorySidecar, MockContentStore};
    use crate::transport::MockTransport;

    fn record(job: &str, proof: &str, miner: &str) -> ProofRecord {
        ProofRecord {
            job_cid: job.to_string(),
            proof_cid: proof.to_string(),
            miner: miner.to_string(),
            ts: 1_000,
        }
    }

    #[test]
    fn empty_log_roots_to_zeros() {
        assert_eq!(
            merkle_root(&[]),
            format!("0x{}", "0".repeat(64))
        );
    }

    #[test]
    fn root_is_order_independent() {
        let forward = merkle_root(&["bafyA".to_string(), "bafyB".to_string()]);
        let reverse = merkle_root(&["bafyB".to_string(), "bafyA".to_string()]);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn root_matches_sorted_concatenation() {
        let cids = vec!["bafyB".to_string(), "bafyA".to_string()];
        let expected = format!(
            "0x{}",
            hex::encode(Sha256::digest("bafyAbafyB".as_bytes()))
        );
        assert_eq!(merkle_root(&cids), expected);
    }

    #[test]
    fn settlement_splits_75_25_by_proof_count() {
        let proofs = vec![
            record("j1", "bafyA", "alice.eth"),
            record("j2", "bafyB", "alice.eth"),
        ];
        let settlements = compute_settlements(&proofs, 2.0);
        assert_eq!(settlements.miner_pool, 1.5);
        assert_eq!(settlements.hive_ops, 0.5);
        assert_eq!(settlements.miners["alice.eth"], 1.5);
        assert_eq!(settlements.rollover, 0.0);
    }

    #[test]
    fn settlement_conserves_volume_within_rounding() {
        let proofs = vec![
            record("j1", "p1", "alice.eth"),
            record("j2", "p2", "bob.eth"),
            record("j3", "p3", "carol.eth"),
        ];
        let volume = 10.0;
        let settlements = compute_settlements(&proofs, volume);
        let paid: f64 = settlements.miners.values().sum();
        let miners = settlements.miners.len() as f64;
        assert!((paid + settlements.hive_ops - volume).abs() <= miners * 1e-4);
    }

    #[test]
    fn zero_proof_epoch_rolls_the_pool_forward() {
        let settlements = compute_settlements(&[], 4.0);
        assert!(settlements.miners.is_empty());
        assert_eq!(settlements.rollover, 3.0);
        assert_eq!(settlements.hive_ops, 1.0);
        let rendered = settlements.to_json();
        assert!(rendered["rollover_policy"].as_str().unwrap().contains("dust"));
    }

    #[test]
    fn epoch_descriptor_is_deterministic() {
        let (id_a, name_a) = epoch_descriptor(1_735_689_600);
        let (id_b, name_b) = epoch_descriptor(1_735_689_600);
        assert_eq!(id_a, id_b);
        assert_eq!(name_a, name_b);
        assert_eq!(id_a, "epoch-1735689600");
        assert!(name_a.starts_with("epoch-2025"));
    }

    fn engine_fixture() -> (
        EpochEngine,
        Arc<RwLock<PoolState>>,
        Arc<MockContentStore>,
        Arc<MemorySidecar>,
        Arc<MockTransport>,
    ) {
        let config = Arc::new(PoolConfig::default());
        let state = Arc::new(RwLock::new(PoolState::new("swarmpool.eth", 1_000)));
        let store = Arc::new(MockContentStore::new());
        let sidecar = Arc::new(MemorySidecar::new());
        let transport = Arc::new(MockTransport::new());
        let signer = Arc::new(OperatorSigner::random("operator.swarmos.eth"));
        let engine = EpochEngine::new(
            config,
            state.clone(),
            store.clone(),
            sidecar.clone(),
            transport.clone(),
            signer,
        );
        (engine, state, store, sidecar, transport)
    }

    #[tokio::test]
    async fn seal_publishes_manifest_and_rotates() {
        let (engine, state, store, sidecar, transport) = engine_fixture();
        engine.open_initial(1_000).await;
        {
            let mut s = state.write().await;
            s.upsert_miner("alice.eth", vec![], vec![], "solo".to_string(), 1_000);
            s.accept_job("bafyjob1", 1.0, 1_000);
            s.accept_job("bafyjob2", 1.0, 1_000);
            s.accept_claim("bafyjob1", "alice.eth", 1_000, 300);
            s.accept_claim("bafyjob2", "alice.eth", 1_000, 300);
            s.accept_proof(record("bafyjob1", "bafyA", "alice.eth"), 1_000);
            s.accept_proof(record("bafyjob2", "bafyB", "alice.eth"), 1_000);
        }

        let sealed_id = { state.read().await.epoch.id.clone() };
        let cid = engine.seal_and_rotate(4_600).await.unwrap().unwrap();

        let manifest = store.fetch_json(&cid).await.unwrap().unwrap();
        assert_eq!(manifest["type"], "epoch");
        assert_eq!(manifest["status"], "sealed");
        assert_eq!(manifest["volume"], "2.0000");
        assert_eq!(manifest["settlements"]["miners"]["alice.eth"], 1.5);
        assert_eq!(
            manifest["merkle_root"].as_str().unwrap(),
            format!("0x{}", hex::encode(Sha256::digest("bafyAbafyB".as_bytes())))
        );
        assert!(manifest["signing"]["signature"]
            .as_str()
            .unwrap()
            .starts_with("eip191:0x"));
        assert!(store.is_pinned(&cid));

        // sidecar bookkeeping
        assert_eq!(
            sidecar
                .get(&format!("pool:epoch:{}", sealed_id))
                .await
                .unwrap()
                .as_deref(),
            Some(cid.as_str())
        );
        let history = sidecar.lrange("pool:epochs:history", 0, -1).await.unwrap();
        assert_eq!(history, vec![sealed_id.clone()]);

        // events and rotation
        assert_eq!(transport.published_on("epochs/sealed").len(), 1);
        assert_eq!(transport.published_on("epochs/opened").len(), 2);
        let state = state.read().await;
        assert_ne!(state.epoch.id, sealed_id);
        assert!(state.epoch.proofs.is_empty());
        assert_eq!(state.last_epoch_seal, 4_600);
        assert!(state.settled_jobs.contains("bafyjob1"));
    }

    #[tokio::test]
    async fn failed_upload_leaves_epoch_active() {
        let (engine, state, store, _sidecar, transport) = engine_fixture();
        engine.open_initial(1_000).await;
        let epoch_id = { state.read().await.epoch.id.clone() };

        store.fail_uploads(true);
        assert!(engine.seal_and_rotate(4_600).await.is_err());

        let s = state.read().await;
        assert_eq!(s.epoch.id, epoch_id);
        assert_eq!(s.last_epoch_seal, 1_000);
        assert!(transport.published_on("epochs/sealed").is_empty());
    }

    #[tokio::test]
    async fn already_sealed_epoch_is_not_republished() {
        let (engine, state, store, sidecar, transport) = engine_fixture();
        engine.open_initial(1_000).await;
        let epoch_id = { state.read().await.epoch.id.clone() };
        sidecar.lpush("pool:epochs:history", &epoch_id).await.unwrap();

        let before = store.object_count();
        let result = engine.seal_and_rotate(4_600).await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.object_count(), before);
        assert!(transport.published_on("epochs/sealed").is_empty());

        // but the daemon still moved on to a fresh epoch
        assert_ne!(state.read().await.epoch.id, epoch_id);
    }

    #[tokio::test]
    async fn seal_due_honors_epoch_duration() {
        let (engine, _state, _store, _sidecar, _transport) = engine_fixture();
        engine.open_initial(1_000).await;
        assert!(!engine.seal_due(1_000 + 3_599).await);
        assert!(engine.seal_due(1_000 + 3_600).await);
    }
}
