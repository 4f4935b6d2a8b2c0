// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Authoritative pool state.
//!
//! One long-lived structure owned by the daemon and guarded by a single
//! `RwLock`. Handlers receive it as an argument and mutate it directly;
//! nothing here does I/O, so every method is synchronous and the lock is
//! never held across a suspension point.
//!
//! A job content identifier is always in exactly one of: `pending_jobs`,
//! `claimed_jobs`, the active epoch's proof log, or `settled_jobs` (cids
//! whose proofs landed in an already-sealed epoch). `tracks` checks all
//! four, which is what makes duplicate announcements a cheap no-op.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinerStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerRecord {
    pub ens: String,
    pub registered_at: i64,
    pub last_heartbeat: i64,
    #[serde(default)]
    pub gpus: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    /// Advisory only; settlement is by proof count regardless of mode.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub jobs_completed: u64,
    pub status: MinerStatus,
}

fn default_mode() -> String {
    "solo".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimEntry {
    pub miner: String,
    pub claimed_at: i64,
    pub timeout_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub job_cid: String,
    pub proof_cid: String,
    pub miner: String,
    pub ts: i64,
}

/// The active epoch's descriptor and accumulating proof log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpochState {
    pub id: String,
    pub name: String,
    pub open_at: i64,
    pub jobs: u64,
    pub volume: f64,
    pub proofs: Vec<ProofRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct PoolState {
    pub pool: String,
    pub total_jobs: u64,
    pub total_proofs: u64,
    pub total_volume: f64,
    pub sealed_epochs: u64,
    /// Announcement order, oldest first.
    pub pending_jobs: Vec<String>,
    pub claimed_jobs: HashMap<String, ClaimEntry>,
    pub active_miners: HashMap<String, MinerRecord>,
    pub epoch: EpochState,
    pub settled_jobs: HashSet<String>,
    pub last_epoch_seal: i64,
    pub last_updated: i64,
}

impl PoolState {
    pub fn new(pool: &str, now: i64) -> Self {
        Self {
            pool: pool.to_string(),
            last_epoch_seal: now,
            last_updated: now,
            ..Default::default()
        }
    }

    /// Whether a job content identifier is tracked anywhere in the pool.
    pub fn tracks(&self, cid: &str) -> bool {
        self.pending_jobs.iter().any(|c| c == cid)
            || self.claimed_jobs.contains_key(cid)
            || self.epoch.proofs.iter().any(|p| p.job_cid == cid)
            || self.settled_jobs.contains(cid)
    }

    /// Accept an announced job into the pending set and bump the counters.
    /// Callers must have checked `tracks` first.
    pub fn accept_job(&mut self, cid: &str, reward: f64, now: i64) {
        self.pending_jobs.push(cid.to_string());
        self.total_jobs += 1;
        self.epoch.jobs += 1;
        self.total_volume += reward;
        self.epoch.volume += reward;
        self.last_updated = now;
    }

    /// Move a pending job to claimed. Returns false when the job is no
    /// longer pending (a concurrent claim won).
    pub fn accept_claim(&mut self, job_cid: &str, miner: &str, now: i64, timeout_secs: u64) -> bool {
        let Some(position) = self.pending_jobs.iter().position(|c| c == job_cid) else {
            return false;
        };
        self.pending_jobs.remove(position);
        self.claimed_jobs.insert(
            job_cid.to_string(),
            ClaimEntry {
                miner: miner.to_string(),
                claimed_at: now,
                timeout_at: now + timeout_secs as i64,
            },
        );
        self.last_updated = now;
        true
    }

    /// Resolve a claim with an accepted proof: the claim is gone, the proof
    /// record joins the epoch log, and the miner gets credit.
    pub fn accept_proof(&mut self, proof: ProofRecord, now: i64) {
        self.claimed_jobs.remove(&proof.job_cid);
        self.total_proofs += 1;
        if let Some(miner) = self.active_miners.get_mut(&proof.miner) {
            miner.jobs_completed += 1;
        }
        self.epoch.proofs.push(proof);
        self.last_updated = now;
    }

    /// Insert or refresh a miner registration, preserving `jobs_completed`
    /// across re-registrations of the same identity.
    pub fn upsert_miner(
        &mut self,
        ens: &str,
        gpus: Vec<String>,
        models: Vec<String>,
        mode: String,
        now: i64,
    ) {
        let jobs_completed = self
            .active_miners
            .get(ens)
            .map(|m| m.jobs_completed)
            .unwrap_or(0);
        self.active_miners.insert(
            ens.to_string(),
            MinerRecord {
                ens: ens.to_string(),
                registered_at: now,
                last_heartbeat: now,
                gpus,
                models,
                mode,
                jobs_completed,
                status: MinerStatus::Online,
            },
        );
        self.last_updated = now;
    }

    /// Refresh a miner's heartbeat. Unknown miners are ignored.
    pub fn heartbeat(&mut self, ens: &str, now: i64) -> bool {
        match self.active_miners.get_mut(ens) {
            Some(miner) => {
                miner.last_heartbeat = now;
                miner.status = MinerStatus::Online;
                self.last_updated = now;
                true
            }
            None => false,
        }
    }

    /// Remove expired claims and return their jobs to pending. Returns the
    /// reclaimed `(job_cid, miner)` pairs for event emission.
    pub fn reclaim_expired(&mut self, now: i64) -> Vec<(String, String)> {
        let expired: Vec<String> = self
            .claimed_jobs
            .iter()
            .filter(|(_, entry)| entry.timeout_at < now)
            .map(|(cid, _)| cid.clone())
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for cid in expired {
            if let Some(entry) = self.claimed_jobs.remove(&cid) {
                self.pending_jobs.push(cid.clone());
                reclaimed.push((cid, entry.miner));
            }
        }
        if !reclaimed.is_empty() {
            self.last_updated = now;
        }
        reclaimed
    }

    /// Flip miners with stale heartbeats to offline. Offline miners are
    /// retained for statistics and re-registration.
    pub fn mark_stale_offline(&mut self, now: i64, miner_timeout_secs: u64) -> Vec<String> {
        let mut transitioned = Vec::new();
        for miner in self.active_miners.values_mut() {
            if miner.status == MinerStatus::Online
                && miner.last_heartbeat + (miner_timeout_secs as i64) < now
            {
                miner.status = MinerStatus::Offline;
                transitioned.push(miner.ens.clone());
            }
        }
        if !transitioned.is_empty() {
            self.last_updated = now;
        }
        transitioned
    }

    /// Close out the active epoch: its proof log's jobs become settled, and
    /// a fresh epoch descriptor takes its place.
    pub fn rotate_epoch(&mut self, id: String, name: String, now: i64) {
        for proof in &self.epoch.proofs {
            self.settled_jobs.insert(proof.job_cid.clone());
        }
        self.sealed_epochs += 1;
        self.epoch = EpochState {
            id,
            name,
            open_at: now,
            jobs: 0,
            volume: 0.0,
            proofs: Vec::new(),
        };
        self.last_epoch_seal = now;
        self.last_updated = now;
    }

    pub fn online_miners(&self) -> usize {
        self.active_miners
            .values()
            .filter(|m| m.status == MinerStatus::Online)
            .count()
    }
}
