// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Shared fixture for daemon integration tests: a pool daemon wired to
//! in-memory adapters, with helpers that speak the wire formats miners and
//! clients use.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use swarmpool_daemon::{
    MemorySidecar, MockContentStore, MockTransport, MockVerifier, OperatorSigner, PoolConfig,
    PoolDaemon, PoolState, TransportMessage,
};

pub struct TestPool {
    pub daemon: PoolDaemon,
    pub store: Arc<MockContentStore>,
    pub sidecar: Arc<MemorySidecar>,
    pub transport: Arc<MockTransport>,
    pub verifier: Arc<MockVerifier>,
}

pub async fn pool() -> TestPool {
    let pool = pool_with(
        Arc::new(MockContentStore::new()),
        Arc::new(MemorySidecar::new()),
    )
    .await;
    pool.daemon.engine().open_initial(1_000).await;
    pool
}

/// Build a daemon over caller-provided stores without opening an epoch, so
/// restart tests can hand the same ledger to a second daemon and let
/// `start` recover it.
pub async fn pool_with(store: Arc<MockContentStore>, sidecar: Arc<MemorySidecar>) -> TestPool {
    let transport = Arc::new(MockTransport::new());
    let verifier = Arc::new(MockVerifier::new());
    let signer = Arc::new(OperatorSigner::random("swarmpool.eth"));

    let daemon = PoolDaemon::with_signer(
        PoolConfig::default(),
        store.clone(),
        verifier.clone(),
        transport.clone(),
        sidecar.clone(),
        signer,
    )
    .expect("daemon assembly");

    TestPool {
        daemon,
        store,
        sidecar,
        transport,
        verifier,
    }
}

impl TestPool {
    pub async fn dispatch(&self, topic_suffix: &str, payload: Value) {
        self.daemon
            .router()
            .dispatch(TransportMessage {
                topic: format!("swarmpool.eth/{}", topic_suffix),
                payload,
            })
            .await;
    }

    pub async fn register(&self, ens: &str) {
        self.dispatch(
            "miners",
            json!({
                "ens": ens,
                "gpus": ["rtx4090"],
                "models": ["queenbee-spine"],
                "mode": "solo",
                "timestamp": 1_735_689_600,
                "sig": "0xregsig"
            }),
        )
        .await;
    }

    pub async fn heartbeat(&self, ens: &str) {
        self.dispatch(
            "heartbeats",
            json!({ "miner": ens, "timestamp": 1_735_689_700, "sig": "0xhbsig" }),
        )
        .await;
    }

    /// Put a job blob in the store under `cid` and announce it.
    pub async fn announce(&self, cid: &str, client: &str, reward: f64) {
        let blob = json!({
            "job_id": format!("job-{}", cid),
            "job_type": "spine_mri",
            "model": "queenbee-spine",
            "input_cid": "bafyinput",
            "reward": reward,
            "client": client,
            "timestamp": 1_735_689_600,
            "nonce": "a1b2c3",
            "sig": "0xjobsig"
        });
        self.store.insert_with_cid(cid, blob);
        self.dispatch(
            "jobs",
            json!({ "cid": cid, "client": client, "timestamp": 1_735_689_600 }),
        )
        .await;
    }

    pub async fn claim(&self, job_cid: &str, miner: &str) {
        self.dispatch(
            "claims",
            json!({
                "job_cid": job_cid,
                "miner": miner,
                "nonce": "c4d5e6",
                "timestamp": 1_735_689_601,
                "sig": "0xclaimsig"
            }),
        )
        .await;
    }

    /// Put a proof blob in the store under `proof_cid` and announce it.
    pub async fn prove(&self, job_cid: &str, proof_cid: &str, miner: &str) {
        self.prove_declaring(job_cid, proof_cid, miner, job_cid).await;
    }

    /// Like `prove`, but the blob declares `declared_job_cid` internally.
    pub async fn prove_declaring(
        &self,
        job_cid: &str,
        proof_cid: &str,
        miner: &str,
        declared_job_cid: &str,
    ) {
        let blob = json!({
            "job_cid": declared_job_cid,
            "status": "completed",
            "output_cid": "bafyoutput",
            "metrics": {
                "inference_seconds": 1.5,
                "confidence": 0.93,
                "model_version": "1.0.0"
            },
            "proof_hash": "0xfeedface",
            "miner": miner,
            "sig": "0xproofsig"
        });
        self.store.insert_with_cid(proof_cid, blob);
        self.dispatch(
            "proofs",
            json!({
                "job_cid": job_cid,
                "proof_cid": proof_cid,
                "miner": miner,
                "timestamp": 1_735_689_602
            }),
        )
        .await;
    }

    pub async fn state(&self) -> PoolState {
        self.daemon.state().read().await.clone()
    }
}
