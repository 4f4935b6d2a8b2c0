// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Wire schemas for the mempool.
//!
//! Every signed record in the mempool shares one envelope: `type`, `version`,
//! `id`, `ts`, `issuer`, `pool`, a kind-specific `body`, and a `signing`
//! block (`scheme`, `did`, `payload_hash`, `signature`). Records authored by
//! older clients arrive bare, with the body fields at the top level and a
//! `sig` field instead of a signing block. The accessors here read fields
//! through `body` first and fall back to the top level, so handlers never
//! care which form they got.
//!
//! Inbound topic messages (the small JSON objects on `jobs`, `claims`,
//! `proofs`, `heartbeats`) are typed with tolerant structs: only the fields
//! the daemon reads are declared, everything else is ignored.

use serde::Deserialize;
use serde_json::Value;

pub const SNAPSHOT_VERSION: &str = "bee-23@1.0";

/// Read a record field, checking the envelope `body` before the top level.
pub fn field<'a>(payload: &'a Value, name: &str) -> Option<&'a Value> {
    payload
        .get("body")
        .and_then(|body| body.get(name))
        .or_else(|| payload.get(name))
}

pub fn field_str<'a>(payload: &'a Value, name: &str) -> Option<&'a str> {
    field(payload, name).and_then(|v| v.as_str())
}

pub fn field_i64(payload: &Value, name: &str) -> Option<i64> {
    field(payload, name).and_then(|v| v.as_i64())
}

/// Decimal amounts arrive as JSON numbers or as strings ("1.00").
pub fn field_amount(payload: &Value, name: &str) -> Option<f64> {
    match field(payload, name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Announcement on the `jobs` topic: a pointer at a job blob.
#[derive(Debug, Clone, Deserialize)]
pub struct JobAnnouncement {
    pub cid: String,
    pub client: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Claim on the `claims` topic.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimMessage {
    pub job_cid: String,
    pub miner: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub sig: String,
}

/// Proof announcement on the `proofs` topic.
#[derive(Debug, Clone, Deserialize)]
pub struct ProofMessage {
    pub job_cid: String,
    pub proof_cid: String,
    pub miner: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Heartbeat on the `heartbeats` topic.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatMessage {
    pub miner: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub sig: String,
}

/// The essential fields of a job blob, once fetched from the content store.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub job_type: String,
    pub model: String,
    pub input_cid: String,
    pub reward: f64,
    pub client: String,
    pub ts: i64,
    pub nonce: String,
}

/// Parse a fetched job blob. Returns `None` when a field the daemon reads is
/// missing or the wrong type; unknown fields are ignored.
pub fn parse_job_blob(blob: &Value) -> Option<JobRecord> {
    let client = field_str(blob, "client")
        .or_else(|| field_str(blob, "client_ens"))?
        .to_string();
    let input_cid = field_str(blob, "input_cid")
        .or_else(|| field_str(blob, "input_ref"))
        .unwrap_or_default()
        .to_string();

    Some(JobRecord {
        job_id: field_str(blob, "job_id").unwrap_or_default().to_string(),
        job_type: field_str(blob, "job_type").unwrap_or_default().to_string(),
        model: field_str(blob, "model")
            .or_else(|| field_str(blob, "model_name"))
            .unwrap_or_default()
            .to_string(),
        input_cid,
        reward: field_amount(blob, "reward").unwrap_or(0.0),
        client,
        ts: field_i64(blob, "ts")
            .or_else(|| field_i64(blob, "timestamp"))
            .unwrap_or(0),
        nonce: field_str(blob, "nonce").unwrap_or_default().to_string(),
    })
}

/// The fields a proof blob must carry to be accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProofBlob {
    pub job_cid: String,
    pub status: String,
    pub output_cid: String,
    pub proof_hash: String,
}

/// Parse a fetched proof blob. All of `job_cid`, `status`, `output_cid`,
/// `metrics` and `proof_hash` must be present.
pub fn parse_proof_blob(blob: &Value) -> Option<ProofBlob> {
    field(blob, "metrics")?;
    Some(ProofBlob {
        job_cid: field_str(blob, "job_cid")?.to_string(),
        status: field_str(blob, "status")?.to_string(),
        output_cid: field_str(blob, "output_cid")?.to_string(),
        proof_hash: field_str(blob, "proof_hash")?.to_string(),
    })
}

/// A miner registration record. Shape is dynamic; only `ens` is required.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub ens: String,
    pub gpus: Vec<String>,
    pub models: Vec<String>,
    pub mode: String,
}

pub fn parse_registration(payload: &Value) -> Option<Registration> {
    let ens = field_str(payload, "ens")
        .or_else(|| field_str(payload, "miner"))
        .or_else(|| payload.get("issuer").and_then(|v| v.as_str()))?
        .to_string();

    Some(Registration {
        ens,
        gpus: string_list(field(payload, "gpus")),
        models: string_list(field(payload, "models")),
        mode: field_str(payload, "mode").unwrap_or("solo").to_string(),
    })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_prefers_body_over_top_level() {
        let enveloped = json!({
            "job_cid": "outer",
            "body": { "job_cid": "inner" }
        });
        assert_eq!(field_str(&enveloped, "job_cid"), Some("inner"));

        let bare = json!({ "job_cid": "outer" });
        assert_eq!(field_str(&bare, "job_cid"), Some("outer"));
    }

    #[test]
    fn parses_bare_job_blob() {
        let blob = json!({
            "job_id": "job-1",
            "job_type": "spine_mri",
            "model": "queenbee-spine",
            "input_cid": "bafyinput",
            "reward": 1.25,
            "client": "clinic.clientswarm.eth",
            "timestamp": 1735689600,
            "nonce": "abc123",
            "signature": "0xsig"
        });
        let job = parse_job_blob(&blob).unwrap();
        assert_eq!(job.job_type, "spine_mri");
        assert_eq!(job.model, "queenbee-spine");
        assert_eq!(job.reward, 1.25);
        assert_eq!(job.ts, 1735689600);
    }

    #[test]
    fn parses_enveloped_job_blob_with_string_reward() {
        let blob = json!({
            "type": "JOB",
            "issuer": "clinic.clientswarm.eth",
            "body": {
                "job_id": "job-2",
                "job_type": "cardiac_mri",
                "model": "queenbee-cardiac",
                "reward": "2.50",
                "client": "clinic.clientswarm.eth",
                "ts": 1735689601,
                "nonce": "def"
            }
        });
        let job = parse_job_blob(&blob).unwrap();
        assert_eq!(job.reward, 2.5);
        assert_eq!(job.client, "clinic.clientswarm.eth");
    }

    #[test]
    fn proof_blob_requires_metrics() {
        let mut blob = json!({
            "job_cid": "bafyjob",
            "status": "completed",
            "output_cid": "bafyout",
            "proof_hash": "0xdeadbeef",
            "metrics": { "inference_seconds": 1.2 }
        });
        assert!(parse_proof_blob(&blob).is_some());

        blob.as_object_mut().unwrap().remove("metrics");
        assert!(parse_proof_blob(&blob).is_none());
    }

    #[test]
    fn registration_falls_back_to_issuer() {
        let reg = json!({
            "type": "MINER_REGISTRATION",
            "issuer": "alice.swarmbee.eth",
            "body": { "gpus": ["rtx4090"], "models": ["queenbee-spine"], "mode": "pool" }
        });
        let parsed = parse_registration(&reg).unwrap();
        assert_eq!(parsed.ens, "alice.swarmbee.eth");
        assert_eq!(parsed.gpus, vec!["rtx4090"]);
        assert_eq!(parsed.mode, "pool");
    }
}
