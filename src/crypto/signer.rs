// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Canonical serialization and EIP-191 snapshot signing.
//!
//! Canonical form is the one strict wire contract of the protocol: strip the
//! signature (`signing.signature`, or a bare `sig` field), serialize with
//! lexicographically sorted keys at every nesting level and no insignificant
//! whitespace, UTF-8 encode. The payload hash is keccak256 over those bytes,
//! and snapshots are signed over the hash string under EIP-191.

use anyhow::{anyhow, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use ethers::utils::keccak256;
use serde_json::Value;

/// Compute the canonical JSON representation of a snapshot payload.
///
/// Key order is handled by `serde_json` itself: its map type keeps keys
/// sorted as long as the `preserve_order` feature stays off.
pub fn canonical_json(snapshot: &Value) -> Result<String> {
    let mut payload = snapshot.clone();

    if let Some(obj) = payload.as_object_mut() {
        obj.remove("sig");
        if let Some(signing) = obj.get_mut("signing").and_then(|s| s.as_object_mut()) {
            signing.remove("signature");
        }
    }

    Ok(serde_json::to_string(&payload)?)
}

/// keccak256 of the canonical payload, in the wire's `keccak256:<hex>` form.
pub fn payload_hash(snapshot: &Value) -> Result<String> {
    let canonical = canonical_json(snapshot)?;
    let hash = keccak256(canonical.as_bytes());
    Ok(format!("keccak256:{}", hex::encode(hash)))
}

/// Holds the operator wallet and signs every outgoing snapshot.
#[derive(Debug, Clone)]
pub struct OperatorSigner {
    wallet: LocalWallet,
    ens: String,
}

impl OperatorSigner {
    /// Load the operator wallet from a private key hex string.
    ///
    /// An invalid or empty key is fatal: the daemon must not start without
    /// the ability to sign its snapshots.
    pub fn from_key(private_key: &str, ens: &str) -> Result<Self> {
        let key = private_key.strip_prefix("0x").unwrap_or(private_key);
        let wallet: LocalWallet = key
            .parse()
            .map_err(|e| anyhow!("invalid operator private key: {}", e))?;
        Ok(Self {
            wallet,
            ens: ens.to_string(),
        })
    }

    /// Generate a throwaway operator identity.
    pub fn random(ens: &str) -> Self {
        Self {
            wallet: LocalWallet::new(&mut rand::thread_rng()),
            ens: ens.to_string(),
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn ens(&self) -> &str {
        &self.ens
    }

    /// Fill a snapshot's `signing` block: payload hash plus EIP-191
    /// signature over the hash string.
    pub async fn sign_snapshot(&self, mut snapshot: Value) -> Result<Value> {
        let hash = payload_hash(&snapshot)?;
        let signature = self.wallet.sign_message(&hash).await?;
        let signature = format!("eip191:0x{}", hex::encode(signature.to_vec()));

        let signing = snapshot
            .get_mut("signing")
            .and_then(|s| s.as_object_mut())
            .ok_or_else(|| anyhow!("snapshot has no signing block"))?;
        signing.insert("payload_hash".to_string(), Value::String(hash));
        signing.insert("signature".to_string(), Value::String(signature));

        Ok(snapshot)
    }
}
