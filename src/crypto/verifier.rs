// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Inbound signature verification.
//!
//! The verifier answers one question: does this payload's signature resolve
//! to the claimed identity? It canonicalizes the payload (stripping the
//! signature itself), recovers the signer address under EIP-191, and asks an
//! identity resolver whether that address belongs to the claimed ENS name.
//! Resolution is pluggable so tests and offline deployments can run from a
//! static registry.

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Signature};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use super::signer::payload_hash;

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("payload carries no signature")]
    MissingSignature,
    #[error("malformed signature: {0}")]
    Malformed(String),
    #[error("identity resolution failed: {0}")]
    Resolver(String),
}

/// Given a payload and a claimed identity, answer valid/invalid.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, payload: &Value, identity: &str) -> Result<bool, VerifierError>;
}

/// Resolve an ENS name to the address expected to sign for it.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<Address>, VerifierError>;
}

/// Fixed name→address registry, for tests and air-gapped pools.
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Address>,
}

impl StaticResolver {
    pub fn insert(&mut self, name: &str, address: Address) {
        self.entries.insert(name.to_string(), address);
    }
}

#[async_trait]
impl IdentityResolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<Option<Address>, VerifierError> {
        Ok(self.entries.get(name).copied())
    }
}

/// ENS resolution over an Ethereum JSON-RPC endpoint.
pub struct EnsResolver {
    provider: Provider<Http>,
}

impl EnsResolver {
    pub fn new(rpc_url: &str) -> Result<Self, VerifierError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| VerifierError::Resolver(e.to_string()))?;
        Ok(Self { provider })
    }
}

#[async_trait]
impl IdentityResolver for EnsResolver {
    async fn resolve(&self, name: &str) -> Result<Option<Address>, VerifierError> {
        match self.provider.resolve_name(name).await {
            Ok(address) => Ok(Some(address)),
            Err(e) => {
                // Unregistered names surface as provider errors; treat them
                // as unresolved rather than transport failures.
                debug!("ENS resolution miss for {}: {}", name, e);
                Ok(None)
            }
        }
    }
}

/// Recovery-based verifier: canonicalize, recover, compare.
pub struct RecoveryVerifier {
    resolver: Box<dyn IdentityResolver>,
}

impl RecoveryVerifier {
    pub fn new(resolver: Box<dyn IdentityResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl SignatureVerifier for RecoveryVerifier {
    async fn verify(&self, payload: &Value, identity: &str) -> Result<bool, VerifierError> {
        let signature = extract_signature(payload).ok_or(VerifierError::MissingSignature)?;
        let hash = payload_hash(payload).map_err(|e| VerifierError::Malformed(e.to_string()))?;

        let stripped = signature.strip_prefix("eip191:").unwrap_or(&signature);
        let sig_hex = stripped.strip_prefix("0x").unwrap_or(stripped);
        let sig_bytes =
            hex::decode(sig_hex).map_err(|e| VerifierError::Malformed(e.to_string()))?;
        let signature = Signature::try_from(sig_bytes.as_slice())
            .map_err(|e| VerifierError::Malformed(e.to_string()))?;

        let recovered = signature
            .recover(hash.as_str())
            .map_err(|e| VerifierError::Malformed(e.to_string()))?;

        let name = identity.strip_prefix("ens:").unwrap_or(identity);
        match self.resolver.resolve(name).await? {
            Some(expected) => Ok(recovered == expected),
            None => Ok(false),
        }
    }
}

/// Pull the signature string out of either record form.
fn extract_signature(payload: &Value) -> Option<String> {
    payload
        .get("signing")
        .and_then(|s| s.get("signature"))
        .or_else(|| payload.get("sig"))
        .or_else(|| payload.get("signature"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Test verifier: accepts everything except identities it was told to
/// reject, and records the order in which identities were checked.
#[derive(Debug, Default)]
pub struct MockVerifier {
    rejected: Mutex<HashSet<String>>,
    checked: Mutex<Vec<String>>,
}

impl MockVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, identity: &str) {
        self.rejected.lock().unwrap().insert(identity.to_string());
    }

    /// Identities checked so far, in verification order.
    pub fn checked(&self) -> Vec<String> {
        self.checked.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignatureVerifier for MockVerifier {
    async fn verify(&self, _payload: &Value, identity: &str) -> Result<bool, VerifierError> {
        self.checked.lock().unwrap().push(identity.to_string());
        Ok(!self.rejected.lock().unwrap().contains(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signer::OperatorSigner;
    use serde_json::json;

    fn resolver_for(signer: &OperatorSigner, name: &str) -> Box<StaticResolver> {
        let mut resolver = StaticResolver::default();
        resolver.insert(name, signer.address());
        Box::new(resolver)
    }

    #[tokio::test]
    async fn recovers_the_signing_identity() {
        let signer = OperatorSigner::random("alice.swarmbee.eth");
        let verifier = RecoveryVerifier::new(resolver_for(&signer, "alice.swarmbee.eth"));

        let snapshot = json!({
            "type": "CLAIM",
            "issuer": "alice.swarmbee.eth",
            "body": { "job_cid": "bafyjob" },
            "signing": { "scheme": "eip191", "did": "ens:alice.swarmbee.eth",
                         "payload_hash": "", "signature": "" }
        });
        let signed = signer.sign_snapshot(snapshot).await.unwrap();

        assert!(verifier
            .verify(&signed, "alice.swarmbee.eth")
            .await
            .unwrap());
        assert!(verifier.verify(&signed, "ens:alice.swarmbee.eth").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_wrong_identity() {
        let alice = OperatorSigner::random("alice.swarmbee.eth");
        let carol = OperatorSigner::random("carol.swarmbee.eth");

        let mut resolver = StaticResolver::default();
        resolver.insert("alice.swarmbee.eth", alice.address());
        resolver.insert("carol.swarmbee.eth", carol.address());
        let verifier = RecoveryVerifier::new(Box::new(resolver));

        // carol signs but the record claims alice
        let snapshot = json!({
            "type": "JOB",
            "issuer": "alice.swarmbee.eth",
            "body": { "job_id": "job-1" },
            "signing": { "scheme": "eip191", "did": "ens:alice.swarmbee.eth",
                         "payload_hash": "", "signature": "" }
        });
        let signed = carol.sign_snapshot(snapshot).await.unwrap();

        assert!(!verifier.verify(&signed, "alice.swarmbee.eth").await.unwrap());
        assert!(verifier.verify(&signed, "carol.swarmbee.eth").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_tampered_payload() {
        let signer = OperatorSigner::random("alice.swarmbee.eth");
        let verifier = RecoveryVerifier::new(resolver_for(&signer, "alice.swarmbee.eth"));

        let snapshot = json!({
            "type": "PROOF",
            "issuer": "alice.swarmbee.eth",
            "body": { "job_cid": "bafyjob", "output_cid": "bafyout" },
            "signing": { "scheme": "eip191", "did": "ens:alice.swarmbee.eth",
                         "payload_hash": "", "signature": "" }
        });
        let mut signed = signer.sign_snapshot(snapshot).await.unwrap();
        signed["body"]["output_cid"] = json!("bafyforged");

        assert!(!verifier.verify(&signed, "alice.swarmbee.eth").await.unwrap());
    }

    #[tokio::test]
    async fn missing_signature_is_an_error() {
        let signer = OperatorSigner::random("alice.swarmbee.eth");
        let verifier = RecoveryVerifier::new(resolver_for(&signer, "alice.swarmbee.eth"));

        let unsigned = json!({ "type": "JOB", "body": {} });
        assert!(matches!(
            verifier.verify(&unsigned, "alice.swarmbee.eth").await,
            Err(VerifierError::MissingSignature)
        ));
    }

    #[tokio::test]
    async fn unresolvable_identity_is_invalid() {
        let signer = OperatorSigner::random("alice.swarmbee.eth");
        let verifier = RecoveryVerifier::new(Box::new(StaticResolver::default()));

        let snapshot = json!({
            "type": "HEARTBEAT",
            "issuer": "alice.swarmbee.eth",
            "body": { "miner": "alice.swarmbee.eth" },
            "signing": { "scheme": "eip191", "did": "ens:alice.swarmbee.eth",
                         "payload_hash": "", "signature": "" }
        });
        let signed = signer.sign_snapshot(snapshot).await.unwrap();
        assert!(!verifier.verify(&signed, "alice.swarmbee.eth").await.unwrap());
    }
}
