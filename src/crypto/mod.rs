// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Snapshot signing and signature verification.
//!
//! - **Signer**: canonical JSON serialization, keccak256 payload hashing,
//!   EIP-191 signing of outgoing snapshots with the operator key
//! - **Verifier**: ECDSA signature recovery for inbound records, with the
//!   recovered address checked against the issuer's resolved identity
//!
//! Signatures are verified before any record mutates pool state.

pub mod signer;
pub mod verifier;

pub use signer::{canonical_json, payload_hash, OperatorSigner};
pub use verifier::{
    EnsResolver, IdentityResolver, MockVerifier, RecoveryVerifier, SignatureVerifier,
    StaticResolver, VerifierError,
};
