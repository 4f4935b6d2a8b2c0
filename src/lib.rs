// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod epoch;
pub mod router;
pub mod schema;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod transport;

// Re-export main types
pub use config::PoolConfig;
pub use crypto::{
    canonical_json, payload_hash, MockVerifier, OperatorSigner, RecoveryVerifier,
    SignatureVerifier, StaticResolver,
};
pub use daemon::PoolDaemon;
pub use epoch::{compute_settlements, merkle_root, EpochEngine, SealError, Settlements};
pub use router::{MessageRouter, RouterError};
pub use state::{ClaimEntry, EpochState, MinerRecord, MinerStatus, PoolState, ProofRecord};
pub use storage::{
    ContentStore, HttpContentStore, HttpSidecar, MemorySidecar, MockContentStore, SidecarError,
    SidecarStore, StorageError,
};
pub use supervisor::{build_state_snapshot, Shutdown, Supervisor};
pub use transport::{HttpTransport, MockTransport, Transport, TransportError, TransportMessage};
