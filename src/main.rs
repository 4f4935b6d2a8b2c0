// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::Result;
use std::env;
use std::sync::Arc;
use swarmpool_daemon::{
    crypto::EnsResolver, HttpContentStore, HttpSidecar, HttpTransport, PoolConfig, PoolDaemon,
    RecoveryVerifier, StaticResolver,
};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    println!("🐝 Starting SwarmPool daemon...\n");

    let config = PoolConfig::from_env()?;

    println!("Pool:           {}", config.pool_ens);
    println!("Content store:  {}", config.content_store_api);
    println!("Sidecar:        {}", config.sidecar_url);
    println!("Pub/sub:        {}", config.pubsub_gateway);
    println!(
        "Epoch/claim/miner timeouts: {}s / {}s / {}s",
        config.epoch_duration_secs, config.claim_timeout_secs, config.miner_timeout_secs
    );

    let store = Arc::new(HttpContentStore::new(&config.content_store_api));
    let sidecar = Arc::new(HttpSidecar::new(&config.sidecar_url));
    let transport = Arc::new(HttpTransport::new(&config.pubsub_gateway));

    // Identity resolution: an Ethereum RPC endpoint when configured,
    // otherwise an empty static registry (every inbound signature is then
    // rejected, which is the safe default for a misconfigured pool).
    let verifier: Arc<RecoveryVerifier> = match env::var("ETH_RPC_URL") {
        Ok(rpc_url) => {
            println!("ENS resolver:   {}", rpc_url);
            Arc::new(RecoveryVerifier::new(Box::new(EnsResolver::new(&rpc_url)?)))
        }
        Err(_) => {
            eprintln!("⚠️  ETH_RPC_URL not set - inbound signatures cannot be resolved");
            Arc::new(RecoveryVerifier::new(Box::new(StaticResolver::default())))
        }
    };

    let mut daemon = PoolDaemon::new(config, store, verifier, transport, sidecar)?;
    daemon.start().await?;

    println!("\n✅ SwarmPool daemon is running. Press Ctrl+C to shutdown...\n");

    signal::ctrl_c().await?;

    println!("\n⏹️  Shutting down...");
    daemon.stop().await;
    println!("👋 Goodbye!");
    Ok(())
}
