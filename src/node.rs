// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process assembly: construct every component, wire the constructor graph,
//! spawn the background tasks, and run the pipeline until shutdown.
//!
//! On a shutdown signal the orchestrator stops taking new blocks, the
//! in-flight block (including a pending on-chain pause) drains, the cache
//! flushes, and the process exits cleanly.

use crate::abi::DepositSecurityModule;
use crate::broker::{create_publisher, Broadcaster};
use crate::config::GuardianConfig;
use crate::deposit_cache::{CacheStore, DepositCache, DepositCacheConfig};
use crate::error::GuardianResult;
use crate::eth_client::EthClient;
use crate::guardian_state::ContractStateProbe;
use crate::keys_api::HttpKeysApiClient;
use crate::metrics::GuardianMetrics;
use crate::orchestrator::{spawn_head_poller, Orchestrator, OrchestratorConfig};
use crate::pause_submitter::{OnChainPauseSender, PauseSubmitter};
use crate::server;
use crate::signer::GuardianSigner;
use prometheus::Registry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run_guardian_node(
    config: GuardianConfig,
    registry: Registry,
) -> GuardianResult<()> {
    let metrics = Arc::new(GuardianMetrics::new(&registry));

    let client = Arc::new(
        EthClient::new(
            &config.rpc_url,
            config.deposit_contract_address,
            config.chain_id,
            metrics.clone(),
            config.rpc_call_timeout,
        )
        .await?,
    );

    let signer = Arc::new(GuardianSigner::new(&config.wallet_private_key)?);
    info!("guardian wallet address: {:?}", signer.address());

    let store = CacheStore::new(&config.cache_dir)?;
    let cache = Arc::new(
        DepositCache::load(
            client.clone(),
            store,
            config.chain_id,
            DepositCacheConfig {
                fetch_window: config.fetch_window,
                finalization_depth: config.finalization_depth,
            },
            metrics.clone(),
        )
        .await?,
    );

    let probe = Arc::new(ContractStateProbe::new(
        client.provider(),
        config.dsm_address,
        config.staking_router_address,
        config.deposit_contract_address,
        signer.address(),
    ));

    let keys_api = Arc::new(HttpKeysApiClient::new(
        config.keys_api_url.clone(),
        config.registry_keys_query_batch_size,
        config.registry_keys_query_concurrency,
        config.keys_api_timeout,
        metrics.clone(),
    )?);

    let publisher = create_publisher(
        &config.pubsub,
        &config.broker_topic,
        config.bus_publish_timeout,
    )
    .await?;
    let broadcaster = Broadcaster::new(publisher, config.bus_publish_timeout, metrics.clone());

    let pause_sender = Arc::new(
        OnChainPauseSender::connect(
            &config.rpc_url,
            &config.wallet_private_key,
            config.chain_id,
            config.dsm_address,
            config.staking_router_address,
        )
        .await?,
    );
    let pause_submitter = Arc::new(PauseSubmitter::new(pause_sender, metrics.clone()));

    let dsm = DepositSecurityModule::new(config.dsm_address, client.provider());

    let orchestrator = Arc::new(Orchestrator::new(
        client.clone(),
        cache.clone(),
        probe,
        keys_api,
        signer,
        dsm,
        broadcaster,
        pause_submitter,
        metrics.clone(),
        OrchestratorConfig {
            confirmation_depth: config.confirmation_depth,
            max_snapshot_lag: config.max_snapshot_lag,
            rpc_retry_budget: config.rpc_call_timeout,
        },
    ));

    let cancel = CancellationToken::new();

    let (head_rx, poller_handle) =
        spawn_head_poller(client, config.block_poll_interval, cancel.clone());
    let server_handle = tokio::spawn(server::serve(
        config.port,
        registry,
        metrics,
        cancel.clone(),
    ));

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    // Runs until shutdown or a fatal fault; the in-flight block drains
    // before this returns.
    let result = orchestrator.run(head_rx, cancel.clone()).await;

    cancel.cancel();
    let _ = poller_handle.await;
    let _ = server_handle.await;
    cache.flush().await?;
    info!("deposit guardian stopped");
    result
}
