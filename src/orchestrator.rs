// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-block security pipeline.
//!
//! One logical loop gated by block arrivals: resolve the pipeline block,
//! probe guardian/module context, bring the deposit cache current, fetch the
//! registry snapshot, and produce at most one decision per staking module —
//! attest, pause, or skip. Head notifications arrive through a watch
//! channel, so bursts coalesce and only the latest unprocessed head is taken
//! next. Decisions for a block are fully published before the next block is
//! touched.

use crate::abi::DepositSecurityModule;
use crate::broker::{Broadcaster, BusMessage};
use crate::deposit_cache::DepositCache;
use crate::detector::{Conflict, ConflictDetector};
use crate::error::{GuardianError, GuardianResult};
use crate::eth_client::EthClient;
use crate::guardian_state::{BlockContext, StateProbe};
use crate::keys_api::{validate_snapshot_freshness, KeysApiClient};
use crate::metrics::GuardianMetrics;
use crate::pause_submitter::{PauseState, PauseSubmitter};
use crate::retry_within_budget;
use crate::signer::GuardianSigner;
use crate::types::{
    AttestMessage, Decision, PauseMessage, RegistryKeySnapshot, SkipReason, StakingModuleState,
};
use ethers::providers::{JsonRpcClient, Provider};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug)]
pub struct OrchestratorConfig {
    pub confirmation_depth: u64,
    pub max_snapshot_lag: u64,
    /// Retry budget for transient provider faults within one block's run
    pub rpc_retry_budget: Duration,
}

pub struct Orchestrator<P> {
    client: Arc<EthClient<P>>,
    cache: Arc<DepositCache<P>>,
    detector: ConflictDetector<P>,
    probe: Arc<dyn StateProbe>,
    keys_api: Arc<dyn KeysApiClient>,
    signer: Arc<GuardianSigner>,
    dsm: DepositSecurityModule<Provider<P>>,
    broadcaster: Broadcaster,
    pause_submitter: Arc<PauseSubmitter>,
    metrics: Arc<GuardianMetrics>,
    config: OrchestratorConfig,
    last_membership: std::sync::Mutex<Option<bool>>,
}

impl<P> Orchestrator<P>
where
    P: JsonRpcClient + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<EthClient<P>>,
        cache: Arc<DepositCache<P>>,
        probe: Arc<dyn StateProbe>,
        keys_api: Arc<dyn KeysApiClient>,
        signer: Arc<GuardianSigner>,
        dsm: DepositSecurityModule<Provider<P>>,
        broadcaster: Broadcaster,
        pause_submitter: Arc<PauseSubmitter>,
        metrics: Arc<GuardianMetrics>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            detector: ConflictDetector::new(cache.clone()),
            cache,
            probe,
            keys_api,
            signer,
            dsm,
            broadcaster,
            pause_submitter,
            metrics,
            config,
            last_membership: std::sync::Mutex::new(None),
        }
    }

    /// Main loop. Returns on shutdown, or with the error on a fatal fault.
    pub async fn run(
        &self,
        mut head_rx: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) -> GuardianResult<()> {
        let mut last_processed: Option<u64> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[Orchestrator] shutdown requested, stopping block intake");
                    return Ok(());
                }
                changed = head_rx.changed() => {
                    if changed.is_err() {
                        warn!("[Orchestrator] head channel closed");
                        return Ok(());
                    }
                }
            }

            let head = *head_rx.borrow_and_update();
            self.metrics.head_block.set(head as i64);
            if head < self.config.confirmation_depth {
                continue;
            }
            let target = head - self.config.confirmation_depth;
            if Some(target) <= last_processed {
                continue;
            }

            let started = std::time::Instant::now();
            match self.process_block(target).await {
                Ok(decisions) => {
                    self.metrics
                        .block_processing_latency
                        .with_label_values(&["ok"])
                        .observe(started.elapsed().as_secs_f64());
                    self.metrics.last_processed_block.set(target as i64);
                    for (module_id, decision) in &decisions {
                        self.metrics
                            .decisions
                            .with_label_values(&[decision.label()])
                            .inc();
                        if let Decision::Skip(reason) = decision {
                            self.metrics
                                .skips
                                .with_label_values(&[reason.as_str()])
                                .inc();
                            info!(
                                "[Orchestrator] block {} module {}: skip ({})",
                                target,
                                module_id,
                                reason.as_str()
                            );
                        }
                    }
                    last_processed = Some(target);
                }
                Err(e) if e.is_fatal() => {
                    error!("[Orchestrator] fatal error at block {}: {}", target, e);
                    cancel.cancel();
                    return Err(e);
                }
                Err(e) => {
                    self.metrics
                        .block_processing_latency
                        .with_label_values(&["error"])
                        .observe(started.elapsed().as_secs_f64());
                    self.metrics
                        .skips
                        .with_label_values(&[SkipReason::RpcError.as_str()])
                        .inc();
                    // The block is reattempted on the next tick
                    warn!("[Orchestrator] block {} not processed: {}", target, e);
                }
            }
        }
    }

    /// Run the pipeline for one block, producing one decision per module.
    pub async fn process_block(&self, number: u64) -> GuardianResult<Vec<(u32, Decision)>> {
        let block = retry_within_budget!(
            self.client.get_block_ref(number),
            self.config.rpc_retry_budget
        )?;

        let context = self.probe.probe(block).await?;
        self.note_membership(&context);

        self.cache.advance_to(number).await?;

        let snapshot = match self.fetch_validated_snapshot(&context).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // Precondition failure: every module skips this block
                let reason = match e {
                    GuardianError::Stale(_) => {
                        self.metrics.stale_snapshots.inc();
                        SkipReason::StaleSnapshot
                    }
                    GuardianError::Inconsistent(_) => SkipReason::InconsistentSnapshot,
                    _ => SkipReason::RpcError,
                };
                warn!(
                    "[Orchestrator] block {}: registry snapshot unusable ({})",
                    number, e
                );
                return Ok(context
                    .modules
                    .iter()
                    .map(|m| (m.id, Decision::Skip(reason)))
                    .collect());
            }
        };

        // Never consult events newer than the snapshot block: the registry
        // has no opinion on deposits it has not indexed yet
        let scan_cap = std::cmp::min(number, snapshot.snapshot_block.number);

        let mut decisions = Vec::with_capacity(context.modules.len());
        for module in &context.modules {
            let decision = self
                .process_module(&context, module, &snapshot, scan_cap)
                .await;
            decisions.push((module.id, decision));
        }
        Ok(decisions)
    }

    async fn fetch_validated_snapshot(
        &self,
        context: &BlockContext,
    ) -> GuardianResult<RegistryKeySnapshot> {
        let snapshot = self.keys_api.fetch_snapshot().await?;
        let canonical = self
            .client
            .get_block_ref(snapshot.snapshot_block.number)
            .await?;
        validate_snapshot_freshness(
            &snapshot.snapshot_block,
            &context.block,
            &canonical,
            self.config.max_snapshot_lag,
        )?;
        self.metrics.keys_api_snapshot_lag_blocks.set(
            context
                .block
                .number
                .abs_diff(snapshot.snapshot_block.number) as i64,
        );
        Ok(snapshot)
    }

    async fn process_module(
        &self,
        context: &BlockContext,
        module: &StakingModuleState,
        snapshot: &RegistryKeySnapshot,
        scan_cap: u64,
    ) -> Decision {
        let pause_state = self.pause_submitter.state(module.id).await;
        if pause_state == PauseState::OnChainPending {
            return Decision::Skip(SkipReason::PausePending);
        }
        if pause_state == PauseState::Failed && !module.is_active {
            // The module already reports paused (our broadcast message got
            // aggregated, or another guardian acted) but our own submission
            // never confirmed. Finish it without re-broadcasting.
            return self.retry_failed_pause(context, module).await;
        }
        if !module.is_active {
            return Decision::Skip(SkipReason::ModuleInactive);
        }

        let empty = HashSet::new();
        let unused = snapshot.unused_for_module(module.id).unwrap_or(&empty);
        let conflicts = self
            .detector
            .find_conflicts(
                module.id,
                unused,
                context.withdrawal_credentials,
                scan_cap,
            )
            .await;

        if conflicts.is_empty() {
            if pause_state == PauseState::Failed {
                // The threat this submission answered is gone
                self.pause_submitter.set_state(module.id, PauseState::Idle).await;
            }
            if !context.guardian.is_member() {
                return Decision::Skip(SkipReason::NotGuardian);
            }
            match self.attest(context, module).await {
                Ok(()) => Decision::Attest,
                Err(e) => {
                    warn!(
                        "[Orchestrator] attest for module {} failed: {}",
                        module.id, e
                    );
                    Decision::Skip(SkipReason::RpcError)
                }
            }
        } else {
            if !context.guardian.is_member() {
                // The contract would reject both our signature and our
                // pause transaction; all we can do is raise the alarm.
                error!(
                    "[Orchestrator] key conflict on module {} but wallet {:?} is not a guardian; \
                     cannot sign or submit pause",
                    module.id, context.guardian.address
                );
                return Decision::Skip(SkipReason::NotGuardian);
            }
            match self.pause(context, module, &conflicts).await {
                Ok(true) => Decision::Pause,
                Ok(false) => Decision::Skip(SkipReason::InconsistentSnapshot),
                Err(e) => {
                    // Never silently swallowed: the conflict re-detects on
                    // the next block and the pause path retries.
                    error!(
                        "[Orchestrator] pause for module {} failed: {}; retrying next block",
                        module.id, e
                    );
                    Decision::Skip(SkipReason::RpcError)
                }
            }
        }
    }

    async fn attest(
        &self,
        context: &BlockContext,
        module: &StakingModuleState,
    ) -> GuardianResult<()> {
        let prefixes = self.signer.prefixes(&self.dsm).await?;
        let signature = self.signer.sign_attest(
            prefixes.attest,
            context.deposit_root,
            module.nonce,
            context.block.number,
            context.block.hash,
            module.id,
        )?;
        let message = AttestMessage {
            block_number: context.block.number,
            block_hash: context.block.hash,
            deposit_root: context.deposit_root,
            nonce: module.nonce,
            staking_module_id: module.id,
            guardian: context.guardian,
            signature,
        };
        self.broadcaster
            .broadcast(&BusMessage::deposit(&message))
            .await
    }

    /// Sign, broadcast and submit the pause. Returns `Ok(false)` if the
    /// sign-time double check no longer sees the conflict.
    async fn pause(
        &self,
        context: &BlockContext,
        module: &StakingModuleState,
        conflicts: &[Conflict],
    ) -> GuardianResult<bool> {
        // Double-check rule: re-evaluate at the watermark of this moment
        let confirmed = self
            .detector
            .confirm(conflicts, context.withdrawal_credentials)
            .await;
        if confirmed.is_empty() {
            warn!(
                "[Orchestrator] conflict on module {} not confirmed at signing time",
                module.id
            );
            return Ok(false);
        }

        let prefixes = self.signer.prefixes(&self.dsm).await?;
        self.pause_submitter
            .set_state(module.id, PauseState::Signing)
            .await;
        let signature =
            self.signer
                .sign_pause(prefixes.pause, context.block.number, module.id)?;
        let message = PauseMessage {
            block_number: context.block.number,
            block_hash: context.block.hash,
            staking_module_id: module.id,
            guardian: context.guardian,
            signature,
        };

        self.pause_submitter
            .set_state(module.id, PauseState::Broadcasting)
            .await;
        if let Err(e) = self.broadcaster.broadcast(&BusMessage::pause(&message)).await {
            self.pause_submitter
                .set_state(module.id, PauseState::Failed)
                .await;
            return Err(e);
        }

        self.pause_submitter
            .submit(context.block.number, module.id, &signature)
            .await?;
        Ok(true)
    }

    async fn retry_failed_pause(
        &self,
        context: &BlockContext,
        module: &StakingModuleState,
    ) -> Decision {
        if !context.guardian.is_member() {
            return Decision::Skip(SkipReason::NotGuardian);
        }
        let prefixes = match self.signer.prefixes(&self.dsm).await {
            Ok(prefixes) => prefixes,
            Err(e) => {
                warn!("[Orchestrator] cannot load prefixes for pause retry: {}", e);
                return Decision::Skip(SkipReason::RpcError);
            }
        };
        let signature = match self
            .signer
            .sign_pause(prefixes.pause, context.block.number, module.id)
        {
            Ok(signature) => signature,
            Err(e) => {
                error!("[Orchestrator] pause re-signing failed: {}", e);
                return Decision::Skip(SkipReason::RpcError);
            }
        };
        match self
            .pause_submitter
            .submit(context.block.number, module.id, &signature)
            .await
        {
            Ok(()) => Decision::Pause,
            Err(e) => {
                error!(
                    "[Orchestrator] pause resubmission for module {} failed: {}; retrying next block",
                    module.id, e
                );
                Decision::Skip(SkipReason::RpcError)
            }
        }
    }

    // Membership transitions are logged once per change, not once per block.
    fn note_membership(&self, context: &BlockContext) {
        let member = context.guardian.is_member();
        let mut last = self.last_membership.lock().unwrap();
        if *last != Some(member) {
            if member {
                info!(
                    "[Orchestrator] wallet {:?} is guardian #{} in the on-chain set",
                    context.guardian.address, context.guardian.index
                );
            } else {
                warn!(
                    "[Orchestrator] wallet {:?} is NOT in the on-chain guardian set; \
                     running in observer mode",
                    context.guardian.address
                );
            }
            *last = Some(member);
        }
    }
}

/// Poll the provider head and publish increases into a watch channel.
///
/// The pipeline only ever reads the latest value, so slow processing
/// naturally coalesces bursts of new blocks.
pub fn spawn_head_poller<P>(
    client: Arc<EthClient<P>>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> (watch::Receiver<u64>, tokio::task::JoinHandle<()>)
where
    P: JsonRpcClient + 'static,
{
    let (tx, rx) = watch::channel(0u64);
    let handle = tokio::spawn(async move {
        let mut interval = time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[HeadPoller] cancelled");
                    break;
                }
                _ = interval.tick() => {
                    match client.get_head_number().await {
                        Ok(head) if head > last => {
                            last = head;
                            if tx.send(head).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("[HeadPoller] cannot fetch head: {}", e);
                        }
                    }
                }
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BusMessageType;
    use crate::config::WalletKey;
    use crate::deposit_cache::{CacheStore, DepositCacheConfig};
    use crate::test_utils::{
        deposit_log_json, encode_call_result, get_logs_params, mock_block_json, test_block_ref,
        test_hash, test_pubkey, FakeKeysApi, FakeProbe, MemoryPublisher, MockJsonRpcClient,
        MockPauseSender, TEST_CHAIN_ID, TEST_DEPOSIT_CONTRACT, TEST_WALLET_KEY,
        TEST_WITHDRAWAL_CREDENTIALS,
    };
    use crate::types::GuardianIdentity;
    use ethers::abi::Token;
    use ethers::types::{Address, H256};
    use serde_json::json;
    use std::collections::{BTreeMap, HashSet};

    struct Harness {
        orchestrator: Arc<Orchestrator<MockJsonRpcClient>>,
        mock: MockJsonRpcClient,
        publisher: Arc<MemoryPublisher>,
        probe: Arc<FakeProbe>,
        keys_api: Arc<FakeKeysApi>,
        sender: Arc<MockPauseSender>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let mock = MockJsonRpcClient::new();
        let metrics = GuardianMetrics::new_for_testing();
        let client = Arc::new(EthClient::new_with_provider(
            Provider::new(mock.clone()),
            TEST_DEPOSIT_CONTRACT.parse().unwrap(),
            TEST_CHAIN_ID,
        ));
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            DepositCache::load(
                client.clone(),
                CacheStore::new(dir.path()).unwrap(),
                TEST_CHAIN_ID,
                DepositCacheConfig {
                    fetch_window: 1_000,
                    finalization_depth: 32,
                },
                metrics.clone(),
            )
            .await
            .unwrap(),
        );
        let probe = Arc::new(FakeProbe::new());
        let keys_api = Arc::new(FakeKeysApi::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let signer = Arc::new(
            GuardianSigner::new(&WalletKey::new(TEST_WALLET_KEY).unwrap()).unwrap(),
        );
        // Message prefixes are served through the mocked provider
        mock.add_queued_response(
            "eth_call",
            encode_call_result(&[Token::FixedBytes(vec![0xa7; 32])]),
        );
        mock.add_queued_response(
            "eth_call",
            encode_call_result(&[Token::FixedBytes(vec![0xb7; 32])]),
        );
        let dsm = DepositSecurityModule::new(
            Address::from_low_u64_be(0x10),
            Arc::new(Provider::new(mock.clone())),
        );
        let sender = Arc::new(MockPauseSender::new());
        let submitter = Arc::new(PauseSubmitter::new(sender.clone(), metrics.clone()));
        let broadcaster = Broadcaster::new(
            publisher.clone(),
            Duration::from_millis(50),
            metrics.clone(),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            client,
            cache,
            probe.clone(),
            keys_api.clone(),
            signer,
            dsm,
            broadcaster,
            submitter,
            metrics,
            OrchestratorConfig {
                confirmation_depth: 6,
                max_snapshot_lag: 50,
                rpc_retry_budget: Duration::from_millis(50),
            },
        ));
        Harness {
            orchestrator,
            mock,
            publisher,
            probe,
            keys_api,
            sender,
            _dir: dir,
        }
    }

    fn module(id: u32, is_active: bool) -> StakingModuleState {
        StakingModuleState {
            id,
            is_active,
            nonce: 7,
            last_deposit_block: 50,
        }
    }

    fn context(
        block: u64,
        guardian_index: i32,
        modules: Vec<StakingModuleState>,
    ) -> crate::guardian_state::BlockContext {
        crate::guardian_state::BlockContext {
            block: test_block_ref(block),
            guardian: GuardianIdentity {
                address: Address::from_low_u64_be(0xaa),
                index: guardian_index,
            },
            deposit_root: H256([0xd0; 32]),
            withdrawal_credentials: TEST_WITHDRAWAL_CREDENTIALS,
            modules,
        }
    }

    fn snapshot(block: u64, unused: Vec<crate::types::ValidatorPubkey>) -> RegistryKeySnapshot {
        RegistryKeySnapshot {
            snapshot_block: test_block_ref(block),
            used: HashSet::new(),
            unused_by_module: BTreeMap::from([(1, unused.into_iter().collect())]),
        }
    }

    fn script_header(mock: &MockJsonRpcClient, number: u64) {
        mock.add_response(
            "eth_getBlockByNumber",
            json!([format!("{:#x}", number), false]),
            mock_block_json(number, test_hash(number), 1_700_000_000 + number),
        );
    }

    // Headers, log windows and the head number for one process_block(target)
    // over a cache whose watermark is `from`.
    fn script_block(
        mock: &MockJsonRpcClient,
        from: u64,
        target: u64,
        logs: Vec<serde_json::Value>,
    ) {
        script_header(mock, target);
        mock.add_response("eth_getLogs", get_logs_params(from, target), json!(logs));
        mock.add_response(
            "eth_blockNumber",
            json!(null),
            json!(format!("{:#x}", target + 6)),
        );
    }

    #[tokio::test]
    async fn test_no_conflict_publishes_single_attest() {
        let h = harness().await;
        // Deposited {A, B}, unused {C}
        script_header(&h.mock, 10);
        script_header(&h.mock, 20);
        script_header(&h.mock, 95);
        script_block(
            &h.mock,
            0,
            100,
            vec![
                deposit_log_json(10, test_hash(10), 0, 0xa1),
                deposit_log_json(20, test_hash(20), 0, 0xb2),
            ],
        );
        h.probe.set_context(context(100, 2, vec![module(1, true)]));
        h.keys_api.set_snapshot(snapshot(95, vec![test_pubkey(0xc3)]));

        let decisions = h.orchestrator.process_block(100).await.unwrap();
        assert_eq!(decisions, vec![(1, Decision::Attest)]);

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_type, BusMessageType::Deposit);
        assert_eq!(published[0].block_number, 100);
        assert_eq!(published[0].deposit_root, Some(H256([0xd0; 32])));
        assert_eq!(published[0].nonce, Some(7));
        assert_eq!(published[0].guardian_index, 2);
        // No on-chain transaction
        assert!(h.sender.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_deposit_history_attests() {
        let h = harness().await;
        script_header(&h.mock, 95);
        script_block(&h.mock, 0, 100, vec![]);
        h.probe.set_context(context(100, 0, vec![module(1, true)]));
        h.keys_api.set_snapshot(snapshot(95, vec![test_pubkey(0xc3)]));

        let decisions = h.orchestrator.process_block(100).await.unwrap();
        assert_eq!(decisions, vec![(1, Decision::Attest)]);
    }

    #[tokio::test]
    async fn test_conflict_publishes_pause_and_submits_on_chain() {
        let h = harness().await;
        // Unused key D is already on the deposit list
        script_header(&h.mock, 10);
        script_header(&h.mock, 95);
        script_block(
            &h.mock,
            0,
            100,
            vec![deposit_log_json(10, test_hash(10), 0, 0xd4)],
        );
        h.probe.set_context(context(100, 2, vec![module(1, true)]));
        h.keys_api.set_snapshot(snapshot(95, vec![test_pubkey(0xd4)]));

        let decisions = h.orchestrator.process_block(100).await.unwrap();
        assert_eq!(decisions, vec![(1, Decision::Pause)]);

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_type, BusMessageType::Pause);
        assert_eq!(published[0].block_number, 100);
        // Pause messages never carry attest fields
        assert_eq!(published[0].deposit_root, None);
        assert_eq!(published[0].nonce, None);
        // Exactly one on-chain submission, for this block and module
        assert_eq!(h.sender.calls(), vec![(100, 1)]);
    }

    #[tokio::test]
    async fn test_stale_snapshot_skips_without_signing() {
        let h = harness().await;
        script_header(&h.mock, 40);
        script_block(&h.mock, 0, 100, vec![]);
        h.probe.set_context(context(100, 2, vec![module(1, true)]));
        // Snapshot lags by 60 blocks with MAX_SNAPSHOT_LAG = 50
        h.keys_api.set_snapshot(snapshot(40, vec![]));

        let decisions = h.orchestrator.process_block(100).await.unwrap();
        assert_eq!(
            decisions,
            vec![(1, Decision::Skip(SkipReason::StaleSnapshot))]
        );
        assert!(h.publisher.published().is_empty());
        assert!(h.sender.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reorged_snapshot_block_is_stale() {
        let h = harness().await;
        script_block(&h.mock, 0, 100, vec![]);
        h.probe.set_context(context(100, 2, vec![module(1, true)]));
        // The registry indexed block 95, but the canonical chain now has a
        // different hash at that height.
        h.mock.add_response(
            "eth_getBlockByNumber",
            json!(["0x5f", false]),
            mock_block_json(95, test_hash(4_242), 1_700_000_095),
        );
        h.keys_api.set_snapshot(snapshot(95, vec![]));

        let decisions = h.orchestrator.process_block(100).await.unwrap();
        assert_eq!(
            decisions,
            vec![(1, Decision::Skip(SkipReason::StaleSnapshot))]
        );
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_not_guardian_never_signs_even_on_conflict() {
        let h = harness().await;
        script_header(&h.mock, 10);
        script_header(&h.mock, 95);
        script_block(
            &h.mock,
            0,
            100,
            vec![deposit_log_json(10, test_hash(10), 0, 0xd4)],
        );
        // guardian_index = -1
        h.probe.set_context(context(100, -1, vec![module(1, true)]));
        h.keys_api.set_snapshot(snapshot(95, vec![test_pubkey(0xd4)]));

        let decisions = h.orchestrator.process_block(100).await.unwrap();
        assert_eq!(decisions, vec![(1, Decision::Skip(SkipReason::NotGuardian))]);
        assert!(h.publisher.published().is_empty());
        // On-chain submission is blocked too: the contract would reject it
        assert!(h.sender.calls().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_module_is_skipped() {
        let h = harness().await;
        script_header(&h.mock, 95);
        script_block(&h.mock, 0, 100, vec![]);
        h.probe.set_context(context(100, 2, vec![module(1, false)]));
        h.keys_api.set_snapshot(snapshot(95, vec![]));

        let decisions = h.orchestrator.process_block(100).await.unwrap();
        assert_eq!(
            decisions,
            vec![(1, Decision::Skip(SkipReason::ModuleInactive))]
        );
    }

    #[tokio::test]
    async fn test_messages_ordered_across_blocks() {
        let h = harness().await;
        script_header(&h.mock, 95);
        script_block(&h.mock, 0, 100, vec![]);
        h.probe.set_context(context(100, 2, vec![module(1, true)]));
        h.keys_api.set_snapshot(snapshot(95, vec![test_pubkey(0xc3)]));
        h.orchestrator.process_block(100).await.unwrap();

        // Next block: same decision, still re-published (freshness)
        script_block(&h.mock, 101, 101, vec![]);
        h.probe.set_context(context(101, 2, vec![module(1, true)]));
        h.orchestrator.process_block(101).await.unwrap();

        let published = h.publisher.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].block_number, 100);
        assert_eq!(published[1].block_number, 101);
    }

    #[tokio::test]
    async fn test_pause_retry_completes_without_rebroadcast() {
        let h = harness().await;
        script_header(&h.mock, 10);
        script_header(&h.mock, 95);
        script_block(
            &h.mock,
            0,
            100,
            vec![deposit_log_json(10, test_hash(10), 0, 0xd4)],
        );
        h.probe.set_context(context(100, 2, vec![module(1, true)]));
        h.keys_api.set_snapshot(snapshot(95, vec![test_pubkey(0xd4)]));

        // First submission fails with a transient error
        h.sender.fail_next("connection reset");
        let decisions = h.orchestrator.process_block(100).await.unwrap();
        assert_eq!(decisions, vec![(1, Decision::Skip(SkipReason::RpcError))]);
        assert_eq!(h.publisher.published().len(), 1);

        // Next block: the module now reports paused. The submitter retries,
        // observes "already paused", and completes without a new message.
        script_block(&h.mock, 101, 101, vec![]);
        h.probe.set_context(context(101, 2, vec![module(1, false)]));
        h.sender.fail_next("execution reverted");
        h.sender.mark_paused(1);
        let decisions = h.orchestrator.process_block(101).await.unwrap();
        assert_eq!(decisions, vec![(1, Decision::Pause)]);
        // Still exactly one pause message on the bus
        assert_eq!(h.publisher.published().len(), 1);
        assert_eq!(h.sender.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_run_loop_processes_latest_head_and_drains_on_cancel() {
        let h = harness().await;
        script_header(&h.mock, 95);
        script_block(&h.mock, 0, 100, vec![]);
        h.probe.set_context(context(100, 2, vec![module(1, true)]));
        h.keys_api.set_snapshot(snapshot(95, vec![test_pubkey(0xc3)]));

        let (head_tx, head_rx) = watch::channel(0u64);
        let cancel = CancellationToken::new();
        let orchestrator = h.orchestrator.clone();
        let run_cancel = cancel.clone();
        let handle =
            tokio::spawn(async move { orchestrator.run(head_rx, run_cancel).await });

        // Head 106 resolves to pipeline block 100 (confirmation depth 6)
        head_tx.send(106).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].block_number, 100);
    }
}
