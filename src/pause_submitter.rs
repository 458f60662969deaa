// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! On-chain `pauseDeposits` submission.
//!
//! All submissions share one process-wide mutex: the guardian wallet signs
//! transactions with sequential nonces, and two in-flight pause transactions
//! would race each other off the chain. A module whose submission is pending
//! is skipped until it resolves; a failed submission is retried on the next
//! block's pipeline run.

use crate::abi::{deposit_security_module::Signature, DepositSecurityModule, StakingRouter};
use crate::config::WalletKey;
use crate::error::{GuardianError, GuardianResult};
use crate::metrics::GuardianMetrics;
use crate::types::GuardianSignature;
use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256, U64};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub type EthSigner = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Seam between the submitter's sequencing logic and the chain.
#[async_trait]
pub trait PauseTransactionSender: Send + Sync {
    /// Submit `pauseDeposits(blockNumber, moduleId, (r, vs))` and wait for
    /// one confirmation.
    async fn send_pause(
        &self,
        block_number: u64,
        staking_module_id: u32,
        signature: &GuardianSignature,
    ) -> GuardianResult<()>;

    /// Whether the module already reports deposits paused.
    async fn is_module_paused(&self, staking_module_id: u32) -> GuardianResult<bool>;
}

/// Production sender over a wallet-connected provider.
pub struct OnChainPauseSender {
    dsm: DepositSecurityModule<EthSigner>,
    router: StakingRouter<EthSigner>,
}

impl OnChainPauseSender {
    pub async fn connect(
        rpc_url: &str,
        wallet_key: &WalletKey,
        chain_id: u64,
        dsm_address: Address,
        router_address: Address,
    ) -> GuardianResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| GuardianError::ConfigInvalid(format!("RPC_URL is invalid: {}", e)))?
            .interval(Duration::from_millis(2_000));
        let wallet: LocalWallet = wallet_key
            .expose()
            .parse::<LocalWallet>()
            .map_err(|e| GuardianError::Fatal(format!("corrupt wallet private key: {}", e)))?
            .with_chain_id(chain_id);
        let signer = Arc::new(SignerMiddleware::new(provider, wallet));
        Ok(Self {
            dsm: DepositSecurityModule::new(dsm_address, signer.clone()),
            router: StakingRouter::new(router_address, signer),
        })
    }
}

#[async_trait]
impl PauseTransactionSender for OnChainPauseSender {
    async fn send_pause(
        &self,
        block_number: u64,
        staking_module_id: u32,
        signature: &GuardianSignature,
    ) -> GuardianResult<()> {
        let call = self.dsm.pause_deposits(
            U256::from(block_number),
            U256::from(staking_module_id),
            Signature {
                r: signature.r.0,
                vs: signature.vs().0,
            },
        );
        let pending = call
            .send()
            .await
            .map_err(|e| GuardianError::Transient(format!("pauseDeposits submission: {}", e)))?;
        let receipt = pending
            .await
            .map_err(|e| GuardianError::Transient(format!("pauseDeposits confirmation: {}", e)))?
            .ok_or_else(|| {
                GuardianError::Transient("pauseDeposits transaction dropped from the pool".into())
            })?;
        if receipt.status != Some(U64::one()) {
            return Err(GuardianError::Transient(format!(
                "pauseDeposits transaction {:?} reverted",
                receipt.transaction_hash
            )));
        }
        info!(
            "pauseDeposits confirmed in block {:?}, tx {:?}",
            receipt.block_number, receipt.transaction_hash
        );
        Ok(())
    }

    async fn is_module_paused(&self, staking_module_id: u32) -> GuardianResult<bool> {
        self.router
            .get_staking_module_is_deposits_paused(U256::from(staking_module_id))
            .call()
            .await
            .map_err(|e| GuardianError::Transient(format!("isDepositsPaused: {}", e)))
    }
}

/// Per-module submission lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PauseState {
    #[default]
    Idle,
    Signing,
    Broadcasting,
    OnChainPending,
    Failed,
}

pub struct PauseSubmitter {
    sender: Arc<dyn PauseTransactionSender>,
    // Process-wide: at most one pause transaction in flight
    submit_lock: Mutex<()>,
    states: RwLock<HashMap<u32, PauseState>>,
    metrics: Arc<GuardianMetrics>,
}

impl PauseSubmitter {
    pub fn new(sender: Arc<dyn PauseTransactionSender>, metrics: Arc<GuardianMetrics>) -> Self {
        Self {
            sender,
            submit_lock: Mutex::new(()),
            states: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub async fn state(&self, staking_module_id: u32) -> PauseState {
        self.states
            .read()
            .await
            .get(&staking_module_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn set_state(&self, staking_module_id: u32, state: PauseState) {
        self.states.write().await.insert(staking_module_id, state);
    }

    /// Submit the signed pause on chain. Swallows the failure when the
    /// module turns out to be paused already (another guardian won the
    /// race); every other failure leaves the module in `Failed` so the next
    /// block retries.
    pub async fn submit(
        &self,
        block_number: u64,
        staking_module_id: u32,
        signature: &GuardianSignature,
    ) -> GuardianResult<()> {
        // Compare-and-set under one write guard: checking and claiming the
        // pending slot must be atomic or two callers could both pass the
        // check and race a second transaction out.
        {
            let mut states = self.states.write().await;
            let state = states.get(&staking_module_id).copied().unwrap_or_default();
            if state == PauseState::OnChainPending {
                info!(
                    "pause submission for module {} already in flight, skipping",
                    staking_module_id
                );
                return Ok(());
            }
            states.insert(staking_module_id, PauseState::OnChainPending);
        }

        let _guard = self.submit_lock.lock().await;
        self.metrics.pause_submission_attempts.inc();

        match self
            .sender
            .send_pause(block_number, staking_module_id, signature)
            .await
        {
            Ok(()) => {
                self.set_state(staking_module_id, PauseState::Idle).await;
                Ok(())
            }
            Err(submit_err) => {
                // The rejection may mean another guardian paused the module
                // first; that is success from this daemon's perspective.
                match self.sender.is_module_paused(staking_module_id).await {
                    Ok(true) => {
                        info!(
                            "module {} is already paused; treating submission rejection as success",
                            staking_module_id
                        );
                        self.set_state(staking_module_id, PauseState::Idle).await;
                        Ok(())
                    }
                    _ => {
                        warn!(
                            "pause submission for module {} failed: {}",
                            staking_module_id, submit_err
                        );
                        self.metrics.pause_submission_failures.inc();
                        self.set_state(staking_module_id, PauseState::Failed).await;
                        Err(submit_err)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockPauseSender;
    use crate::types::GuardianSignature;
    use ethers::types::H256;

    fn test_signature() -> GuardianSignature {
        GuardianSignature {
            r: H256([1; 32]),
            s: H256([2; 32]),
            v: 27,
        }
    }

    fn submitter(sender: Arc<MockPauseSender>) -> PauseSubmitter {
        PauseSubmitter::new(sender, crate::metrics::GuardianMetrics::new_for_testing())
    }

    #[tokio::test]
    async fn test_successful_submission_returns_to_idle() {
        let sender = Arc::new(MockPauseSender::new());
        let submitter = submitter(sender.clone());
        submitter.submit(100, 1, &test_signature()).await.unwrap();
        assert_eq!(submitter.state(1).await, PauseState::Idle);
        assert_eq!(sender.calls(), vec![(100, 1)]);
    }

    #[tokio::test]
    async fn test_failure_leaves_module_failed_for_retry() {
        let sender = Arc::new(MockPauseSender::new());
        sender.fail_next("nonce too low");
        let submitter = submitter(sender.clone());
        let err = submitter.submit(100, 1, &test_signature()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(submitter.state(1).await, PauseState::Failed);

        // Next block's pipeline run retries and succeeds
        submitter.submit(101, 1, &test_signature()).await.unwrap();
        assert_eq!(submitter.state(1).await, PauseState::Idle);
        assert_eq!(sender.calls(), vec![(100, 1), (101, 1)]);
    }

    #[tokio::test]
    async fn test_already_paused_rejection_is_success() {
        let sender = Arc::new(MockPauseSender::new());
        sender.fail_next("execution reverted");
        sender.mark_paused(1);
        let submitter = submitter(sender.clone());
        submitter.submit(100, 1, &test_signature()).await.unwrap();
        assert_eq!(submitter.state(1).await, PauseState::Idle);
    }

    #[tokio::test]
    async fn test_pending_module_skips_resubmission() {
        let sender = Arc::new(MockPauseSender::new());
        let submitter = submitter(sender.clone());
        submitter.set_state(1, PauseState::OnChainPending).await;
        submitter.submit(100, 1, &test_signature()).await.unwrap();
        assert!(sender.calls().is_empty());
    }

    #[tokio::test]
    async fn test_at_most_one_submission_in_flight() {
        let sender = Arc::new(MockPauseSender::new());
        let submitter = Arc::new(submitter(sender.clone()));

        let mut handles = Vec::new();
        for module_id in 1..=5u32 {
            let submitter = submitter.clone();
            handles.push(tokio::spawn(async move {
                submitter.submit(100, module_id, &test_signature()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(sender.max_in_flight(), 1);
        assert_eq!(sender.calls().len(), 5);
    }
}
