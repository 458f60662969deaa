// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-block context assembly from the DSM, StakingRouter and deposit
//! contracts: guardian set and our position in it, the deposit root, the
//! protocol withdrawal credentials, and the state of every staking module.
//!
//! All reads are pinned to the pipeline block so one run sees one
//! consistent world.

use crate::abi::{DepositContract, DepositSecurityModule, StakingRouter};
use crate::error::{GuardianError, GuardianResult};
use crate::types::{BlockRef, GuardianIdentity, StakingModuleState};
use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Address, BlockId, H256, U256};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct BlockContext {
    pub block: BlockRef,
    pub guardian: GuardianIdentity,
    pub deposit_root: H256,
    pub withdrawal_credentials: H256,
    /// Ascending module id order; the pipeline processes them in this order
    pub modules: Vec<StakingModuleState>,
}

#[async_trait]
pub trait StateProbe: Send + Sync {
    async fn probe(&self, block: BlockRef) -> GuardianResult<BlockContext>;
}

pub struct ContractStateProbe<M> {
    dsm: DepositSecurityModule<M>,
    router: StakingRouter<M>,
    deposit_contract: DepositContract<M>,
    wallet_address: Address,
}

impl<M> ContractStateProbe<M>
where
    M: Middleware + 'static,
{
    pub fn new(
        middleware: Arc<M>,
        dsm_address: Address,
        router_address: Address,
        deposit_contract_address: Address,
        wallet_address: Address,
    ) -> Self {
        Self {
            dsm: DepositSecurityModule::new(dsm_address, middleware.clone()),
            router: StakingRouter::new(router_address, middleware.clone()),
            deposit_contract: DepositContract::new(deposit_contract_address, middleware),
            wallet_address,
        }
    }

    pub fn dsm(&self) -> &DepositSecurityModule<M> {
        &self.dsm
    }
}

fn rpc_err(context: &str, e: impl std::fmt::Display) -> GuardianError {
    GuardianError::Transient(format!("{}: {}", context, e))
}

#[async_trait]
impl<M> StateProbe for ContractStateProbe<M>
where
    M: Middleware + 'static,
{
    async fn probe(&self, block: BlockRef) -> GuardianResult<BlockContext> {
        let at = BlockId::from(block.number);

        let guardians: Vec<Address> = self
            .dsm
            .get_guardians()
            .block(at)
            .call()
            .await
            .map_err(|e| rpc_err("getGuardians", e))?;
        let index = guardians
            .iter()
            .position(|address| *address == self.wallet_address)
            .map(|i| i as i32)
            .unwrap_or(-1);

        let deposit_root = self
            .deposit_contract
            .get_deposit_root()
            .block(at)
            .call()
            .await
            .map_err(|e| rpc_err("get_deposit_root", e))?;

        let withdrawal_credentials = self
            .router
            .get_withdrawal_credentials()
            .block(at)
            .call()
            .await
            .map_err(|e| rpc_err("getWithdrawalCredentials", e))?;

        let ids: Vec<U256> = self
            .router
            .get_staking_module_ids()
            .block(at)
            .call()
            .await
            .map_err(|e| rpc_err("getStakingModuleIds", e))?;
        let mut module_ids: Vec<u32> = ids.iter().map(|id| id.as_u32()).collect();
        module_ids.sort_unstable();

        let mut modules = Vec::with_capacity(module_ids.len());
        for id in module_ids {
            let active = self
                .router
                .get_staking_module_is_active(U256::from(id))
                .block(at)
                .call()
                .await
                .map_err(|e| rpc_err("getStakingModuleIsActive", e))?;
            let deposits_paused = self
                .router
                .get_staking_module_is_deposits_paused(U256::from(id))
                .block(at)
                .call()
                .await
                .map_err(|e| rpc_err("getStakingModuleIsDepositsPaused", e))?;
            let nonce = self
                .router
                .get_staking_module_nonce(U256::from(id))
                .block(at)
                .call()
                .await
                .map_err(|e| rpc_err("getStakingModuleNonce", e))?;
            let last_deposit_block = self
                .router
                .get_staking_module_last_deposit_block(U256::from(id))
                .block(at)
                .call()
                .await
                .map_err(|e| rpc_err("getStakingModuleLastDepositBlock", e))?;
            modules.push(StakingModuleState {
                id,
                is_active: active && !deposits_paused,
                nonce: nonce.as_u64(),
                last_deposit_block: last_deposit_block.as_u64(),
            });
        }

        Ok(BlockContext {
            block,
            guardian: GuardianIdentity {
                address: self.wallet_address,
                index,
            },
            deposit_root: H256(deposit_root),
            withdrawal_credentials: H256(withdrawal_credentials),
            modules,
        })
    }
}
