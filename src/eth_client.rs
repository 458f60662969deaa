// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::abi::DepositEventFilter;
use crate::error::{GuardianError, GuardianResult};
use crate::metered_eth_provider::{new_metered_eth_provider, MeteredEthHttpProvider};
use crate::metrics::GuardianMetrics;
use crate::types::{BlockRef, BlsSignature, DepositEvent, ValidatorPubkey};
use ethers::abi::RawLog;
use ethers::contract::EthEvent;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::types::{Address, Filter, Log, H256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tap::TapFallible;

/// Execution-layer client scoped to what the pipeline consumes: head and
/// block-ref queries plus deposit-contract log fetching.
///
/// Generic over the JSON-RPC transport so tests can inject a mock.
pub struct EthClient<P> {
    provider: Arc<Provider<P>>,
    deposit_contract: Address,
    expected_chain_id: u64,
}

impl EthClient<MeteredEthHttpProvider> {
    pub async fn new(
        provider_url: &str,
        deposit_contract: Address,
        expected_chain_id: u64,
        metrics: Arc<GuardianMetrics>,
        call_timeout: Duration,
    ) -> GuardianResult<Self> {
        let provider = new_metered_eth_provider(provider_url, metrics, call_timeout)
            .map_err(|e| GuardianError::ConfigInvalid(format!("RPC_URL is invalid: {}", e)))?;
        let client = Self::new_with_provider(provider, deposit_contract, expected_chain_id);
        client.describe().await?;
        Ok(client)
    }
}

impl<P> EthClient<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new_with_provider(
        provider: Provider<P>,
        deposit_contract: Address,
        expected_chain_id: u64,
    ) -> Self {
        Self {
            provider: Arc::new(provider),
            deposit_contract,
            expected_chain_id,
        }
    }

    pub fn provider(&self) -> Arc<Provider<P>> {
        self.provider.clone()
    }

    pub fn deposit_contract(&self) -> Address {
        self.deposit_contract
    }

    pub fn expected_chain_id(&self) -> u64 {
        self.expected_chain_id
    }

    // Validate chain identity and log connection info. A chain-id mismatch
    // means the cache and every signature we would produce are for the wrong
    // network, so this is fatal.
    pub async fn describe(&self) -> GuardianResult<()> {
        let chain_id = self.provider.get_chainid().await?.as_u64();
        if chain_id != self.expected_chain_id {
            return Err(GuardianError::Fatal(format!(
                "chain id mismatch: expected {}, provider reports {}",
                self.expected_chain_id, chain_id
            )));
        }
        let block_number = self.provider.get_block_number().await?;
        tracing::info!(
            "EthClient connected to chain {} (verified), current block: {}",
            chain_id,
            block_number
        );
        Ok(())
    }

    pub async fn get_head_number(&self) -> GuardianResult<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    /// Canonical `BlockRef` of a block by number, as the provider sees the
    /// chain right now.
    pub async fn get_block_ref(&self, number: u64) -> GuardianResult<BlockRef> {
        let block = self
            .provider
            .get_block(number)
            .await?
            .ok_or_else(|| GuardianError::Transient(format!("block {} not found", number)))?;
        let hash = block.hash.ok_or_else(|| {
            GuardianError::Inconsistent(format!("provider returned block {} without hash", number))
        })?;
        Ok(BlockRef {
            number,
            hash,
            timestamp: block.timestamp.as_u64(),
        })
    }

    /// All deposit events in the inclusive block range `[from, to]`, in
    /// `(block_number, log_index)` order.
    ///
    /// When the provider rejects the range as too large, the range is halved
    /// and retried, down to a floor of a single block.
    pub async fn get_deposit_events(&self, from: u64, to: u64) -> GuardianResult<Vec<DepositEvent>> {
        let logs = self.fetch_logs_split(from, to).await?;

        // Safeguard check that all events were emitted by the deposit contract
        if logs.iter().any(|log| log.address != self.deposit_contract) {
            return Err(GuardianError::Inconsistent(format!(
                "provider returned logs from a contract other than {:?}",
                self.deposit_contract
            )));
        }

        // One header fetch per distinct block with events, to stamp each
        // event with its full canonical BlockRef.
        let mut block_refs: HashMap<u64, BlockRef> = HashMap::new();
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let event = self.decode_deposit_log(&log, &mut block_refs).await?;
            events.push(event);
        }
        events.sort_by_key(|e| e.sort_key());
        Ok(events)
    }

    fn fetch_logs_split<'a>(
        &'a self,
        from: u64,
        to: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = GuardianResult<Vec<Log>>> + Send + 'a>>
    {
        Box::pin(async move {
            let filter = Filter::new()
                .from_block(from)
                .to_block(to)
                .address(self.deposit_contract)
                .topic0(DepositEventFilter::signature());
            match self.provider.get_logs(&filter).await {
                Ok(logs) => Ok(logs),
                Err(e) if from < to && is_range_rejection(&e.to_string()) => {
                    let mid = from + (to - from) / 2;
                    tracing::debug!(
                        "provider rejected log window [{}, {}], splitting at {}",
                        from,
                        to,
                        mid
                    );
                    let mut left = self.fetch_logs_split(from, mid).await?;
                    let right = self.fetch_logs_split(mid + 1, to).await?;
                    left.extend(right);
                    Ok(left)
                }
                Err(e) => Err(GuardianError::from(e)).tap_err(|err| {
                    tracing::error!("get_logs failed for [{}, {}]: {:?}", from, to, err)
                }),
            }
        })
    }

    async fn decode_deposit_log(
        &self,
        log: &Log,
        block_refs: &mut HashMap<u64, BlockRef>,
    ) -> GuardianResult<DepositEvent> {
        let block_number = log
            .block_number
            .ok_or_else(|| {
                GuardianError::Inconsistent("provider returned log without block_number".into())
            })?
            .as_u64();
        let block_hash = log.block_hash.ok_or_else(|| {
            GuardianError::Inconsistent("provider returned log without block_hash".into())
        })?;
        let log_index = log
            .log_index
            .ok_or_else(|| {
                GuardianError::Inconsistent("provider returned log without log_index".into())
            })?
            .as_u32();
        let tx_hash = log.transaction_hash.ok_or_else(|| {
            GuardianError::Inconsistent("provider returned log without transaction_hash".into())
        })?;

        let raw = RawLog::from(log.clone());
        let decoded = DepositEventFilter::decode_log(&raw).map_err(|e| {
            GuardianError::Inconsistent(format!(
                "undecodable DepositEvent log at block {} index {}: {}",
                block_number, log_index, e
            ))
        })?;

        let pubkey = ValidatorPubkey::from_slice(&decoded.pubkey)?;
        if decoded.withdrawal_credentials.len() != 32 {
            return Err(GuardianError::Inconsistent(format!(
                "DepositEvent withdrawal_credentials must be 32 bytes, got {}",
                decoded.withdrawal_credentials.len()
            )));
        }
        let withdrawal_credentials = H256::from_slice(&decoded.withdrawal_credentials);
        let amount_bytes: [u8; 8] = decoded.amount.as_ref().try_into().map_err(|_| {
            GuardianError::Inconsistent(format!(
                "DepositEvent amount must be 8 bytes, got {}",
                decoded.amount.len()
            ))
        })?;
        // The deposit contract emits amount as little-endian gwei
        let amount_gwei = u64::from_le_bytes(amount_bytes);
        let signature = BlsSignature::from_slice(&decoded.signature)?;

        let block = match block_refs.get(&block_number) {
            Some(block_ref) => *block_ref,
            None => {
                let block_ref = self.get_block_ref(block_number).await?;
                // The log's block hash and the header must agree, otherwise
                // the chain moved between the two queries.
                if block_ref.hash != block_hash {
                    return Err(GuardianError::Transient(format!(
                        "block {} hash changed while fetching logs",
                        block_number
                    )));
                }
                block_refs.insert(block_number, block_ref);
                block_ref
            }
        };

        Ok(DepositEvent {
            pubkey,
            withdrawal_credentials,
            amount_gwei,
            signature,
            block,
            log_index,
            tx_hash,
        })
    }
}

// Providers phrase "range too large" rejections differently; match the
// common shapes (Infura, Alchemy, Erigon, geth).
fn is_range_rejection(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("query returned more than")
        || lower.contains("log response size exceeded")
        || lower.contains("block range")
        || lower.contains("too many")
        || lower.contains("limit exceeded")
}
