// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Key-conflict detection: the intersection of unused registry keys with the
//! historical deposit list.
//!
//! The decision path is exact. The cache's bloom filter only short-circuits
//! keys that were certainly never deposited; any positive answer is verified
//! against the exact index before it can reach the pause branch, and the
//! whole set is re-evaluated at the watermark current at signing time.

use crate::deposit_cache::DepositCache;
use crate::types::{DepositEvent, ValidatorPubkey};
use ethers::providers::JsonRpcClient;
use ethers::types::H256;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// One unused registry key that already appears on the deposit list,
/// with the deposits proving it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub staking_module_id: u32,
    pub pubkey: ValidatorPubkey,
    pub deposits: Vec<DepositEvent>,
}

pub struct ConflictDetector<P> {
    cache: Arc<DepositCache<P>>,
}

impl<P> ConflictDetector<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(cache: Arc<DepositCache<P>>) -> Self {
        Self { cache }
    }

    /// The subset of `unused` keys that appear in any deposit event with the
    /// given withdrawal credentials in blocks `[0, up_to_block]`.
    pub async fn find_conflicts(
        &self,
        staking_module_id: u32,
        unused: &HashSet<ValidatorPubkey>,
        withdrawal_credentials: H256,
        up_to_block: u64,
    ) -> Vec<Conflict> {
        // Deterministic scan order so repeated runs report identically
        let mut keys: Vec<&ValidatorPubkey> = unused.iter().collect();
        keys.sort();

        let mut conflicts = Vec::new();
        for key in keys {
            if !self.cache.maybe_deposited(key).await {
                continue;
            }
            let deposits = self
                .cache
                .find_deposits_of(key, withdrawal_credentials, up_to_block)
                .await;
            if !deposits.is_empty() {
                warn!(
                    "unused registry key {:?} found on the deposit list \
                     (module {}, first deposit at block {})",
                    key, staking_module_id, deposits[0].block.number
                );
                conflicts.push(Conflict {
                    staking_module_id,
                    pubkey: *key,
                    deposits,
                });
            }
        }
        conflicts
    }

    /// Re-evaluate previously found conflicts against the cache watermark at
    /// this moment. Run immediately before pause signing.
    pub async fn confirm(
        &self,
        conflicts: &[Conflict],
        withdrawal_credentials: H256,
    ) -> Vec<Conflict> {
        let up_to_block = self.cache.watermark().await.saturating_sub(1);
        let mut confirmed = Vec::new();
        for conflict in conflicts {
            let deposits = self
                .cache
                .find_deposits_of(&conflict.pubkey, withdrawal_credentials, up_to_block)
                .await;
            if deposits.is_empty() {
                warn!(
                    "conflict for {:?} no longer present at watermark {}; dropping",
                    conflict.pubkey,
                    up_to_block + 1
                );
                continue;
            }
            confirmed.push(Conflict {
                staking_module_id: conflict.staking_module_id,
                pubkey: conflict.pubkey,
                deposits,
            });
        }
        confirmed
    }
}
