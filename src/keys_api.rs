// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Client for the external Keys API: the third-party inventory of registered
//! validator keys.
//!
//! Every response carries `meta.elBlockSnapshot`, the EL block the inventory
//! was materialized at. A snapshot is only usable if that block is still
//! canonical and recent enough; both checks live in
//! [`validate_snapshot_freshness`] because they need the provider's view.

use crate::error::{GuardianError, GuardianResult};
use crate::metrics::GuardianMetrics;
use crate::types::{BlockRef, RegistryKeySnapshot, ValidatorPubkey};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

// Backstop against a paginator that never terminates
const MAX_PAGES: usize = 10_000;

#[async_trait]
pub trait KeysApiClient: Send + Sync {
    /// Fetch the full key inventory as one consistent snapshot.
    async fn fetch_snapshot(&self) -> GuardianResult<RegistryKeySnapshot>;
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
struct ElBlockSnapshot {
    #[serde(rename = "blockNumber")]
    block_number: u64,
    #[serde(rename = "blockHash")]
    block_hash: H256,
    timestamp: u64,
}

impl ElBlockSnapshot {
    fn to_block_ref(&self) -> BlockRef {
        BlockRef {
            number: self.block_number,
            hash: self.block_hash,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct ResponseMeta {
    #[serde(rename = "elBlockSnapshot")]
    el_block_snapshot: ElBlockSnapshot,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModuleEntry {
    pub id: u32,
    #[serde(rename = "stakingModuleAddress")]
    pub staking_module_address: Address,
}

#[derive(Debug, Deserialize)]
struct ModulesResponse {
    data: Vec<ModuleEntry>,
    meta: ResponseMeta,
}

#[derive(Clone, Debug, Deserialize)]
pub struct KeyEntry {
    pub key: ValidatorPubkey,
    pub used: bool,
    #[serde(rename = "moduleAddress")]
    pub module_address: Address,
}

#[derive(Debug, Deserialize)]
struct KeysPage {
    data: Vec<KeyEntry>,
    meta: ResponseMeta,
}

pub struct HttpKeysApiClient {
    http: reqwest::Client,
    base_url: Url,
    batch_size: usize,
    concurrency: usize,
    metrics: Arc<GuardianMetrics>,
}

impl HttpKeysApiClient {
    pub fn new(
        base_url: Url,
        batch_size: usize,
        concurrency: usize,
        timeout: Duration,
        metrics: Arc<GuardianMetrics>,
    ) -> GuardianResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GuardianError::ConfigInvalid(format!("cannot build http client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            metrics,
        })
    }

    async fn fetch_modules(&self) -> GuardianResult<ModulesResponse> {
        let url = self.join("v1/modules")?;
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.json::<ModulesResponse>().await?)
    }

    async fn fetch_keys_page(&self, offset: usize) -> GuardianResult<KeysPage> {
        let url = self.join("v1/keys")?;
        let response = self
            .http
            .get(url)
            .query(&[("offset", offset), ("limit", self.batch_size)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<KeysPage>().await?)
    }

    fn join(&self, path: &str) -> GuardianResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| GuardianError::ConfigInvalid(format!("bad keys api url: {}", e)))
    }
}

#[async_trait]
impl KeysApiClient for HttpKeysApiClient {
    async fn fetch_snapshot(&self) -> GuardianResult<RegistryKeySnapshot> {
        let result = self.fetch_snapshot_inner().await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.error_type(),
        };
        self.metrics
            .keys_api_requests
            .with_label_values(&[outcome])
            .inc();
        result
    }
}

impl HttpKeysApiClient {
    async fn fetch_snapshot_inner(&self) -> GuardianResult<RegistryKeySnapshot> {
        let modules = self.fetch_modules().await?;
        let snapshot = modules.meta.el_block_snapshot.clone();

        let mut pages: Vec<KeysPage> = Vec::new();
        let mut chunk_start = 0usize;
        'outer: loop {
            let offsets: Vec<usize> = (0..self.concurrency)
                .map(|i| (chunk_start + i) * self.batch_size)
                .collect();
            let chunk: Vec<GuardianResult<KeysPage>> = stream::iter(offsets)
                .map(|offset| self.fetch_keys_page(offset))
                .buffered(self.concurrency)
                .collect()
                .await;
            for page in chunk {
                let page = page?;
                let short = page.data.len() < self.batch_size;
                pages.push(page);
                if short {
                    break 'outer;
                }
            }
            chunk_start += self.concurrency;
            if pages.len() > MAX_PAGES {
                return Err(GuardianError::Inconsistent(format!(
                    "keys api pagination did not terminate after {} pages",
                    MAX_PAGES
                )));
            }
        }

        // All pages must describe the same snapshot; the registry advancing
        // mid-pagination would silently mix two inventories.
        for page in &pages {
            if page.meta.el_block_snapshot != snapshot {
                return Err(GuardianError::Stale(format!(
                    "registry snapshot advanced during pagination: {} -> {}",
                    snapshot.block_number, page.meta.el_block_snapshot.block_number
                )));
            }
        }

        assemble_snapshot(
            snapshot.to_block_ref(),
            &modules.data,
            pages.iter().flat_map(|p| p.data.iter()),
        )
    }
}

/// Fold module metadata and key entries into a snapshot, rejecting
/// duplicate pubkeys and keys of unknown modules.
pub fn assemble_snapshot<'a>(
    snapshot_block: BlockRef,
    modules: &[ModuleEntry],
    entries: impl Iterator<Item = &'a KeyEntry>,
) -> GuardianResult<RegistryKeySnapshot> {
    let module_ids: HashMap<Address, u32> = modules
        .iter()
        .map(|m| (m.staking_module_address, m.id))
        .collect();

    let mut seen: HashSet<ValidatorPubkey> = HashSet::new();
    let mut used: HashSet<ValidatorPubkey> = HashSet::new();
    let mut unused_by_module: BTreeMap<u32, HashSet<ValidatorPubkey>> =
        modules.iter().map(|m| (m.id, HashSet::new())).collect();

    for entry in entries {
        if !seen.insert(entry.key) {
            return Err(GuardianError::Inconsistent(format!(
                "duplicate pubkey {:?} in registry snapshot at block {}",
                entry.key, snapshot_block.number
            )));
        }
        let module_id = module_ids.get(&entry.module_address).ok_or_else(|| {
            GuardianError::Inconsistent(format!(
                "registry key {:?} belongs to unknown module {:?}",
                entry.key, entry.module_address
            ))
        })?;
        if entry.used {
            used.insert(entry.key);
        } else {
            unused_by_module
                .entry(*module_id)
                .or_default()
                .insert(entry.key);
        }
    }

    Ok(RegistryKeySnapshot {
        snapshot_block,
        used,
        unused_by_module,
    })
}

/// Gate a snapshot against the current pipeline block.
///
/// `canonical_at_snapshot_height` is the provider's block at the snapshot's
/// height: if the hashes disagree the registry indexed a block that has been
/// reorged away. A snapshot ahead of the pipeline block is tolerated within
/// the same lag bound; the caller must then cap the conflict scan at the
/// snapshot height.
pub fn validate_snapshot_freshness(
    snapshot_block: &BlockRef,
    pipeline_block: &BlockRef,
    canonical_at_snapshot_height: &BlockRef,
    max_snapshot_lag: u64,
) -> GuardianResult<()> {
    if canonical_at_snapshot_height.hash != snapshot_block.hash {
        return Err(GuardianError::Stale(format!(
            "registry snapshot block {} is not canonical (snapshot {:?}, chain {:?})",
            snapshot_block.number, snapshot_block.hash, canonical_at_snapshot_height.hash
        )));
    }
    let lag = pipeline_block.number.abs_diff(snapshot_block.number);
    if lag > max_snapshot_lag {
        return Err(GuardianError::Stale(format!(
            "registry snapshot at block {} lags pipeline block {} by {} blocks (max {})",
            snapshot_block.number, pipeline_block.number, lag, max_snapshot_lag
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_block_ref, test_pubkey};

    fn module(id: u32, addr_seed: u8) -> ModuleEntry {
        ModuleEntry {
            id,
            staking_module_address: Address::from_low_u64_be(addr_seed as u64),
        }
    }

    fn entry(key_seed: u8, used: bool, addr_seed: u8) -> KeyEntry {
        KeyEntry {
            key: test_pubkey(key_seed),
            used,
            module_address: Address::from_low_u64_be(addr_seed as u64),
        }
    }

    #[test]
    fn test_assemble_partitions_used_and_unused() {
        let modules = vec![module(1, 10), module(2, 20)];
        let entries = vec![
            entry(1, true, 10),
            entry(2, false, 10),
            entry(3, false, 20),
        ];
        let snapshot =
            assemble_snapshot(test_block_ref(100), &modules, entries.iter()).unwrap();
        assert!(snapshot.used.contains(&test_pubkey(1)));
        assert_eq!(
            snapshot.unused_for_module(1).unwrap(),
            &HashSet::from([test_pubkey(2)])
        );
        assert_eq!(
            snapshot.unused_for_module(2).unwrap(),
            &HashSet::from([test_pubkey(3)])
        );
        // Module ids the registry never listed are absent
        assert!(snapshot.unused_for_module(3).is_none());
    }

    #[test]
    fn test_duplicate_pubkey_is_inconsistent() {
        let modules = vec![module(1, 10)];
        let entries = vec![entry(1, false, 10), entry(1, true, 10)];
        let err = assemble_snapshot(test_block_ref(100), &modules, entries.iter()).unwrap_err();
        assert!(matches!(err, GuardianError::Inconsistent(_)));
    }

    #[test]
    fn test_unknown_module_is_inconsistent() {
        let modules = vec![module(1, 10)];
        let entries = vec![entry(1, false, 99)];
        let err = assemble_snapshot(test_block_ref(100), &modules, entries.iter()).unwrap_err();
        assert!(matches!(err, GuardianError::Inconsistent(_)));
    }

    #[test]
    fn test_freshness_accepts_recent_canonical_snapshot() {
        let snapshot = test_block_ref(95);
        let pipeline = test_block_ref(100);
        validate_snapshot_freshness(&snapshot, &pipeline, &snapshot, 50).unwrap();
    }

    #[test]
    fn test_freshness_rejects_lagging_snapshot() {
        // elBlockSnapshot.number = B - 200 with MAX_SNAPSHOT_LAG = 50
        let snapshot = test_block_ref(800);
        let pipeline = test_block_ref(1000);
        let err = validate_snapshot_freshness(&snapshot, &pipeline, &snapshot, 50).unwrap_err();
        assert!(matches!(err, GuardianError::Stale(_)));
    }

    #[test]
    fn test_freshness_rejects_non_canonical_snapshot() {
        let snapshot = test_block_ref(95);
        let pipeline = test_block_ref(100);
        let mut canonical = snapshot;
        canonical.hash = H256([0xde; 32]);
        let err = validate_snapshot_freshness(&snapshot, &pipeline, &canonical, 50).unwrap_err();
        assert!(matches!(err, GuardianError::Stale(_)));
    }

    #[test]
    fn test_freshness_allows_snapshot_ahead_within_lag() {
        // Snapshot newer than the pipeline block is allowed within the bound
        let snapshot = test_block_ref(105);
        let pipeline = test_block_ref(100);
        validate_snapshot_freshness(&snapshot, &pipeline, &snapshot, 50).unwrap();

        let far_ahead = test_block_ref(200);
        assert!(validate_snapshot_freshness(&far_ahead, &pipeline, &far_ahead, 50).is_err());
    }
}
