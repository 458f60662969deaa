// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Range-indexed store of historical deposit events.
//!
//! The cache covers the half-open block range `[0, watermark)` at all times.
//! Finalized history lives in sealed, immutable on-disk segments; the
//! unsealed tail (younger than `FINALIZATION_DEPTH`) is held in `head.json`
//! and rolled back when the chain reorganizes under it. A disagreement with
//! sealed data means the chain identity itself is in question and is fatal.
//!
//! `advance_to` is idempotent and internally serialized: at most one fetch
//! is in flight, readers always see a monotonically advancing watermark.

mod bloom;
mod segment;
mod store;

pub use segment::EventSegment;
pub use store::{CacheStore, HeadState, Manifest, SegmentMeta};

use crate::error::{GuardianError, GuardianResult};
use crate::eth_client::EthClient;
use crate::metrics::GuardianMetrics;
use crate::types::{BlockRef, DepositEvent, ValidatorPubkey};
use bloom::PubkeyBloom;
use ethers::providers::JsonRpcClient;
use ethers::types::H256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Sealed-side location of one deposit, resolvable to the full event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactDeposit {
    pub block_number: u64,
    pub log_index: u32,
    pub withdrawal_credentials: H256,
}

#[derive(Clone, Copy, Debug)]
pub struct DepositCacheConfig {
    pub fetch_window: u64,
    pub finalization_depth: u64,
}

struct CacheInner {
    sealed: Vec<EventSegment>,
    sealed_index: HashMap<ValidatorPubkey, Vec<CompactDeposit>>,
    bloom: PubkeyBloom,
    bloom_capacity: usize,
    head: HeadState,
}

impl CacheInner {
    fn sealed_to(&self) -> u64 {
        self.sealed.last().map(|s| s.to).unwrap_or(0)
    }

    fn sealed_event_count(&self) -> usize {
        self.sealed.iter().map(|s| s.events.len()).sum()
    }

    fn index_segment(&mut self, segment: &EventSegment) {
        for event in &segment.events {
            self.sealed_index
                .entry(event.pubkey)
                .or_default()
                .push(CompactDeposit {
                    block_number: event.block.number,
                    log_index: event.log_index,
                    withdrawal_credentials: event.withdrawal_credentials,
                });
            if self.bloom.inserted() as usize >= self.bloom_capacity {
                self.grow_bloom();
            }
            self.bloom.insert(&event.pubkey);
        }
    }

    // Re-seed a larger filter from the exact index once the current one is
    // at capacity, keeping the false-positive rate bounded.
    fn grow_bloom(&mut self) {
        self.bloom_capacity *= 2;
        let mut bloom = PubkeyBloom::with_capacity(self.bloom_capacity, BLOOM_TARGET_FPR);
        for key in self.sealed_index.keys() {
            bloom.insert(key);
        }
        self.bloom = bloom;
    }

    fn resolve(&self, compact: &CompactDeposit) -> Option<DepositEvent> {
        let seg_idx = self
            .sealed
            .partition_point(|s| s.to <= compact.block_number);
        let segment = self.sealed.get(seg_idx)?;
        if !segment.contains_block(compact.block_number) {
            return None;
        }
        let key = (compact.block_number, compact.log_index);
        segment
            .events
            .binary_search_by_key(&key, |e| e.sort_key())
            .ok()
            .map(|i| segment.events[i])
    }
}

const BLOOM_TARGET_FPR: f64 = 0.001;
const BLOOM_MIN_CAPACITY: usize = 65_536;

pub struct DepositCache<P> {
    client: Arc<EthClient<P>>,
    store: CacheStore,
    config: DepositCacheConfig,
    metrics: Arc<GuardianMetrics>,
    inner: RwLock<CacheInner>,
    // Serializes advance_to: at most one in-flight fetch
    advance_lock: Mutex<()>,
}

impl<P> DepositCache<P>
where
    P: JsonRpcClient + 'static,
{
    /// Load persisted state (or start empty) and bind the cache to a client.
    pub async fn load(
        client: Arc<EthClient<P>>,
        store: CacheStore,
        chain_id: u64,
        config: DepositCacheConfig,
        metrics: Arc<GuardianMetrics>,
    ) -> GuardianResult<Self> {
        let (sealed, mut head) = store.load(chain_id).await?;
        let sealed_to = sealed.last().map(|s| s.to).unwrap_or(0);
        if head.watermark < sealed_to {
            // A head older than the sealed range cannot describe the tail;
            // drop it and refetch from the seal boundary.
            warn!(
                "cache head watermark {} is behind sealed range {}; discarding tail",
                head.watermark, sealed_to
            );
            head = HeadState {
                watermark: sealed_to,
                ..Default::default()
            };
        }

        let mut inner = CacheInner {
            sealed: Vec::new(),
            sealed_index: HashMap::new(),
            bloom: PubkeyBloom::with_capacity(BLOOM_MIN_CAPACITY, BLOOM_TARGET_FPR),
            bloom_capacity: BLOOM_MIN_CAPACITY,
            head,
        };
        for segment in sealed {
            inner.index_segment(&segment);
            inner.sealed.push(segment);
        }

        info!(
            "deposit cache loaded: watermark={}, sealed_segments={}, events={}",
            inner.head.watermark,
            inner.sealed.len(),
            inner.sealed_event_count() + inner.head.events.len()
        );
        metrics.cache_watermark.set(inner.head.watermark as i64);
        metrics
            .cache_events_total
            .set((inner.sealed_event_count() + inner.head.events.len()) as i64);
        metrics.cache_sealed_segments.set(inner.sealed.len() as i64);

        Ok(Self {
            client,
            store,
            config,
            metrics,
            inner: RwLock::new(inner),
            advance_lock: Mutex::new(()),
        })
    }

    /// Exclusive upper bound of the indexed block range.
    pub async fn watermark(&self) -> u64 {
        self.inner.read().await.head.watermark
    }

    pub async fn event_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.sealed_event_count() + inner.head.events.len()
    }

    /// Make the cache current through block `target` (inclusive).
    ///
    /// Idempotent; serialized internally. On return the watermark is at
    /// least `target + 1` and all events of `[0, target]` are queryable.
    pub async fn advance_to(&self, target: u64) -> GuardianResult<()> {
        let _guard = self.advance_lock.lock().await;

        self.check_tail_consistency().await?;

        let mut from = self.inner.read().await.head.watermark;
        while from <= target {
            let window_end = std::cmp::min(from + self.config.fetch_window - 1, target);
            let timer = self
                .metrics
                .cache_fetch_latency
                .with_label_values(&["deposit_logs"])
                .start_timer();
            let events = self.client.get_deposit_events(from, window_end).await?;
            timer.observe_duration();
            let terminal = self.client.get_block_ref(window_end).await?;
            self.append_window(from, window_end, events, terminal).await?;
            from = window_end + 1;
        }

        self.seal_finalized().await
    }

    /// All deposit events with block numbers in `[from, to)`, in
    /// `(block_number, log_index)` order. Clamped to the watermark.
    pub async fn query(&self, from: u64, to: u64) -> Vec<DepositEvent> {
        let inner = self.inner.read().await;
        let to = std::cmp::min(to, inner.head.watermark);
        if from >= to {
            return Vec::new();
        }
        let mut out = Vec::new();
        for segment in &inner.sealed {
            if segment.to <= from || segment.from >= to {
                continue;
            }
            out.extend(
                segment
                    .events
                    .iter()
                    .filter(|e| e.block.number >= from && e.block.number < to),
            );
        }
        out.extend(
            inner
                .head
                .events
                .iter()
                .filter(|e| e.block.number >= from && e.block.number < to),
        );
        out
    }

    /// Approximate membership test. `false` is authoritative; `true` must be
    /// confirmed with [`find_deposits_of`].
    pub async fn maybe_deposited(&self, pubkey: &ValidatorPubkey) -> bool {
        let inner = self.inner.read().await;
        inner.bloom.maybe_contains(pubkey)
            || inner.head.events.iter().any(|e| &e.pubkey == pubkey)
    }

    /// Exact lookup of deposits for one pubkey, restricted to the given
    /// withdrawal credentials and to blocks `<= up_to_block`.
    pub async fn find_deposits_of(
        &self,
        pubkey: &ValidatorPubkey,
        withdrawal_credentials: H256,
        up_to_block: u64,
    ) -> Vec<DepositEvent> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        if let Some(compacts) = inner.sealed_index.get(pubkey) {
            for compact in compacts {
                if compact.block_number > up_to_block
                    || compact.withdrawal_credentials != withdrawal_credentials
                {
                    continue;
                }
                if let Some(event) = inner.resolve(compact) {
                    out.push(event);
                }
            }
        }
        out.extend(inner.head.events.iter().filter(|e| {
            &e.pubkey == pubkey
                && e.withdrawal_credentials == withdrawal_credentials
                && e.block.number <= up_to_block
        }));
        out.sort_by_key(|e| e.sort_key());
        out
    }

    /// Persist the unsealed tail. Called on shutdown.
    pub async fn flush(&self) -> GuardianResult<()> {
        let inner = self.inner.read().await;
        self.store.save_head(&inner.head).await
    }

    // Compare the recorded tip against the provider's view and roll the
    // unsealed tail back to the fork point if the chain moved. Sealed
    // history disagreeing with the provider is fatal.
    async fn check_tail_consistency(&self) -> GuardianResult<()> {
        let (tail_refs, sealed_terminal) = {
            let inner = self.inner.read().await;
            (inner.head.tail_refs.clone(), inner.sealed.last().map(|s| s.terminal))
        };

        let tip = match tail_refs.last().copied().or(sealed_terminal) {
            Some(tip) => tip,
            None => return Ok(()), // empty cache, nothing to verify
        };

        let canonical = self.client.get_block_ref(tip.number).await?;
        if canonical.hash == tip.hash {
            return Ok(());
        }

        warn!(
            "reorg detected: block {} was {:?}, provider now reports {:?}",
            tip.number, tip.hash, canonical.hash
        );
        self.metrics.cache_rollbacks.inc();

        // Walk recorded tail refs from newest to oldest for the fork point.
        let mut fork_point: Option<BlockRef> = None;
        for recorded in tail_refs.iter().rev().skip(1) {
            let canonical = self.client.get_block_ref(recorded.number).await?;
            if canonical.hash == recorded.hash {
                fork_point = Some(*recorded);
                break;
            }
        }

        if fork_point.is_none() {
            // The whole unsealed tail is gone. The sealed range must still
            // be canonical, otherwise the reorg reached finalized history.
            if let Some(terminal) = sealed_terminal {
                let canonical = self.client.get_block_ref(terminal.number).await?;
                if canonical.hash != terminal.hash {
                    return Err(GuardianError::Fatal(format!(
                        "sealed segment disagreement at block {}: cached {:?}, canonical {:?}; \
                         a reorg deeper than the finalization depth requires operator intervention",
                        terminal.number, terminal.hash, canonical.hash
                    )));
                }
            }
        }

        let mut inner = self.inner.write().await;
        let rollback_to = match fork_point {
            Some(block_ref) => block_ref.number + 1,
            None => inner.sealed_to(),
        };
        let before = inner.head.events.len();
        inner.head.events.retain(|e| e.block.number < rollback_to);
        inner.head.tail_refs.retain(|r| r.number < rollback_to);
        inner.head.watermark = rollback_to;
        info!(
            "rolled back unsealed tail to block {} ({} events dropped)",
            rollback_to,
            before - inner.head.events.len()
        );
        self.metrics.cache_watermark.set(rollback_to as i64);
        let head = inner.head.clone();
        drop(inner);
        self.store.save_head(&head).await
    }

    async fn append_window(
        &self,
        from: u64,
        to_inclusive: u64,
        events: Vec<DepositEvent>,
        terminal: BlockRef,
    ) -> GuardianResult<()> {
        if events
            .iter()
            .any(|e| e.block.number < from || e.block.number > to_inclusive)
        {
            return Err(GuardianError::Inconsistent(format!(
                "provider returned events outside the requested window [{}, {}]",
                from, to_inclusive
            )));
        }
        let mut inner = self.inner.write().await;
        inner.head.events.extend(events);
        inner.head.tail_refs.push(terminal);
        inner.head.watermark = to_inclusive + 1;
        self.metrics.cache_watermark.set(inner.head.watermark as i64);
        self.metrics
            .cache_events_total
            .set((inner.sealed_event_count() + inner.head.events.len()) as i64);
        let head = inner.head.clone();
        drop(inner);
        self.store.save_head(&head).await
    }

    // Move fully-finalized, window-aligned prefixes of the tail into sealed
    // segments on disk.
    async fn seal_finalized(&self) -> GuardianResult<()> {
        let head_number = self.client.get_head_number().await?;
        let boundary = head_number.saturating_sub(self.config.finalization_depth);

        loop {
            let (seg_from, seg_to) = {
                let inner = self.inner.read().await;
                let seg_from = inner.sealed_to();
                let seg_to = seg_from + self.config.fetch_window;
                if seg_to > boundary || seg_to > inner.head.watermark {
                    return Ok(());
                }
                (seg_from, seg_to)
            };

            // Terminal ref for the segment: recorded during indexing when
            // windows were aligned, otherwise fetched now (the block is
            // finalized, so this is stable).
            let recorded = {
                let inner = self.inner.read().await;
                inner
                    .head
                    .tail_refs
                    .iter()
                    .find(|r| r.number == seg_to - 1)
                    .copied()
            };
            let terminal = match recorded {
                Some(block_ref) => block_ref,
                None => self.client.get_block_ref(seg_to - 1).await?,
            };

            let segment = {
                let mut inner = self.inner.write().await;
                let split = inner
                    .head
                    .events
                    .partition_point(|e| e.block.number < seg_to);
                let remaining = inner.head.events.split_off(split);
                let sealed_events = std::mem::replace(&mut inner.head.events, remaining);
                inner.head.tail_refs.retain(|r| r.number >= seg_to);
                let segment = EventSegment {
                    from: seg_from,
                    to: seg_to,
                    terminal,
                    events: sealed_events,
                };
                inner.index_segment(&segment);
                inner.sealed.push(segment.clone());
                self.metrics.cache_sealed_segments.set(inner.sealed.len() as i64);
                segment
            };

            self.store.write_segment(&segment).await?;
            let manifest = self.manifest().await;
            self.store.save_manifest(&manifest).await?;
            let head = self.inner.read().await.head.clone();
            self.store.save_head(&head).await?;
            info!(
                "sealed segment [{}, {}) with {} events",
                segment.from,
                segment.to,
                segment.events.len()
            );
        }
    }

    async fn manifest(&self) -> Manifest {
        let inner = self.inner.read().await;
        Manifest {
            chain_id: self.client_chain_id(),
            segments: inner
                .sealed
                .iter()
                .map(|s| SegmentMeta {
                    from: s.from,
                    to: s.to,
                    terminal: s.terminal,
                    event_count: s.events.len() as u64,
                })
                .collect(),
        }
    }

    fn client_chain_id(&self) -> u64 {
        self.client.expected_chain_id()
    }
}
