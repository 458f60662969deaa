// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry,
};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 30., 60., 120.,
];

#[derive(Clone, Debug)]
pub struct GuardianMetrics {
    // Pipeline
    pub decisions: IntCounterVec,
    pub skips: IntCounterVec,
    pub last_processed_block: IntGauge,
    pub head_block: IntGauge,
    pub block_processing_latency: HistogramVec,

    // Deposit-event cache
    pub cache_watermark: IntGauge,
    pub cache_events_total: IntGauge,
    pub cache_rollbacks: IntCounter,
    pub cache_sealed_segments: IntGauge,
    pub cache_fetch_latency: HistogramVec,

    // RPC provider
    pub rpc_queries: IntCounterVec,
    pub rpc_query_errors: IntCounterVec,
    pub rpc_queries_latency: HistogramVec,

    // Keys API
    pub keys_api_requests: IntCounterVec,
    pub keys_api_snapshot_lag_blocks: IntGauge,
    pub stale_snapshots: IntCounter,

    // Broker
    pub bus_published: IntCounterVec,
    pub bus_publish_errors: IntCounter,

    // On-chain pause
    pub pause_submission_attempts: IntCounter,
    pub pause_submission_failures: IntCounter,
}

impl GuardianMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            decisions: register_int_counter_vec_with_registry!(
                "guardian_decisions_total",
                "Decisions produced per (block, module), labeled by kind",
                &["decision"],
                registry,
            )
            .unwrap(),
            skips: register_int_counter_vec_with_registry!(
                "guardian_skips_total",
                "Skip decisions labeled by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
            last_processed_block: register_int_gauge_with_registry!(
                "guardian_last_processed_block",
                "Last block number the pipeline completed",
                registry,
            )
            .unwrap(),
            head_block: register_int_gauge_with_registry!(
                "guardian_head_block",
                "Latest head block number observed from the provider",
                registry,
            )
            .unwrap(),
            block_processing_latency: register_histogram_vec_with_registry!(
                "guardian_block_processing_latency_sec",
                "End-to-end latency of one block's pipeline run",
                &["outcome"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            cache_watermark: register_int_gauge_with_registry!(
                "guardian_cache_watermark",
                "Exclusive upper bound of blocks covered by the deposit-event cache",
                registry,
            )
            .unwrap(),
            cache_events_total: register_int_gauge_with_registry!(
                "guardian_cache_events_total",
                "Number of deposit events held by the cache",
                registry,
            )
            .unwrap(),
            cache_rollbacks: register_int_counter_with_registry!(
                "guardian_cache_rollbacks_total",
                "Times the unsealed cache tail was rolled back after a reorg",
                registry,
            )
            .unwrap(),
            cache_sealed_segments: register_int_gauge_with_registry!(
                "guardian_cache_sealed_segments",
                "Number of sealed segments on disk",
                registry,
            )
            .unwrap(),
            cache_fetch_latency: register_histogram_vec_with_registry!(
                "guardian_cache_fetch_latency_sec",
                "Latency of one fetch window of deposit logs",
                &["window"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            rpc_queries: register_int_counter_vec_with_registry!(
                "guardian_rpc_queries_total",
                "JSON-RPC calls by method",
                &["method"],
                registry,
            )
            .unwrap(),
            rpc_query_errors: register_int_counter_vec_with_registry!(
                "guardian_rpc_query_errors_total",
                "Failed JSON-RPC calls by method",
                &["method"],
                registry,
            )
            .unwrap(),
            rpc_queries_latency: register_histogram_vec_with_registry!(
                "guardian_rpc_queries_latency_sec",
                "JSON-RPC call latency by method",
                &["method"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            keys_api_requests: register_int_counter_vec_with_registry!(
                "guardian_keys_api_requests_total",
                "Keys API requests by outcome",
                &["outcome"],
                registry,
            )
            .unwrap(),
            keys_api_snapshot_lag_blocks: register_int_gauge_with_registry!(
                "guardian_keys_api_snapshot_lag_blocks",
                "Distance between the pipeline block and the registry snapshot block",
                registry,
            )
            .unwrap(),
            stale_snapshots: register_int_counter_with_registry!(
                "guardian_stale_snapshots_total",
                "Registry snapshots rejected for staleness or hash mismatch",
                registry,
            )
            .unwrap(),
            bus_published: register_int_counter_vec_with_registry!(
                "guardian_bus_published_total",
                "Messages published to the broker by type",
                &["type"],
                registry,
            )
            .unwrap(),
            bus_publish_errors: register_int_counter_with_registry!(
                "guardian_bus_publish_errors_total",
                "Broker publish attempts that exhausted their retry budget",
                registry,
            )
            .unwrap(),
            pause_submission_attempts: register_int_counter_with_registry!(
                "guardian_pause_submission_attempts_total",
                "On-chain pauseDeposits submissions attempted",
                registry,
            )
            .unwrap(),
            pause_submission_failures: register_int_counter_with_registry!(
                "guardian_pause_submission_failures_total",
                "On-chain pauseDeposits submissions that failed",
                registry,
            )
            .unwrap(),
        }
    }

    #[cfg(test)]
    pub fn new_for_testing() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new(&Registry::new()))
    }
}
