// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod abi;
pub mod broker;
pub mod config;
pub mod deposit_cache;
pub mod detector;
pub mod error;
pub mod eth_client;
pub mod guardian_state;
pub mod keys_api;
pub mod metered_eth_provider;
pub mod metrics;
pub mod node;
pub mod orchestrator;
pub mod pause_submitter;
pub mod server;
pub mod signer;
pub mod types;

#[cfg(test)]
pub mod test_utils;

/// Retry a fallible async expression with capped exponential backoff until
/// `$budget` is spent, then yield the last error.
///
/// A block slot is ~12s and every external call already carries its own
/// deadline, so delays start small and never exceed a quarter slot: one
/// flaky RPC response should not eat the whole block's processing window.
#[macro_export]
macro_rules! retry_within_budget {
    ($call:expr, $budget:expr) => {{
        let policy = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(250),
            randomization_factor: 0.2,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(3),
            max_elapsed_time: Some($budget),
            ..Default::default()
        };
        backoff::future::retry(policy, || {
            std::boxed::Box::pin(async {
                $call.await.map_err(|e| {
                    tracing::debug!("retrying after error: {:?}", e);
                    backoff::Error::transient(e)
                })
            })
        })
        .await
    }};
}
