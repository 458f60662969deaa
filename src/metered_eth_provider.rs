// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::GuardianMetrics;
use ethers::providers::{Http, HttpClientError, JsonRpcClient, JsonRpcError, Provider};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// HTTP JSON-RPC transport that meters every call and enforces the
/// `RPC_CALL_TIMEOUT` deadline. Every provider interaction in the daemon
/// goes through this type.
#[derive(Debug, Clone)]
pub struct MeteredEthHttpProvider {
    inner: Http,
    metrics: Arc<GuardianMetrics>,
    call_timeout: Duration,
}

pub fn new_metered_eth_provider(
    url: &str,
    metrics: Arc<GuardianMetrics>,
    call_timeout: Duration,
) -> Result<Provider<MeteredEthHttpProvider>, url::ParseError> {
    let parsed = Url::parse(url)?;
    let transport = MeteredEthHttpProvider {
        inner: Http::new(parsed),
        metrics,
        call_timeout,
    };
    Ok(Provider::new(transport))
}

#[async_trait::async_trait]
impl JsonRpcClient for MeteredEthHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        self.metrics
            .rpc_queries
            .with_label_values(&[method])
            .inc();
        let _guard = self
            .metrics
            .rpc_queries_latency
            .with_label_values(&[method])
            .start_timer();

        let result = match tokio::time::timeout(self.call_timeout, self.inner.request(method, params))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(HttpClientError::JsonRpcError(JsonRpcError {
                code: -32000,
                message: format!(
                    "rpc call {} timed out after {:?}",
                    method, self.call_timeout
                ),
                data: None,
            })),
        };

        if result.is_err() {
            self.metrics
                .rpc_query_errors
                .with_label_values(&[method])
                .inc();
        }
        result
    }
}
