// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures and fakes for unit tests.

use crate::abi::DepositEventFilter;
use crate::types::{BlockRef, BlsSignature, DepositEvent, ValidatorPubkey, BLS_SIGNATURE_LEN, PUBKEY_LEN};
use ethers::abi::Token;
use ethers::contract::EthEvent;
use ethers::providers::{HttpClientError, JsonRpcClient, JsonRpcError};
use ethers::types::{Address, Filter, Log, H256, U256, U64};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

pub const TEST_CHAIN_ID: u64 = 17000;
pub const TEST_DEPOSIT_CONTRACT: &str = "0x00000000219ab540356cbb839cbe05303d7705fa";
/// Throwaway secp256k1 key used across signer and pipeline tests.
pub const TEST_WALLET_KEY: &str =
    "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

/// Deterministic hash fixture, distinct per seed.
pub fn test_hash(seed: u64) -> H256 {
    H256::from_low_u64_be(seed.wrapping_add(0xb10c_0000))
}

pub fn test_block_ref(number: u64) -> BlockRef {
    BlockRef {
        number,
        hash: test_hash(number),
        timestamp: 1_700_000_000 + number,
    }
}

pub fn test_pubkey(seed: u8) -> ValidatorPubkey {
    ValidatorPubkey([seed; PUBKEY_LEN])
}

pub const TEST_WITHDRAWAL_CREDENTIALS: H256 = H256([0x01; 32]);

pub fn test_deposit_event(block_number: u64, log_index: u32, pubkey_seed: u8) -> DepositEvent {
    DepositEvent {
        pubkey: test_pubkey(pubkey_seed),
        withdrawal_credentials: TEST_WITHDRAWAL_CREDENTIALS,
        amount_gwei: 32_000_000_000,
        signature: BlsSignature([pubkey_seed; BLS_SIGNATURE_LEN]),
        block: test_block_ref(block_number),
        log_index,
        tx_hash: H256::from_low_u64_be(block_number * 1_000 + log_index as u64),
    }
}

/// A raw `DepositEvent` log as the provider would return it, ABI-encoded so
/// the production decoding path is exercised.
pub fn deposit_log(block_number: u64, block_hash: H256, log_index: u64, pubkey_seed: u8) -> Log {
    let amount_gwei: u64 = 32_000_000_000;
    let data = ethers::abi::encode(&[
        Token::Bytes(vec![pubkey_seed; PUBKEY_LEN]),
        Token::Bytes(TEST_WITHDRAWAL_CREDENTIALS.as_bytes().to_vec()),
        Token::Bytes(amount_gwei.to_le_bytes().to_vec()),
        Token::Bytes(vec![pubkey_seed; BLS_SIGNATURE_LEN]),
        Token::Bytes(0u64.to_le_bytes().to_vec()),
    ]);
    Log {
        address: TEST_DEPOSIT_CONTRACT.parse().unwrap(),
        topics: vec![DepositEventFilter::signature()],
        data: data.into(),
        block_hash: Some(block_hash),
        block_number: Some(U64::from(block_number)),
        transaction_hash: Some(H256::from_low_u64_be(block_number * 1_000 + log_index)),
        transaction_index: Some(U64::zero()),
        log_index: Some(U256::from(log_index)),
        transaction_log_index: None,
        log_type: None,
        removed: Some(false),
    }
}

pub fn deposit_log_json(block_number: u64, block_hash: H256, log_index: u64, pubkey_seed: u8) -> Value {
    serde_json::to_value(deposit_log(block_number, block_hash, log_index, pubkey_seed)).unwrap()
}

/// Header response for `eth_getBlockByNumber`, serialized through the real
/// `Block` type so deserialization in the client cannot drift.
pub fn mock_block_json(number: u64, hash: H256, timestamp: u64) -> Value {
    let block = ethers::types::Block::<H256> {
        number: Some(U64::from(number)),
        hash: Some(hash),
        timestamp: U256::from(timestamp),
        ..Default::default()
    };
    serde_json::to_value(block).unwrap()
}

/// The exact `eth_getLogs` params the client sends for a window, produced by
/// the same `Filter` serialization the provider uses.
pub fn get_logs_params(from: u64, to: u64) -> Value {
    let filter = Filter::new()
        .from_block(from)
        .to_block(to)
        .address(TEST_DEPOSIT_CONTRACT.parse::<Address>().unwrap())
        .topic0(DepositEventFilter::signature());
    json!([filter])
}

/// ABI-encoded `eth_call` return value, as the provider would deliver it.
pub fn encode_call_result(tokens: &[ethers::abi::Token]) -> Value {
    json!(format!("0x{}", hex::encode(ethers::abi::encode(tokens))))
}

enum MockReply {
    Value(Value),
    Error(String),
}

/// In-memory JSON-RPC transport. Responses are keyed by method and exact
/// params; re-adding a key replaces the response, so tests script "the chain
/// moved" by overwriting entries between pipeline runs. Contract calls
/// (`eth_call`) are additionally servable from a per-method FIFO queue,
/// since their params embed full calldata.
#[derive(Clone)]
pub struct MockJsonRpcClient {
    responses: Arc<Mutex<HashMap<String, Arc<MockReply>>>>,
    queued: Arc<Mutex<HashMap<String, std::collections::VecDeque<Value>>>>,
}

impl Debug for MockJsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockJsonRpcClient")
    }
}

impl Default for MockJsonRpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockJsonRpcClient {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            queued: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add_response(&self, method: &str, params: Value, response: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(key(method, &params), Arc::new(MockReply::Value(response)));
    }

    pub fn add_error(&self, method: &str, params: Value, message: &str) {
        self.responses.lock().unwrap().insert(
            key(method, &params),
            Arc::new(MockReply::Error(message.to_string())),
        );
    }

    /// Queue a response consumed by the next request of `method` regardless
    /// of params.
    pub fn add_queued_response(&self, method: &str, response: Value) {
        self.queued
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(response);
    }
}

fn key(method: &str, params: &Value) -> String {
    format!("{}:{}", method, canonical(params))
}

// Canonical rendering with sorted object keys, so the lookup key does not
// depend on map iteration order on either side.
fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

#[async_trait::async_trait]
impl JsonRpcClient for MockJsonRpcClient {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        let params_value = serde_json::to_value(&params).map_err(|err| {
            HttpClientError::SerdeJson {
                err,
                text: format!("{:?}", params),
            }
        })?;
        let lookup = key(method, &params_value);
        let reply = self.responses.lock().unwrap().get(&lookup).cloned();
        if reply.is_none() {
            if let Some(queue) = self.queued.lock().unwrap().get_mut(method) {
                if let Some(value) = queue.pop_front() {
                    return serde_json::from_value(value.clone()).map_err(|err| {
                        HttpClientError::SerdeJson {
                            err,
                            text: value.to_string(),
                        }
                    });
                }
            }
        }
        match reply.as_deref() {
            Some(MockReply::Value(value)) => {
                serde_json::from_value(value.clone()).map_err(|err| HttpClientError::SerdeJson {
                    err,
                    text: value.to_string(),
                })
            }
            Some(MockReply::Error(message)) => Err(HttpClientError::JsonRpcError(JsonRpcError {
                code: -32000,
                message: message.clone(),
                data: None,
            })),
            None => Err(HttpClientError::JsonRpcError(JsonRpcError {
                code: -32601,
                message: format!("no mock response for {}", lookup),
                data: None,
            })),
        }
    }
}

/// Broker fake that records every published message.
#[derive(Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<crate::broker::BusMessage>>,
    fail_next: Mutex<Option<String>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<crate::broker::BusMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait::async_trait]
impl crate::broker::MessagePublisher for MemoryPublisher {
    async fn publish(&self, message: &crate::broker::BusMessage) -> crate::error::GuardianResult<()> {
        if let Some(error) = self.fail_next.lock().unwrap().take() {
            return Err(crate::error::GuardianError::Transient(error));
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Scriptable pause-transaction fake that also tracks submission
/// concurrency for the at-most-one-in-flight invariant.
pub struct MockPauseSender {
    calls: Mutex<Vec<(u64, u32)>>,
    failures: Mutex<std::collections::VecDeque<String>>,
    paused: Mutex<std::collections::HashSet<u32>>,
    in_flight: std::sync::atomic::AtomicUsize,
    max_in_flight: std::sync::atomic::AtomicUsize,
}

impl MockPauseSender {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(std::collections::VecDeque::new()),
            paused: Mutex::new(std::collections::HashSet::new()),
            in_flight: std::sync::atomic::AtomicUsize::new(0),
            max_in_flight: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, message: &str) {
        self.failures.lock().unwrap().push_back(message.to_string());
    }

    pub fn mark_paused(&self, module_id: u32) {
        self.paused.lock().unwrap().insert(module_id);
    }

    pub fn calls(&self) -> Vec<(u64, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for MockPauseSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl crate::pause_submitter::PauseTransactionSender for MockPauseSender {
    async fn send_pause(
        &self,
        block_number: u64,
        staking_module_id: u32,
        _signature: &crate::types::GuardianSignature,
    ) -> crate::error::GuardianResult<()> {
        use std::sync::atomic::Ordering;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.calls
            .lock()
            .unwrap()
            .push((block_number, staking_module_id));
        if let Some(message) = self.failures.lock().unwrap().pop_front() {
            return Err(crate::error::GuardianError::Transient(message));
        }
        Ok(())
    }

    async fn is_module_paused(
        &self,
        staking_module_id: u32,
    ) -> crate::error::GuardianResult<bool> {
        Ok(self.paused.lock().unwrap().contains(&staking_module_id))
    }
}

/// State-probe fake returning a preset context per block number.
pub struct FakeProbe {
    contexts: Mutex<HashMap<u64, crate::guardian_state::BlockContext>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_context(&self, context: crate::guardian_state::BlockContext) {
        self.contexts
            .lock()
            .unwrap()
            .insert(context.block.number, context);
    }
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl crate::guardian_state::StateProbe for FakeProbe {
    async fn probe(
        &self,
        block: BlockRef,
    ) -> crate::error::GuardianResult<crate::guardian_state::BlockContext> {
        self.contexts
            .lock()
            .unwrap()
            .get(&block.number)
            .cloned()
            .ok_or_else(|| {
                crate::error::GuardianError::Transient(format!(
                    "no fake context for block {}",
                    block.number
                ))
            })
    }
}

/// Keys API fake serving a preset snapshot (or error).
pub struct FakeKeysApi {
    snapshot: Mutex<Option<Result<crate::types::RegistryKeySnapshot, crate::error::GuardianError>>>,
}

impl FakeKeysApi {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new(None),
        }
    }

    pub fn set_snapshot(&self, snapshot: crate::types::RegistryKeySnapshot) {
        *self.snapshot.lock().unwrap() = Some(Ok(snapshot));
    }

    pub fn set_error(&self, error: crate::error::GuardianError) {
        *self.snapshot.lock().unwrap() = Some(Err(error));
    }
}

impl Default for FakeKeysApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl crate::keys_api::KeysApiClient for FakeKeysApi {
    async fn fetch_snapshot(
        &self,
    ) -> crate::error::GuardianResult<crate::types::RegistryKeySnapshot> {
        self.snapshot
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| {
                Err(crate::error::GuardianError::Transient(
                    "no fake snapshot configured".to_string(),
                ))
            })
    }
}
