// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{GuardianError, GuardianResult};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Hex-encoded secp256k1 private key that must never appear in logs or
/// serialized state.
#[derive(Clone)]
pub struct WalletKey(String);

impl WalletKey {
    pub fn new(hex_key: &str) -> GuardianResult<Self> {
        let stripped = hex_key.strip_prefix("0x").unwrap_or(hex_key);
        let bytes = hex::decode(stripped).map_err(|e| {
            GuardianError::ConfigInvalid(format!("WALLET_PRIVATE_KEY is not valid hex: {}", e))
        })?;
        if bytes.len() != 32 {
            return Err(GuardianError::ConfigInvalid(format!(
                "WALLET_PRIVATE_KEY must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        if bytes.iter().all(|b| *b == 0) {
            return Err(GuardianError::ConfigInvalid(
                "WALLET_PRIVATE_KEY must not be zero".to_string(),
            ));
        }
        Ok(Self(stripped.to_string()))
    }

    /// Only the signer consumes this; nothing else should.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for WalletKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WalletKey(<redacted>)")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RabbitMqConfig {
    pub url: String,
    pub login: String,
    pub passcode: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    pub ssl: bool,
    pub sasl_mechanism: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Which broker backend `PUBSUB_SERVICE` selected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PubsubService {
    RabbitMq(RabbitMqConfig),
    Kafka(KafkaConfig),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Simple,
    Json,
}

#[derive(Clone, Debug)]
pub struct GuardianConfig {
    pub rpc_url: String,
    pub wallet_private_key: WalletKey,
    pub chain_id: u64,
    pub deposit_contract_address: Address,
    pub dsm_address: Address,
    pub staking_router_address: Address,
    pub pubsub: PubsubService,
    pub broker_topic: String,
    pub keys_api_url: Url,
    pub registry_keys_query_batch_size: usize,
    pub registry_keys_query_concurrency: usize,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub cache_dir: PathBuf,
    pub confirmation_depth: u64,
    pub finalization_depth: u64,
    pub max_snapshot_lag: u64,
    pub fetch_window: u64,
    pub block_poll_interval: Duration,
    pub rpc_call_timeout: Duration,
    pub keys_api_timeout: Duration,
    pub bus_publish_timeout: Duration,
}

impl GuardianConfig {
    /// Assemble and validate configuration from the process environment.
    pub fn from_env() -> GuardianResult<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_lookup(&vars)
    }

    pub fn from_lookup(vars: &HashMap<String, String>) -> GuardianResult<Self> {
        let rpc_url = require(vars, "RPC_URL")?;
        let wallet_private_key = WalletKey::new(&require(vars, "WALLET_PRIVATE_KEY")?)?;
        let chain_id = parse_required(vars, "CHAIN_ID")?;
        if chain_id == 0 {
            return Err(GuardianError::ConfigInvalid(
                "CHAIN_ID must be non-zero".to_string(),
            ));
        }
        let deposit_contract_address = parse_address(vars, "DEPOSIT_CONTRACT_ADDRESS")?;
        let dsm_address = parse_address(vars, "DSM_ADDRESS")?;
        let staking_router_address = parse_address(vars, "STAKING_ROUTER_ADDRESS")?;

        let pubsub = match require(vars, "PUBSUB_SERVICE")?.as_str() {
            "rabbitmq" => PubsubService::RabbitMq(RabbitMqConfig {
                url: require(vars, "RABBITMQ_URL")?,
                login: require(vars, "RABBITMQ_LOGIN")?,
                passcode: require(vars, "RABBITMQ_PASSCODE")?,
            }),
            "kafka" => {
                let mut brokers = vec![require(vars, "KAFKA_BROKER_ADDRESS_1")?];
                if let Some(second) = vars.get("KAFKA_BROKER_ADDRESS_2") {
                    if !second.is_empty() {
                        brokers.push(second.clone());
                    }
                }
                PubsubService::Kafka(KafkaConfig {
                    brokers,
                    client_id: vars
                        .get("KAFKA_CLIENT_ID")
                        .cloned()
                        .unwrap_or_else(|| "deposit-guardian".to_string()),
                    ssl: parse_with_default(vars, "KAFKA_SSL", false)?,
                    sasl_mechanism: vars.get("KAFKA_SASL_MECHANISM").cloned(),
                    username: vars.get("KAFKA_USERNAME").cloned(),
                    password: vars.get("KAFKA_PASSWORD").cloned(),
                })
            }
            other => {
                return Err(GuardianError::ConfigInvalid(format!(
                    "PUBSUB_SERVICE must be 'rabbitmq' or 'kafka', got '{}'",
                    other
                )))
            }
        };

        let keys_api_host = vars
            .get("KEYS_API_HOST")
            .cloned()
            .unwrap_or_else(|| "http://localhost".to_string());
        let keys_api_port: u16 = parse_with_default(vars, "KEYS_API_PORT", 3000)?;
        let keys_api_url = Url::parse(&format!("{}:{}", keys_api_host, keys_api_port))
            .map_err(|e| {
                GuardianError::ConfigInvalid(format!(
                    "KEYS_API_HOST/KEYS_API_PORT do not form a valid URL: {}",
                    e
                ))
            })?;

        let log_format = match vars.get("LOG_FORMAT").map(String::as_str).unwrap_or("simple") {
            "simple" => LogFormat::Simple,
            "json" => LogFormat::Json,
            other => {
                return Err(GuardianError::ConfigInvalid(format!(
                    "LOG_FORMAT must be 'simple' or 'json', got '{}'",
                    other
                )))
            }
        };

        let confirmation_depth = parse_with_default(vars, "CONFIRMATION_DEPTH", 6)?;
        let finalization_depth = parse_with_default(vars, "FINALIZATION_DEPTH", 64)?;
        if finalization_depth == 0 {
            return Err(GuardianError::ConfigInvalid(
                "FINALIZATION_DEPTH must be positive".to_string(),
            ));
        }
        let fetch_window = parse_with_default(vars, "FETCH_WINDOW", 10_000)?;
        if fetch_window == 0 {
            return Err(GuardianError::ConfigInvalid(
                "FETCH_WINDOW must be positive".to_string(),
            ));
        }

        Ok(Self {
            rpc_url,
            wallet_private_key,
            chain_id,
            deposit_contract_address,
            dsm_address,
            staking_router_address,
            pubsub,
            broker_topic: vars
                .get("BROKER_TOPIC")
                .cloned()
                .unwrap_or_else(|| "guardian-messages".to_string()),
            keys_api_url,
            registry_keys_query_batch_size: parse_with_default(
                vars,
                "REGISTRY_KEYS_QUERY_BATCH_SIZE",
                1000,
            )?,
            registry_keys_query_concurrency: parse_with_default(
                vars,
                "REGISTRY_KEYS_QUERY_CONCURRENCY",
                5,
            )?,
            port: parse_with_default(vars, "PORT", 8080)?,
            log_level: vars
                .get("LOG_LEVEL")
                .cloned()
                .unwrap_or_else(|| "info".to_string()),
            log_format,
            cache_dir: PathBuf::from(
                vars.get("CACHE_DIR").cloned().unwrap_or_else(|| "./cache".to_string()),
            ),
            confirmation_depth,
            finalization_depth,
            max_snapshot_lag: parse_with_default(vars, "MAX_SNAPSHOT_LAG", 50)?,
            fetch_window,
            block_poll_interval: Duration::from_millis(parse_with_default(
                vars,
                "BLOCK_POLL_INTERVAL_MS",
                5_000,
            )?),
            rpc_call_timeout: Duration::from_secs(parse_with_default(
                vars,
                "RPC_CALL_TIMEOUT",
                30,
            )?),
            keys_api_timeout: Duration::from_secs(parse_with_default(
                vars,
                "KEYS_API_TIMEOUT",
                60,
            )?),
            bus_publish_timeout: Duration::from_secs(parse_with_default(
                vars,
                "BUS_PUBLISH_TIMEOUT",
                10,
            )?),
        })
    }
}

fn require(vars: &HashMap<String, String>, name: &str) -> GuardianResult<String> {
    match vars.get(name) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(GuardianError::ConfigInvalid(format!(
            "required configuration option {} is not set",
            name
        ))),
    }
}

fn parse_required<T>(vars: &HashMap<String, String>, name: &str) -> GuardianResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    require(vars, name)?.parse().map_err(|e| {
        GuardianError::ConfigInvalid(format!("cannot parse {}: {}", name, e))
    })
}

fn parse_with_default<T>(vars: &HashMap<String, String>, name: &str, default: T) -> GuardianResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name) {
        Some(value) if !value.is_empty() => value.parse().map_err(|e| {
            GuardianError::ConfigInvalid(format!("cannot parse {}: {}", name, e))
        }),
        _ => Ok(default),
    }
}

fn parse_address(vars: &HashMap<String, String>, name: &str) -> GuardianResult<Address> {
    require(vars, name)?.parse::<Address>().map_err(|e| {
        GuardianError::ConfigInvalid(format!("{} is not a valid address: {}", name, e))
    })
}
