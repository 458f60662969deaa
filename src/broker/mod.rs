// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Outbound message bus.
//!
//! Signed attest/pause messages are JSON-encoded with a stable field order
//! and published to a single topic on the configured broker. Delivery is
//! at-least-once; consumers dedupe on
//! `(guardianAddress, blockNumber, stakingModuleId, type)`, which is why
//! every message carries its block number.

pub mod kafka;
pub mod rabbitmq;

use crate::config::PubsubService;
use crate::error::{GuardianError, GuardianResult};
use crate::metrics::GuardianMetrics;
use crate::retry_within_budget;
use crate::types::{AttestMessage, PauseMessage};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusMessageType {
    Deposit,
    Pause,
}

impl BusMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusMessageType::Deposit => "deposit",
            BusMessageType::Pause => "pause",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSignature {
    pub r: H256,
    pub vs: H256,
}

/// Wire envelope. Serde keeps declaration order, which fixes the JSON field
/// order consumers see.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub message_type: BusMessageType,
    pub guardian_address: Address,
    pub guardian_index: i32,
    pub block_number: u64,
    pub block_hash: H256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposit_root: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    pub staking_module_id: u32,
    pub signature: BusSignature,
}

impl BusMessage {
    pub fn deposit(message: &AttestMessage) -> Self {
        Self {
            message_type: BusMessageType::Deposit,
            guardian_address: message.guardian.address,
            guardian_index: message.guardian.index,
            block_number: message.block_number,
            block_hash: message.block_hash,
            deposit_root: Some(message.deposit_root),
            nonce: Some(message.nonce),
            staking_module_id: message.staking_module_id,
            signature: BusSignature {
                r: message.signature.r,
                vs: message.signature.vs(),
            },
        }
    }

    pub fn pause(message: &PauseMessage) -> Self {
        Self {
            message_type: BusMessageType::Pause,
            guardian_address: message.guardian.address,
            guardian_index: message.guardian.index,
            block_number: message.block_number,
            block_hash: message.block_hash,
            deposit_root: None,
            nonce: None,
            staking_module_id: message.staking_module_id,
            signature: BusSignature {
                r: message.signature.r,
                vs: message.signature.vs(),
            },
        }
    }

    /// Consumer-side dedupe key.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{:?}:{}:{}:{}",
            self.guardian_address,
            self.block_number,
            self.staking_module_id,
            self.message_type.as_str()
        )
    }
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, message: &BusMessage) -> GuardianResult<()>;
    fn backend(&self) -> &'static str;
}

/// Build the publisher the configuration selected.
pub async fn create_publisher(
    pubsub: &PubsubService,
    topic: &str,
    publish_timeout: Duration,
) -> GuardianResult<Arc<dyn MessagePublisher>> {
    match pubsub {
        PubsubService::RabbitMq(config) => {
            let publisher = rabbitmq::RabbitMqPublisher::connect(config, topic).await?;
            info!("connected to RabbitMQ, publishing to queue '{}'", topic);
            Ok(Arc::new(publisher))
        }
        PubsubService::Kafka(config) => {
            let publisher = kafka::KafkaPublisher::new(config, topic, publish_timeout)?;
            info!("created Kafka producer for topic '{}'", topic);
            Ok(Arc::new(publisher))
        }
    }
}

/// Publishes with capped exponential backoff inside `BUS_PUBLISH_TIMEOUT`.
pub struct Broadcaster {
    publisher: Arc<dyn MessagePublisher>,
    publish_timeout: Duration,
    metrics: Arc<GuardianMetrics>,
}

impl Broadcaster {
    pub fn new(
        publisher: Arc<dyn MessagePublisher>,
        publish_timeout: Duration,
        metrics: Arc<GuardianMetrics>,
    ) -> Self {
        Self {
            publisher,
            publish_timeout,
            metrics,
        }
    }

    pub async fn broadcast(&self, message: &BusMessage) -> GuardianResult<()> {
        match retry_within_budget!(self.publisher.publish(message), self.publish_timeout) {
            Ok(()) => {
                self.metrics
                    .bus_published
                    .with_label_values(&[message.message_type.as_str()])
                    .inc();
                Ok(())
            }
            Err(e) => {
                self.metrics.bus_publish_errors.inc();
                error!(
                    "publishing {} message for block {} failed after retries: {}",
                    message.message_type.as_str(),
                    message.block_number,
                    e
                );
                Err(GuardianError::Transient(format!(
                    "bus publish failed on {}: {}",
                    self.publisher.backend(),
                    e
                )))
            }
        }
    }
}
