// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Kafka publisher (rdkafka FutureProducer).

use super::{BusMessage, MessagePublisher};
use crate::config::KafkaConfig;
use crate::error::{GuardianError, GuardianResult};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    publish_timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(
        config: &KafkaConfig,
        topic: &str,
        publish_timeout: Duration,
    ) -> GuardianResult<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", &config.client_id)
            .set(
                "message.timeout.ms",
                publish_timeout.as_millis().to_string(),
            );

        let sasl = config.sasl_mechanism.is_some();
        let protocol = match (config.ssl, sasl) {
            (true, true) => "SASL_SSL",
            (true, false) => "SSL",
            (false, true) => "SASL_PLAINTEXT",
            (false, false) => "PLAINTEXT",
        };
        client_config.set("security.protocol", protocol);
        if let Some(mechanism) = &config.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &config.username {
            client_config.set("sasl.username", username);
        }
        if let Some(password) = &config.password {
            client_config.set("sasl.password", password);
        }

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| GuardianError::ConfigInvalid(format!("kafka producer: {}", e)))?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
            publish_timeout,
        })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn publish(&self, message: &BusMessage) -> GuardianResult<()> {
        let payload = serde_json::to_string(message)
            .map_err(|e| GuardianError::Inconsistent(format!("cannot encode message: {}", e)))?;
        let key = message.dedupe_key();
        self.producer
            .send(
                FutureRecord::to(&self.topic).payload(&payload).key(&key),
                Timeout::After(self.publish_timeout),
            )
            .await
            .map_err(|(e, _)| GuardianError::Transient(format!("kafka publish: {}", e)))?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "kafka"
    }
}
