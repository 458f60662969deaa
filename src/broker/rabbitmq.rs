// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! RabbitMQ publisher (lapin) with publisher confirms.

use super::{BusMessage, MessagePublisher};
use crate::config::RabbitMqConfig;
use crate::error::{GuardianError, GuardianResult};
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use url::Url;

pub struct RabbitMqPublisher {
    channel: Channel,
    queue: String,
}

impl RabbitMqPublisher {
    pub async fn connect(config: &RabbitMqConfig, topic: &str) -> GuardianResult<Self> {
        let mut url = Url::parse(&config.url).map_err(|e| {
            GuardianError::ConfigInvalid(format!("RABBITMQ_URL is invalid: {}", e))
        })?;
        url.set_username(&config.login)
            .map_err(|_| GuardianError::ConfigInvalid("RABBITMQ_URL rejects credentials".into()))?;
        url.set_password(Some(&config.passcode))
            .map_err(|_| GuardianError::ConfigInvalid("RABBITMQ_URL rejects credentials".into()))?;

        let connection = Connection::connect(url.as_str(), ConnectionProperties::default())
            .await
            .map_err(|e| GuardianError::Transient(format!("rabbitmq connect: {}", e)))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| GuardianError::Transient(format!("rabbitmq channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| GuardianError::Transient(format!("rabbitmq confirm_select: {}", e)))?;
        channel
            .queue_declare(
                topic,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| GuardianError::Transient(format!("rabbitmq queue_declare: {}", e)))?;

        Ok(Self {
            channel,
            queue: topic.to_string(),
        })
    }
}

#[async_trait]
impl MessagePublisher for RabbitMqPublisher {
    async fn publish(&self, message: &BusMessage) -> GuardianResult<()> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| GuardianError::Inconsistent(format!("cannot encode message: {}", e)))?;
        let confirm = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                // delivery_mode 2: persist across broker restarts
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| GuardianError::Transient(format!("rabbitmq publish: {}", e)))?
            .await
            .map_err(|e| GuardianError::Transient(format!("rabbitmq confirm: {}", e)))?;

        match confirm {
            Confirmation::Nack(_) => Err(GuardianError::Transient(
                "rabbitmq broker nacked the message".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn backend(&self) -> &'static str {
        "rabbitmq"
    }
}
