//! AMQP transport adapter (lapin)
//!
//! Everything broker-specific lives here: topology declaration, the two
//! subscription loops that feed the consumer core, acknowledgement handles,
//! and the dead-letter publisher. The consumer core never sees lapin types.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::consumer::{AckError, Acker, Consumer};
use crate::dlq::{annotated_headers, DlqError, DlqPublisher};
use crate::message::InboundMessage;

pub const VERIFICATION_ROUTING_KEY: &str = "email.verification";
pub const PASSWORD_RESET_ROUTING_KEY: &str = "email.password_reset";
pub const DLQ_ROUTING_KEY: &str = "email.dlq";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed")]
    Connect(#[source] lapin::Error),
    #[error("topology declaration failed")]
    Topology(#[source] lapin::Error),
    #[error("subscription failed")]
    Subscribe(#[source] lapin::Error),
}

pub struct AmqpBroker {
    channel: Channel,
}

impl AmqpBroker {
    /// Connect and open one channel with the configured prefetch. Prefetch
    /// is the broker-side half of the backpressure budget.
    pub async fn connect(url: &str, prefetch: u16) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(BrokerError::Connect)?;
        let channel = connection.create_channel().await.map_err(BrokerError::Connect)?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(BrokerError::Connect)?;
        Ok(Self { channel })
    }

    /// Declare the durable exchange, both source queues (dead-lettering into
    /// the shared exchange) and their bindings. Safe to repeat.
    pub async fn declare_topology(&self, settings: &Settings) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                &settings.rabbitmq_exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Topology)?;

        let queues = [
            (settings.rabbitmq_queue_verification.as_str(), VERIFICATION_ROUTING_KEY),
            (settings.rabbitmq_queue_reset.as_str(), PASSWORD_RESET_ROUTING_KEY),
        ];
        for (queue, routing_key) in queues {
            let mut args = FieldTable::default();
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(settings.rabbitmq_exchange.clone().into()),
            );
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(DLQ_ROUTING_KEY.into()),
            );

            self.channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions { durable: true, ..Default::default() },
                    args,
                )
                .await
                .map_err(BrokerError::Topology)?;
            self.channel
                .queue_bind(
                    queue,
                    &settings.rabbitmq_exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::Topology)?;
        }
        Ok(())
    }

    pub fn dlq_publisher(&self, settings: &Settings) -> AmqpDlqPublisher {
        AmqpDlqPublisher {
            channel: self.channel.clone(),
            exchange: settings.rabbitmq_exchange.clone(),
            queue: settings.rabbitmq_queue_dlq.clone(),
        }
    }

    /// Run both subscriptions until the token fires, handing every delivery
    /// to the consumer core. Returns once the subscription loops exit; the
    /// caller then drains the consumer's pool.
    pub async fn run(
        &self,
        consumer: Consumer,
        settings: &Settings,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError> {
        let subscriptions = [
            (settings.rabbitmq_queue_verification.clone(), "courier.verification"),
            (settings.rabbitmq_queue_reset.clone(), "courier.password_reset"),
        ];

        let mut loops = Vec::new();
        for (queue, consumer_tag) in subscriptions {
            let stream = self
                .channel
                .basic_consume(
                    &queue,
                    consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::Subscribe)?;
            loops.push(tokio::spawn(subscription_loop(
                queue,
                stream,
                consumer.clone(),
                shutdown.clone(),
            )));
        }

        for task in loops {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "subscription loop panicked");
            }
        }
        Ok(())
    }
}

async fn subscription_loop(
    queue: String,
    mut stream: lapin::Consumer,
    consumer: Consumer,
    shutdown: CancellationToken,
) {
    tracing::info!(%queue, "subscription started");
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            delivery = stream.next() => delivery,
        };

        match delivery {
            Some(Ok(delivery)) => {
                let lapin::message::Delivery { delivery_tag, data, properties, acker, .. } =
                    delivery;
                let message = InboundMessage {
                    delivery_tag,
                    body: data,
                    headers: headers_to_map(&properties),
                    content_type: properties.content_type().as_ref().map(|s| s.to_string()),
                };
                consumer.dispatch(&queue, message, Arc::new(AmqpAcker { acker })).await;
            }
            Some(Err(e)) => {
                tracing::error!(%queue, error = %e, "delivery error on subscription");
            }
            None => {
                tracing::warn!(%queue, "subscription stream closed by broker");
                break;
            }
        }
    }
    tracing::info!(%queue, "subscription stopped");
}

fn headers_to_map(properties: &BasicProperties) -> std::collections::HashMap<String, String> {
    let mut headers = std::collections::HashMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            match value {
                AMQPValue::LongString(v) => {
                    headers.insert(key.to_string(), v.to_string());
                }
                AMQPValue::ShortString(v) => {
                    headers.insert(key.to_string(), v.to_string());
                }
                _ => {}
            }
        }
    }
    headers
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), AckError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| AckError(e.to_string()))
    }

    async fn nack_requeue(&self) -> Result<(), AckError> {
        self.acker
            .nack(BasicNackOptions { requeue: true, ..Default::default() })
            .await
            .map_err(|e| AckError(e.to_string()))
    }
}

pub struct AmqpDlqPublisher {
    channel: Channel,
    exchange: String,
    queue: String,
}

#[async_trait]
impl DlqPublisher for AmqpDlqPublisher {
    async fn declare(&self) -> Result<(), DlqError> {
        self.channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DlqError::Declare(e.to_string()))?;
        self.channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                DLQ_ROUTING_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| DlqError::Declare(e.to_string()))?;
        Ok(())
    }

    async fn publish(&self, message: &InboundMessage, reason: &str) -> Result<(), DlqError> {
        let mut table = FieldTable::default();
        for (key, value) in annotated_headers(message, reason) {
            table.insert(key.into(), AMQPValue::LongString(value.into()));
        }

        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_headers(table);
        if let Some(content_type) = &message.content_type {
            properties = properties.with_content_type(content_type.clone().into());
        }

        self.channel
            .basic_publish(
                &self.exchange,
                DLQ_ROUTING_KEY,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| DlqError::Publish(e.to_string()))?;
        Ok(())
    }
}
