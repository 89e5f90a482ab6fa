// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! RabbitMQ backend via `lapin`.
//!
//! - Publishing uses one shared channel in confirm mode; `publish` returns
//!   only after the broker acks the message.
//! - Each `consume` call opens its own channel with its own prefetch, so a
//!   pool of N consumers is N channels on one connection.
//! - Exchanges and queues are declared durable on first use and bound by the
//!   queue name as routing key.

use async_trait::async_trait;
use dashmap::DashSet;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::traits::{ConsumeOptions, MessageBroker, MessageHandler, StorageError};
use crate::message::{Disposition, HeaderValue, Headers, IncomingMessage, QueueEnvelope};
use crate::resilience::retry::{retry, RetryConfig};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

fn backend(e: lapin::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn exchange_kind(exchange_type: &str) -> ExchangeKind {
    match exchange_type {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// Convert pipeline headers into an AMQP field table.
pub fn headers_to_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers.iter() {
        let value = match value {
            HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.as_str())),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}

/// Convert an AMQP field table into pipeline headers. Unsupported value types are dropped.
pub fn headers_from_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned()),
                AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
                AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
                AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

pub struct AmqpBroker {
    connection: Connection,
    publisher: Channel,
    declared: DashSet<String>,
}

impl AmqpBroker {
    /// Connect with startup-mode retry and open the confirm-mode publish channel.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let connection = retry("amqp_connect", &RetryConfig::startup(), || async {
            Connection::connect(url, ConnectionProperties::default()).await
        })
        .await
        .map_err(|e| {
            crate::metrics::record_connection_error("rabbitmq");
            backend(e)
        })?;

        let publisher = connection.create_channel().await.map_err(backend)?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(backend)?;

        info!("Connected to RabbitMQ");
        Ok(Self {
            connection,
            publisher,
            declared: DashSet::new(),
        })
    }

    /// Declare a durable exchange and queue and bind them. Cached per pair.
    async fn declare(
        &self,
        channel: &Channel,
        exchange: &str,
        exchange_type: &str,
        queue: &str,
    ) -> Result<(), StorageError> {
        let key = format!("{}|{}", exchange, queue);
        if self.declared.contains(&key) {
            return Ok(());
        }

        channel
            .exchange_declare(
                exchange,
                exchange_kind(exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(backend)?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(backend)?;
        channel
            .queue_bind(queue, exchange, queue, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(backend)?;

        debug!(exchange, queue, "Declared exchange and queue");
        self.declared.insert(key);
        Ok(())
    }

    async fn settle(delivery: &lapin::message::Delivery, disposition: Disposition) -> Result<(), lapin::Error> {
        match disposition {
            Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
            Disposition::NackRequeue => {
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
            Disposition::NackDiscard => {
                delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
        }
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    #[tracing::instrument(skip(self, envelope), fields(exchange = %envelope.exchange, queue = %envelope.queue))]
    async fn publish(&self, envelope: &QueueEnvelope) -> Result<(), StorageError> {
        self.declare(&self.publisher, &envelope.exchange, &envelope.exchange_type, &envelope.queue)
            .await?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type.as_str()))
            .with_headers(headers_to_table(&envelope.headers))
            .with_timestamp(u64::try_from(envelope.timestamp.timestamp()).unwrap_or(0))
            .with_delivery_mode(PERSISTENT);

        let confirmation = self
            .publisher
            .basic_publish(
                &envelope.exchange,
                &envelope.queue,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(backend)?
            .await
            .map_err(backend)?;

        if confirmation.is_nack() {
            warn!("Broker refused message");
            return Err(StorageError::Backend(format!(
                "broker nacked publish to {}/{}",
                envelope.exchange, envelope.queue
            )));
        }
        debug!(bytes = envelope.body.len(), "Message published");
        Ok(())
    }

    #[tracing::instrument(skip(self, handler, shutdown), fields(queue = %options.queue, consumer = %options.consumer_tag))]
    async fn consume(
        &self,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), StorageError> {
        let channel = self.connection.create_channel().await.map_err(backend)?;
        self.declare(&channel, &options.exchange, &options.exchange_type, &options.queue)
            .await?;
        channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await
            .map_err(backend)?;

        let mut consumer = channel
            .basic_consume(
                &options.queue,
                &options.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(backend)?;
        info!("Consumer started");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = consumer.next() => {
                    let Some(delivery) = next else {
                        warn!("Consumer stream closed by broker");
                        break;
                    };
                    let mut delivery = delivery.map_err(backend)?;
                    let message = IncomingMessage {
                        queue: options.queue.clone(),
                        headers: delivery
                            .properties
                            .headers()
                            .as_ref()
                            .map(headers_from_table)
                            .unwrap_or_default(),
                        body: std::mem::take(&mut delivery.data),
                        redelivered: delivery.redelivered,
                    };

                    let disposition = handler.handle(&message).await;
                    if let Err(e) = Self::settle(&delivery, disposition).await {
                        error!(error = %e, %disposition, "Failed to settle delivery");
                    }
                }
            }
        }

        if let Err(e) = channel
            .basic_cancel(&options.consumer_tag, BasicCancelOptions::default())
            .await
        {
            debug!(error = %e, "Consumer cancel failed");
        }
        if let Err(e) = channel.close(200, "shutdown").await {
            debug!(error = %e, "Channel close failed");
        }
        info!("Consumer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HEADER_SECRET, HEADER_TTL, HEADER_UNKNOWN};

    #[test]
    fn test_header_table_conversion() {
        let mut headers = Headers::new();
        headers.insert(HEADER_SECRET, "s3cret");
        headers.insert(HEADER_UNKNOWN, true);
        headers.insert(HEADER_TTL, 15i64);

        let table = headers_to_table(&headers);
        assert_eq!(table.inner().len(), 3);
        assert_eq!(headers_from_table(&table), headers);
    }

    #[test]
    fn test_foreign_header_types() {
        let mut table = FieldTable::default();
        table.insert(ShortString::from("x-int"), AMQPValue::LongInt(15));
        table.insert(ShortString::from("x-short"), AMQPValue::ShortString(ShortString::from("abc")));
        table.insert(ShortString::from("x-float"), AMQPValue::Double(1.5));

        let headers = headers_from_table(&table);
        assert_eq!(headers.get("x-int"), Some(&HeaderValue::Int(15)));
        assert_eq!(headers.get_str("x-short"), Some("abc"));
        assert!(headers.get("x-float").is_none());
    }

    #[test]
    fn test_exchange_kinds() {
        assert!(matches!(exchange_kind("direct"), ExchangeKind::Direct));
        assert!(matches!(exchange_kind("x-delayed-message"), ExchangeKind::Custom(k) if k == "x-delayed-message"));
    }
}
