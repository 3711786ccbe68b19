//! AMQP 0-9-1 transport backed by lapin.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde_json::Value;
use tracing::{debug, info};

use super::{
    BrokerChannel, DeliveryStream, DeliveryToken, EventSink, Link, Message, QueueInfo,
    QueueOptions, Transport,
};
use crate::error::TransportError;

/// Transport that talks to a real broker.
#[derive(Debug, Clone, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    type Connection = Connection;
    type Channel = AmqpChannel;

    async fn connect(&self, uri: &str, events: EventSink) -> Result<Connection, TransportError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;

        connection.on_error(move |err| {
            events.error(Link::Connection, err.to_string());
        });

        info!("rabbitmq_connected");
        Ok(connection)
    }

    async fn create_channel(
        &self,
        connection: &Connection,
        events: EventSink,
    ) -> Result<AmqpChannel, TransportError> {
        let channel = connection.create_channel().await?;
        info!(channel_id = channel.id(), "rabbitmq_channel_created");
        Ok(AmqpChannel { channel, events })
    }

    async fn close(&self, connection: Connection) -> Result<(), TransportError> {
        if !connection.status().connected() {
            return Ok(());
        }
        connection.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

/// One lapin channel plus the sink for its link events.
///
/// lapin reports channel closure through the error of the next call on it,
/// so every failed call re-checks the channel status and emits a close event
/// when the channel is gone.
#[derive(Clone)]
pub struct AmqpChannel {
    channel: Channel,
    events: EventSink,
}

impl AmqpChannel {
    fn fail(&self, err: lapin::Error) -> TransportError {
        let err = TransportError::from(err);
        if matches!(err, TransportError::Closed(_)) || !self.channel.status().connected() {
            self.events.closed(Link::Channel, err.to_string());
        }
        err
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                field_table(&options.declare_arguments()),
            )
            .await
            .map_err(|e| self.fail(e))?;

        Ok(QueueInfo {
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn check_queue(&self, queue: &str) -> Result<QueueInfo, TransportError> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(e))?;

        Ok(QueueInfo {
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn send_to_queue(&self, queue: &str, payload: &[u8]) -> Result<bool, TransportError> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| self.fail(e))?
            .await
            .map_err(|e| self.fail(e))?;

        Ok(!confirmation.is_nack())
    }

    async fn get(&self, queue: &str) -> Result<Option<Message>, TransportError> {
        let fetched = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: true })
            .await
            .map_err(|e| self.fail(e))?;

        Ok(fetched.map(|msg| {
            Message::new(msg.delivery.data, DeliveryToken(msg.delivery.delivery_tag))
        }))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(e))?;

        let events = self.events.clone();
        let stream = consumer.map(move |delivery| match delivery {
            Ok(delivery) => Ok(Message::new(
                delivery.data,
                DeliveryToken(delivery.delivery_tag),
            )),
            Err(err) => {
                let err = TransportError::from(err);
                events.closed(Link::Channel, err.to_string());
                Err(err)
            }
        });

        Ok(stream.boxed())
    }

    async fn ack(&self, token: DeliveryToken) -> Result<(), TransportError> {
        self.channel
            .basic_ack(token.0, BasicAckOptions::default())
            .await
            .map_err(|e| self.fail(e))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }
        debug!(channel_id = self.channel.id(), "rabbitmq_channel_closing");
        self.channel.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

/// Convert declare arguments to an AMQP field table.
fn field_table(args: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        table.insert(key.clone().into(), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(s.clone().into()),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let nested: BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            AMQPValue::FieldTable(field_table(&nested))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn test_amqp_value_conversion() {
        assert_eq!(amqp_value(&Value::from(60_000)), AMQPValue::LongLongInt(60_000));
        assert_eq!(amqp_value(&Value::Bool(true)), AMQPValue::Boolean(true));
        assert_eq!(amqp_value(&Value::Null), AMQPValue::Void);
        assert_eq!(
            amqp_value(&Value::from("dlx")),
            AMQPValue::LongString("dlx".to_string().into())
        );
    }

    #[test]
    fn test_field_table_uses_declare_arguments() {
        let options = QueueOptions {
            max_length: Some(100),
            ..Default::default()
        };
        let table = field_table(&options.declare_arguments());
        assert_eq!(
            table
                .inner()
                .get(&ShortString::from("x-max-length".to_string())),
            Some(&AMQPValue::LongLongInt(100))
        );
    }
}
