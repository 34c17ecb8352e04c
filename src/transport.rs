// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The component never speaks the AMQP wire protocol itself. It drives a
//! broker through these traits; [`LapinConnector`] implements them over
//! `lapin`, and tests substitute in-memory brokers.

use crate::{errors::AmqpError, exchange::ExchangeDefinition, otel::Operation};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, ConnectionProperties,
};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Reply code sent with a graceful close
const REPLY_SUCCESS: u16 = 200;

/// Callback invoked once with the error that closed a connection or a channel.
pub type ErrorCallback = Box<dyn FnOnce(AmqpError) + Send>;

/// Stream of messages delivered to one consumer.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Broker reply to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOk {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// Opens network connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// An open network connection to a broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Registers the callback for an unexpected closure; it fires at most once.
    fn on_error(&self, callback: ErrorCallback);

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A protocol channel multiplexed over a [`BrokerConnection`].
///
/// Every method resolves once the broker replied, or once the frame was sent
/// for methods without a reply (publish, ack, nack).
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Registers the callback for a closure initiated by the broker; it fires at most once.
    fn on_error(&self, callback: ErrorCallback);

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclareOk, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// [`Connector`] backed by `lapin`.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        url: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name));

        let conn = lapin::Connection::connect(url, options)
            .await
            .map_err(|err| lapin_error(Operation::Connect, "", err))?;

        debug!("amqp connected");
        Ok(Arc::new(LapinConnection { conn }))
    }
}

pub struct LapinConnection {
    conn: lapin::Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    fn on_error(&self, callback: ErrorCallback) {
        let callback = Mutex::new(Some(callback));
        self.conn.on_error(move |err| {
            let pending = callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(callback) = pending {
                callback(AmqpError::ConnectionClosed(err.to_string()));
            }
        });
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|err| lapin_error(Operation::ChannelOpen, "", err))?;

        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(|err| lapin_error(Operation::Close, "", err))
    }
}

pub struct LapinChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn on_error(&self, callback: ErrorCallback) {
        let callback = Mutex::new(Some(callback));
        self.channel.on_error(move |err| {
            let pending = callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(callback) = pending {
                callback(AmqpError::ChannelClosed(err.to_string()));
            }
        });
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                def.options(),
                def.arguments(),
            )
            .await
            .map_err(|err| lapin_error(Operation::DeclareExchange, def.name(), err))
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclareOk, AmqpError> {
        let declared = self
            .channel
            .queue_declare(queue, options, arguments)
            .await
            .map_err(|err| lapin_error(Operation::DeclareQueue, queue, err))?;

        Ok(QueueDeclareOk {
            queue: declared.name().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                arguments,
            )
            .await
            .map_err(|err| lapin_error(Operation::Bind, &format!("{exchange}->{queue}"), err))
    }

    async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), AmqpError> {
        if prefetch_size != 0 {
            warn!(prefetch_size, "prefetch size is not supported by lapin, ignoring");
        }

        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| lapin_error(Operation::Qos, "", err))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<(), AmqpError> {
        // The publisher confirm is not awaited: publishing has no broker reply.
        let _confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|err| lapin_error(Operation::Publish, exchange, err))?;

        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, arguments)
            .await
            .map_err(|err| lapin_error(Operation::Consume, queue, err))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|delivery| InboundDelivery {
                        delivery_tag: delivery.delivery_tag,
                        exchange: delivery.exchange.to_string(),
                        routing_key: delivery.routing_key.to_string(),
                        redelivered: delivery.redelivered,
                        properties: delivery.properties,
                        body: delivery.data,
                    })
                    .map_err(|err| lapin_error(Operation::MessageReceived, "", err))
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| lapin_error(Operation::Ack, "", err))
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| lapin_error(Operation::Nack, "", err))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| lapin_error(Operation::Cancel, consumer_tag, err))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(|err| lapin_error(Operation::ChannelClose, "", err))
    }
}

/// Translates a lapin error, keeping closed-connection and closed-channel
/// states distinct from broker rejections.
fn lapin_error(operation: Operation, subject: &str, err: lapin::Error) -> AmqpError {
    match err {
        lapin::Error::InvalidConnectionState(_) => AmqpError::ConnectionClosed(err.to_string()),
        lapin::Error::InvalidChannelState(_) => AmqpError::ChannelClosed(err.to_string()),
        other => AmqpError::rejected(operation, subject, &other.to_string()),
    }
}
