// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides types for defining queues and their bindings. It
//! includes support for Dead Letter Queues (DLQ) and retry queues, which the
//! [`topology`](crate::topology) installer declares next to the main queue.

use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
};
use std::collections::BTreeMap;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// It supports standard queue options as well as advanced features like message TTL,
/// max length, Dead Letter Queues (DLQ), and retry mechanisms.
///
/// An empty name asks the broker to generate one; the generated name is
/// returned by [`Channel::queue_declare`](crate::channel::Channel::queue_declare).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) retries: Option<i32>,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    pub fn retry_name(&self) -> Option<&str> {
        self.retry_name.as_deref()
    }

    pub fn retries(&self) -> Option<i32> {
        self.retries
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a raw queue argument.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// The DLQ will receive messages that are rejected, expired, or overflow
    /// from the main queue. The DLQ name will be the main queue name with "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a retry mechanism to the queue.
    ///
    /// This creates a retry queue that temporarily holds failed messages before
    /// redelivering them to the main queue. The retry queue name will be the main
    /// queue name with "-retry" suffix.
    ///
    /// # Parameters
    /// * `ttl` - Time in milliseconds to wait before retrying
    /// * `retries` - Maximum number of retry attempts, enforced by consumers
    ///   registered with [`ConsumerDefinition::retry_policy`](crate::consumer::ConsumerDefinition::retry_policy)
    pub fn with_retry(mut self, ttl: i32, retries: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retries = Some(retries);
        self.retry_ttl = Some(ttl);
        self
    }

    pub fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: false,
        }
    }

    /// Arguments of the main queue.
    ///
    /// Rejected messages dead-letter to the retry queue when one is configured,
    /// otherwise to the DLQ.
    pub fn arguments(&self) -> FieldTable {
        let mut args = self.params.clone();

        let dead_letter_target = self.retry_name.as_ref().or(self.dlq_name.as_ref());
        if let Some(target) = dead_letter_target {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(target.as_str())),
            );
        }

        let limits = [
            (AMQP_HEADERS_MESSAGE_TTL, self.ttl),
            (AMQP_HEADERS_MAX_LENGTH, self.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, self.max_length_bytes),
        ];
        for (key, value) in limits {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongInt(LongInt::from(value)),
                );
            }
        }

        FieldTable::from(args)
    }

    /// Definition of the retry queue, which dead-letters back to this queue
    /// once the retry TTL expires.
    pub fn retry_definition(&self) -> Option<QueueDefinition> {
        let retry_name = self.retry_name.as_ref()?;

        let mut params = BTreeMap::new();
        params.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        params.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(self.name.as_str())),
        );
        if let Some(ttl) = self.retry_ttl {
            params.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        Some(QueueDefinition {
            name: retry_name.clone(),
            durable: self.durable,
            delete: self.delete,
            exclusive: self.exclusive,
            passive: self.passive,
            params,
            ..QueueDefinition::default()
        })
    }

    /// Definition of the DLQ.
    pub fn dlq_definition(&self) -> Option<QueueDefinition> {
        let dlq_name = self.dlq_name.as_ref()?;

        Some(QueueDefinition {
            name: dlq_name.clone(),
            durable: self.durable,
            delete: self.delete,
            exclusive: self.exclusive,
            passive: self.passive,
            ..QueueDefinition::default()
        })
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }

    pub fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_string(value: &str) -> AMQPValue {
        AMQPValue::LongString(LongString::from(value))
    }

    #[test]
    fn retry_queue_dead_letters_back_to_main_queue() {
        let def = QueueDefinition::new("orders").with_retry(5000, 3).with_dlq();

        let main_args = def.arguments();
        assert_eq!(
            main_args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&long_string("orders-retry"))
        );

        let retry = def.retry_definition().unwrap();
        assert_eq!(retry.name(), "orders-retry");
        let retry_args = retry.arguments();
        assert_eq!(
            retry_args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&long_string("orders"))
        );
        assert_eq!(
            retry_args.inner().get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(5000))
        );
        assert_eq!(def.dlq_definition().unwrap().name(), "orders-dlq");
    }

    #[test]
    fn dlq_only_queue_dead_letters_to_dlq() {
        let def = QueueDefinition::new("payments")
            .with_dlq()
            .ttl(1000)
            .max_length(10);

        let args = def.arguments();
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&long_string("payments-dlq"))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_MAX_LENGTH),
            Some(&AMQPValue::LongInt(10))
        );
        assert!(def.retry_definition().is_none());
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        let def = QueueDefinition::new("plain").durable();

        assert!(def.arguments().inner().is_empty());
        assert!(def.options().durable);
        assert!(!def.options().exclusive);
    }
}
