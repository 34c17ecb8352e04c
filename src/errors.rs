// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Component
//!
//! This module provides the error type shared by the connection manager, the
//! channels and the component orchestrator. The `AmqpError` enum is cloneable
//! so a closed channel can hand its closing error to every request that was
//! waiting on it.

use crate::otel::Operation;
use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection-level variants are recovered by the component's reconnect loop.
/// Channel-level variants and timeouts are surfaced to the caller of the
/// operation that failed and are never retried by this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The connection was closed, by the broker or by a network failure
    #[error("connection closed `{0}`")]
    ConnectionClosed(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The channel was closed while the operation was pending or before it started
    #[error("channel closed `{0}`")]
    ChannelClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange, with the binding and the broker reason
    #[error("failure to bind `{0}` `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error moving a message that used up its retries to the dead letter queue
    #[error("failure to send message to dlq `{0}`")]
    PublishingToDLQError(String),

    /// Error serializing a message payload
    #[error("failure to serialize payload `{0}`")]
    SerializationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error raised by a consumer handler while processing a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The broker did not reply within the configured budget
    #[error("`{operation}` timed out after {timeout:?}")]
    Timeout {
        operation: Operation,
        timeout: Duration,
    },

    /// The operation is not allowed in the current state
    #[error("invalid state `{0}`")]
    InvalidState(String),

    /// The initial connection exhausted every configured attempt
    #[error("failure to prepare the component after {attempts} attempts: {reason}")]
    PrepareFailed { attempts: u32, reason: String },

    /// Invalid component configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// The component was stopped
    #[error("component stopped")]
    Stopped,
}

impl AmqpError {
    /// Builds the broker rejection error that matches an operation.
    ///
    /// Transports use this to translate a failed protocol call into the
    /// variant callers expect for that operation.
    pub fn rejected(operation: Operation, subject: &str, reason: &str) -> AmqpError {
        let detail = if subject.is_empty() {
            reason.to_owned()
        } else {
            format!("{subject}: {reason}")
        };

        match operation {
            Operation::Connect => AmqpError::ConnectionError(detail),
            Operation::Close => AmqpError::ConnectionClosed(detail),
            Operation::ChannelOpen | Operation::ChannelClose => AmqpError::ChannelError(detail),
            Operation::DeclareExchange => AmqpError::DeclareExchangeError(detail),
            Operation::DeclareQueue => AmqpError::DeclareQueueError(detail),
            Operation::Bind => {
                AmqpError::BindingExchangeToQueueError(subject.to_owned(), reason.to_owned())
            }
            Operation::Qos => AmqpError::QoSDeclarationError(detail),
            Operation::Publish => AmqpError::PublishingError(detail),
            Operation::Consume => AmqpError::BindingConsumerError(detail),
            Operation::Ack => AmqpError::AckMessageError(detail),
            Operation::Nack => AmqpError::NackMessageError(detail),
            Operation::Cancel => AmqpError::CancelConsumerError(detail),
            Operation::MessageReceived => AmqpError::ConsumerError(detail),
        }
    }

    /// Returns true for errors caused by a closed connection or channel.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionClosed(_) | AmqpError::ChannelClosed(_)
        )
    }

    /// Returns true for timeout errors.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AmqpError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_maps_operation_to_variant() {
        assert_eq!(
            AmqpError::rejected(Operation::DeclareExchange, "orders", "PRECONDITION_FAILED"),
            AmqpError::DeclareExchangeError("orders: PRECONDITION_FAILED".to_owned())
        );
        assert_eq!(
            AmqpError::rejected(Operation::Qos, "", "not allowed"),
            AmqpError::QoSDeclarationError("not allowed".to_owned())
        );
    }

    #[test]
    fn timeout_message_names_operation() {
        let err = AmqpError::Timeout {
            operation: Operation::DeclareQueue,
            timeout: Duration::from_millis(10),
        };

        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "`amqp.queue.declare` timed out after 10ms");
    }
}
