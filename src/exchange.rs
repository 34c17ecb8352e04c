// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Types describing the exchanges a channel declares. Exchanges are the
//! routing entities of the broker that forward published messages to bound
//! queues.

use lapin::{
    options::ExchangeDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use std::collections::BTreeMap;

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XMessageDelayed => "x-delayed-message",
        }
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom(ExchangeKind::XMessageDelayed.as_str().to_owned())
            }
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Built with chained setters:
///
/// ```
/// use amqp_component::exchange::ExchangeDefinition;
///
/// let orders = ExchangeDefinition::new("orders").fanout().durable();
/// assert_eq!(orders.name(), "orders");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new direct exchange definition with default flags.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            params: BTreeMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn direct_delayed(self) -> Self {
        self.delayed("direct")
    }

    /// Creates a delayed fanout exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn fanout_delayed(self) -> Self {
        self.delayed("fanout")
    }

    fn delayed(mut self, routing: &str) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(routing)),
        );
        self
    }

    /// Replaces the exchange arguments.
    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single argument to the exchange.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.delete,
            internal: self.internal,
            nowait: false,
        }
    }

    pub fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}
