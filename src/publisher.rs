// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outgoing Messages
//!
//! [`PublishMessage`] describes one message handed to
//! [`Channel::publish`](crate::channel::Channel::publish), and
//! [`merge_headers`] combines trace-context headers with the caller's own.

use crate::errors::AmqpError;
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
        ShortUInt,
    },
    BasicProperties,
};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Typed header values accepted by [`PublishMessage::header`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> AMQPValue {
        match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Uint(v) => AMQPValue::ShortUInt(ShortUInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// A message to publish.
#[derive(Debug, Clone)]
pub struct PublishMessage {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) body: Vec<u8>,
    pub(crate) properties: BasicProperties,
    pub(crate) mandatory: bool,
    pub(crate) propagate_trace: bool,
}

impl PublishMessage {
    pub fn new(exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> PublishMessage {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.into(),
            properties: BasicProperties::default(),
            mandatory: false,
            propagate_trace: false,
        }
    }

    /// Serializes `payload` as a JSON body with a JSON content type.
    pub fn json<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<PublishMessage, AmqpError> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))?;

        let mut msg = PublishMessage::new(exchange, routing_key, body);
        msg.properties = msg
            .properties
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE));
        Ok(msg)
    }

    /// Replaces the message properties, headers included.
    pub fn properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Adds a header, replacing any previous value of `key`.
    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        let mut headers = self.properties.headers().clone().unwrap_or_default();
        headers.insert(ShortString::from(key), value.into());
        self.properties = self.properties.with_headers(headers);
        self
    }

    /// Sets the message type property.
    pub fn kind(mut self, kind: &str) -> Self {
        self.properties = self.properties.with_type(ShortString::from(kind));
        self
    }

    /// Asks the broker to return the message when it is unroutable.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Injects the publishing span's trace context into the headers.
    pub fn propagate_trace(mut self) -> Self {
        self.propagate_trace = true;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Properties sent to the broker: trace headers merged under the caller's
    /// headers and a generated message id when the caller set none.
    pub(crate) fn outgoing_properties(
        &self,
        trace_headers: BTreeMap<ShortString, AMQPValue>,
    ) -> BasicProperties {
        let mut properties = self.properties.clone();

        if properties.message_id().is_none() {
            properties = properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()));
        }

        if trace_headers.is_empty() {
            return properties;
        }

        let headers = merge_headers(trace_headers, properties.headers().as_ref());
        properties.with_headers(headers)
    }
}

/// Merges injected trace headers with caller-supplied headers.
///
/// Caller values win when both define the same key.
pub fn merge_headers(
    injected: BTreeMap<ShortString, AMQPValue>,
    caller: Option<&FieldTable>,
) -> FieldTable {
    let mut merged = injected;
    if let Some(caller) = caller {
        for (key, value) in caller.inner() {
            merged.insert(key.clone(), value.clone());
        }
    }
    FieldTable::from(merged)
}
