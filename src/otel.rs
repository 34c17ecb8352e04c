// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Instrumentation for AMQP Operations
//!
//! Every protocol operation of the component runs inside an [`OperationSpan`].
//! The span lives in an OpenTelemetry [`Context`] so it can be handed to
//! message handlers and injected into outgoing message headers. It ends when
//! dropped, which closes it on every exit path of the wrapped operation.

use crate::errors::AmqpError;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Status, TraceContextExt, Tracer},
    Context, KeyValue, Value,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::{borrow::Cow, collections::BTreeMap, fmt};
use tracing::error;

/// Instrumentation scope of every span created by this crate
pub const TRACER_NAME: &str = "amqp-component";

pub const TAG_CHANNEL: &str = "amqp.channel";
pub const TAG_EXCHANGE: &str = "amqp.exchange";
pub const TAG_ROUTING_KEY: &str = "amqp.routing_key";
pub const TAG_QUEUE: &str = "amqp.queue";
pub const TAG_CONSUMER_TAG: &str = "amqp.consumer_tag";
pub const TAG_DELIVERY_TAG: &str = "amqp.delivery_tag";
pub const TAG_BROKER_URL: &str = "amqp.broker_url";
pub const ANNOTATION_PROPERTIES: &str = "amqp.properties";
pub const ANNOTATION_BODY: &str = "amqp.body";

/// The instrumented protocol operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Close,
    ChannelOpen,
    ChannelClose,
    DeclareExchange,
    DeclareQueue,
    Bind,
    Qos,
    Publish,
    Consume,
    Ack,
    Nack,
    Cancel,
    MessageReceived,
}

impl Operation {
    /// Span name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Connect => "amqp.connect",
            Operation::Close => "amqp.connection.close",
            Operation::ChannelOpen => "amqp.channel.open",
            Operation::ChannelClose => "amqp.channel.close",
            Operation::DeclareExchange => "amqp.exchange.declare",
            Operation::DeclareQueue => "amqp.queue.declare",
            Operation::Bind => "amqp.queue.bind",
            Operation::Qos => "amqp.basic.qos",
            Operation::Publish => "amqp.basic.publish",
            Operation::Consume => "amqp.basic.consume",
            Operation::Ack => "amqp.basic.ack",
            Operation::Nack => "amqp.basic.nack",
            Operation::Cancel => "amqp.basic.cancel",
            Operation::MessageReceived => "amqp.message.received",
        }
    }

    pub fn kind(&self) -> SpanKind {
        match self {
            Operation::Publish => SpanKind::Producer,
            Operation::MessageReceived => SpanKind::Consumer,
            _ => SpanKind::Client,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installs the W3C trace-context propagator as the global text-map propagator.
///
/// Trace propagation through message headers is a no-op until a propagator
/// is installed. The host application calls this once during start-up.
pub fn install_propagator() {
    global::set_text_map_propagator(TraceContextPropagator::new());
}

/// Returns the tracer used for every span of the component.
pub fn tracer() -> BoxedTracer {
    global::tracer(TRACER_NAME)
}

/// A span wrapping one protocol operation.
pub struct OperationSpan {
    cx: Context,
}

impl OperationSpan {
    /// Starts the span of `operation` as a child of `parent`.
    pub fn start(tracer: &BoxedTracer, operation: Operation, parent: &Context) -> OperationSpan {
        let span = tracer
            .span_builder(Cow::from(operation.as_str()))
            .with_kind(operation.kind())
            .start_with_context(tracer, parent);

        OperationSpan {
            cx: parent.with_span(span),
        }
    }

    /// The context carrying this span, for handlers and child spans.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    pub fn tag(&self, key: &'static str, value: impl Into<Value>) {
        self.cx.span().set_attribute(KeyValue::new(key, value));
    }

    /// Records a named annotation as a span event.
    pub fn annotate(&self, key: &'static str, value: String) {
        self.cx
            .span()
            .add_event(key, vec![KeyValue::new("value", value)]);
    }

    /// Sets the span status from the outcome of the wrapped operation.
    pub fn record<T>(&self, result: &Result<T, AmqpError>) {
        let span = self.cx.span();
        match result {
            Ok(_) => span.set_status(Status::Ok),
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::error(err.to_string()));
            }
        }
    }

    /// Serializes the span context into AMQP header entries.
    pub fn inject(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut headers = BTreeMap::new();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&self.cx, &mut HeaderInjector::new(&mut headers))
        });
        headers
    }
}

impl Drop for OperationSpan {
    fn drop(&mut self) {
        self.cx.span().end();
    }
}

/// Rebuilds the remote parent context from message headers.
///
/// Returns an empty context, and therefore a new trace, when the headers
/// carry no trace context.
pub fn extract_context(headers: Option<&FieldTable>) -> Context {
    let Some(headers) = headers else {
        return Context::new();
    };

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers.inner()))
    })
}

/// Injects OpenTelemetry context entries into AMQP headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads OpenTelemetry context entries from AMQP headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .and_then(|header_value| match header_value {
                AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                    .map_err(|e| error!("error decoding header value {:?}", e))
                    .ok(),
                AMQPValue::ShortString(value) => Some(value.as_str()),
                _ => None,
            })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Redacts the password of a broker URL for use in tags and logs.
pub fn mask_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_owned(),
    }
}

/// Renders message properties as JSON for span annotations.
pub fn properties_to_json(props: &AMQPProperties) -> serde_json::Value {
    let mut map = serde_json::Map::new();

    let strings = [
        ("content_type", props.content_type()),
        ("content_encoding", props.content_encoding()),
        ("correlation_id", props.correlation_id()),
        ("reply_to", props.reply_to()),
        ("expiration", props.expiration()),
        ("message_id", props.message_id()),
        ("type", props.kind()),
        ("user_id", props.user_id()),
        ("app_id", props.app_id()),
    ];
    for (key, value) in strings {
        if let Some(value) = value {
            map.insert(key.to_owned(), serde_json::Value::from(value.as_str()));
        }
    }

    if let Some(mode) = props.delivery_mode() {
        map.insert("delivery_mode".to_owned(), serde_json::Value::from(*mode));
    }
    if let Some(priority) = props.priority() {
        map.insert("priority".to_owned(), serde_json::Value::from(*priority));
    }
    if let Some(timestamp) = props.timestamp() {
        map.insert("timestamp".to_owned(), serde_json::Value::from(*timestamp));
    }
    if let Some(headers) = props.headers() {
        map.insert("headers".to_owned(), field_table_to_json(headers));
    }

    serde_json::Value::Object(map)
}

fn field_table_to_json(table: &FieldTable) -> serde_json::Value {
    serde_json::Value::Object(
        table
            .inner()
            .iter()
            .map(|(key, value)| (key.to_string(), amqp_value_to_json(value)))
            .collect(),
    )
}

fn amqp_value_to_json(value: &AMQPValue) -> serde_json::Value {
    match value {
        AMQPValue::Boolean(v) => serde_json::Value::from(*v),
        AMQPValue::ShortShortInt(v) => serde_json::Value::from(*v),
        AMQPValue::ShortShortUInt(v) => serde_json::Value::from(*v),
        AMQPValue::ShortInt(v) => serde_json::Value::from(*v),
        AMQPValue::ShortUInt(v) => serde_json::Value::from(*v),
        AMQPValue::LongInt(v) => serde_json::Value::from(*v),
        AMQPValue::LongUInt(v) => serde_json::Value::from(*v),
        AMQPValue::LongLongInt(v) => serde_json::Value::from(*v),
        AMQPValue::Float(v) => serde_json::Value::from(*v),
        AMQPValue::Double(v) => serde_json::Value::from(*v),
        AMQPValue::ShortString(v) => serde_json::Value::from(v.as_str()),
        AMQPValue::LongString(v) => {
            serde_json::Value::from(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::Timestamp(v) => serde_json::Value::from(*v),
        AMQPValue::FieldArray(array) => serde_json::Value::Array(
            array.as_slice().iter().map(amqp_value_to_json).collect(),
        ),
        AMQPValue::FieldTable(table) => field_table_to_json(table),
        AMQPValue::Void => serde_json::Value::Null,
        other => serde_json::Value::from(format!("{other:?}")),
    }
}

/// Decodes a message body for span annotations.
pub fn body_to_text(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}
