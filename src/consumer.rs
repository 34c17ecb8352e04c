// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Deliveries of a consumer registered with
//! [`Channel::consume`](crate::channel::Channel::consume) are dispatched, one
//! at a time and in order, to a [`ConsumerHandler`]. Each message is processed
//! inside an `amqp.message.received` span whose parent is the trace context
//! carried by the message headers.
//!
//! A consumer registered with a retry policy settles failed deliveries
//! itself: they go back through the retry queue until the `x-death` count
//! reaches the configured retries, then to the dead letter queue.

use crate::{
    channel::Channel,
    errors::AmqpError,
    otel::{
        self, Operation, OperationSpan, ANNOTATION_BODY, ANNOTATION_PROPERTIES, TAG_BROKER_URL,
        TAG_CHANNEL, TAG_CONSUMER_TAG, TAG_DELIVERY_TAG, TAG_EXCHANGE, TAG_ROUTING_KEY,
    },
    publisher::PublishMessage,
    queue::QueueDefinition,
    transport::{DeliveryStream, InboundDelivery},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::BasicConsumeOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use tracing::{debug, error, warn};

/// Header RabbitMQ adds to dead-lettered messages
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Count field of an `x-death` entry
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Delivery metadata handed to a [`ConsumerHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverInfo {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    /// Times the message already went through the retry queue
    pub retry_count: i64,
}

/// Application logic processing the messages of one consumer.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one message.
    ///
    /// # Parameters
    /// * `ctx` - Context carrying the message span
    /// * `channel` - The consuming channel, to ack or nack the delivery
    /// * `body` - The message payload
    /// * `info` - Delivery metadata
    /// * `properties` - The message properties
    async fn exec(
        &self,
        ctx: &Context,
        channel: &Arc<Channel>,
        body: &[u8],
        info: &DeliverInfo,
        properties: &BasicProperties,
    ) -> Result<(), AmqpError>;
}

/// How failed deliveries of a queue are settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: Option<i64>,
    dlq_name: Option<String>,
}

impl RetryPolicy {
    /// Reads the retry and DLQ settings of `queue`.
    pub fn from_queue(queue: &QueueDefinition) -> RetryPolicy {
        RetryPolicy {
            retries: queue.retry_name().and(queue.retries()).map(i64::from),
            dlq_name: queue.dlq_name().map(str::to_owned),
        }
    }
}

/// Settings of a consumer registration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerDefinition {
    pub(crate) queue: String,
    pub(crate) consumer_tag: Option<String>,
    pub(crate) auto_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
    pub(crate) retry_policy: Option<RetryPolicy>,
}

impl ConsumerDefinition {
    pub fn new(queue: &str) -> ConsumerDefinition {
        ConsumerDefinition {
            queue: queue.to_owned(),
            ..ConsumerDefinition::default()
        }
    }

    /// Uses a caller-chosen consumer tag instead of a generated one.
    pub fn tag(mut self, consumer_tag: &str) -> Self {
        self.consumer_tag = Some(consumer_tag.to_owned());
        self
    }

    /// Lets the broker consider messages acknowledged on delivery.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Settles failed deliveries following the retry settings of `queue`.
    ///
    /// When the handler fails, the delivery is rejected into the retry queue
    /// while its retry count is below the queue's retries, then published to
    /// the DLQ and acknowledged. Without a retry queue it is rejected without
    /// requeue. Handlers must leave failed deliveries unsettled. Has no effect
    /// on auto-ack consumers.
    pub fn retry_policy(mut self, queue: &QueueDefinition) -> Self {
        self.retry_policy = Some(RetryPolicy::from_queue(queue));
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn failure_policy(&self) -> Option<RetryPolicy> {
        self.retry_policy.clone().filter(|_| !self.auto_ack)
    }

    pub(crate) fn options(&self) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: false,
            no_ack: self.auto_ack,
            exclusive: self.exclusive,
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

/// Drives one consumer until its stream ends or its channel is dropped.
pub(crate) async fn run(
    channel: Weak<Channel>,
    consumer_tag: String,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn ConsumerHandler>,
    policy: Option<RetryPolicy>,
) {
    while let Some(next) = deliveries.next().await {
        let Some(channel) = channel.upgrade() else {
            break;
        };

        match next {
            Ok(delivery) => {
                let dispatched = dispatch(
                    &channel,
                    handler.as_ref(),
                    &consumer_tag,
                    policy.as_ref(),
                    delivery,
                )
                .await;
                if let Err(err) = dispatched {
                    error!(
                        error = err.to_string(),
                        consumer_tag, "error consume msg"
                    );
                }
            }
            Err(err) => error!(error = err.to_string(), consumer_tag, "errors consume msg"),
        }
    }

    debug!(consumer_tag, "consumer stream ended");
}

/// Processes one delivery inside its `amqp.message.received` span.
///
/// The span is closed before a handler error is returned.
pub(crate) async fn dispatch(
    channel: &Arc<Channel>,
    handler: &dyn ConsumerHandler,
    consumer_tag: &str,
    policy: Option<&RetryPolicy>,
    delivery: InboundDelivery,
) -> Result<(), AmqpError> {
    let parent = otel::extract_context(delivery.properties.headers().as_ref());
    let span = OperationSpan::start(channel.tracer(), Operation::MessageReceived, &parent);

    span.tag(TAG_CHANNEL, i64::from(channel.number()));
    span.tag(TAG_EXCHANGE, delivery.exchange.clone());
    span.tag(TAG_ROUTING_KEY, delivery.routing_key.clone());
    span.tag(TAG_CONSUMER_TAG, consumer_tag.to_owned());
    span.tag(TAG_DELIVERY_TAG, delivery.delivery_tag as i64);
    span.tag(TAG_BROKER_URL, channel.masked_url().to_owned());

    let config = channel.config();
    if config.log_in_props {
        span.annotate(
            ANNOTATION_PROPERTIES,
            otel::properties_to_json(&delivery.properties).to_string(),
        );
    }
    if config.log_in_body {
        span.annotate(ANNOTATION_BODY, otel::body_to_text(&delivery.body));
    }

    debug!(
        "received: {} - exchange: {}",
        delivery.routing_key, delivery.exchange,
    );

    let info = DeliverInfo {
        consumer_tag: consumer_tag.to_owned(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.clone(),
        routing_key: delivery.routing_key.clone(),
        retry_count: retry_count(&delivery.properties),
    };

    let result = handler
        .exec(
            span.context(),
            channel,
            &delivery.body,
            &info,
            &delivery.properties,
        )
        .await;

    let settled = match (&result, policy) {
        (Err(_), Some(policy)) => {
            settle_failure(channel, span.context(), policy, &info, &delivery).await
        }
        _ => Ok(()),
    };

    span.record(&result);
    drop(span);

    settled.and(result)
}

/// Rejects a failed delivery into its retry queue, or moves it to the DLQ
/// once its retries are used up.
async fn settle_failure(
    channel: &Arc<Channel>,
    ctx: &Context,
    policy: &RetryPolicy,
    info: &DeliverInfo,
    delivery: &InboundDelivery,
) -> Result<(), AmqpError> {
    let retries_left = policy.retries.map(|retries| info.retry_count < retries);

    match retries_left {
        None => channel.nack(info.delivery_tag, false, false).await,
        Some(true) => {
            warn!("error whiling handling msg, requeuing for latter");
            channel.nack(info.delivery_tag, false, false).await
        }
        Some(false) => {
            error!("too many attempts, sending to dlq");
            if let Some(dlq) = policy.dlq_name.as_deref() {
                let msg = PublishMessage::new("", dlq, delivery.body.clone())
                    .properties(delivery.properties.clone());
                channel.publish(ctx, &msg).await.map_err(|err| {
                    error!(error = err.to_string(), "error whiling sending to dlq");
                    AmqpError::PublishingToDLQError(err.to_string())
                })?;
            }
            channel.ack(info.delivery_tag, false).await
        }
    }
}

/// Reads the retry count from the most recent `x-death` header entry.
pub fn retry_count(properties: &BasicProperties) -> i64 {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(AMQP_HEADERS_X_DEATH))
        .and_then(AMQPValue::as_array)
        .and_then(|deaths| deaths.as_slice().first())
        .and_then(AMQPValue::as_field_table)
        .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
        .and_then(AMQPValue::as_long_long_int)
        .unwrap_or_default()
}
