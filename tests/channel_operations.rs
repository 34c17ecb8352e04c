// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use amqp_component::{
    channel::Channel,
    config::AmqpConfig,
    consumer::{
        ConsumerDefinition, ConsumerHandler, DeliverInfo, AMQP_HEADERS_COUNT,
        AMQP_HEADERS_X_DEATH,
    },
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel::Operation,
    publisher::{HeaderValue, PublishMessage},
    queue::{QueueBinding, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
    topology::{AmqpTopology, Topology},
};
use async_trait::async_trait;
use common::{eventually, open_channel, test_config, FakeBroker};
use futures_util::future::join_all;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

struct AckingHandler {
    received: mpsc::UnboundedSender<(DeliverInfo, Vec<u8>)>,
}

#[async_trait]
impl ConsumerHandler for AckingHandler {
    async fn exec(
        &self,
        _ctx: &Context,
        channel: &Arc<Channel>,
        body: &[u8],
        info: &DeliverInfo,
        _properties: &BasicProperties,
    ) -> Result<(), AmqpError> {
        channel.ack(info.delivery_tag, false).await?;
        let _ = self.received.send((info.clone(), body.to_vec()));
        Ok(())
    }
}

struct FailingHandler;

#[async_trait]
impl ConsumerHandler for FailingHandler {
    async fn exec(
        &self,
        _ctx: &Context,
        channel: &Arc<Channel>,
        _body: &[u8],
        info: &DeliverInfo,
        _properties: &BasicProperties,
    ) -> Result<(), AmqpError> {
        channel.nack(info.delivery_tag, false, false).await?;
        Err(AmqpError::ConsumerError("cannot process".to_owned()))
    }
}

struct UnsettledFailingHandler;

#[async_trait]
impl ConsumerHandler for UnsettledFailingHandler {
    async fn exec(
        &self,
        _ctx: &Context,
        _channel: &Arc<Channel>,
        _body: &[u8],
        _info: &DeliverInfo,
        _properties: &BasicProperties,
    ) -> Result<(), AmqpError> {
        Err(AmqpError::ConsumerError("cannot process".to_owned()))
    }
}

fn retried(count: i64) -> BasicProperties {
    let mut death = FieldTable::default();
    death.insert(
        ShortString::from(AMQP_HEADERS_COUNT),
        AMQPValue::LongLongInt(count),
    );
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(AMQP_HEADERS_X_DEATH),
        AMQPValue::FieldArray(vec![AMQPValue::FieldTable(death)].into()),
    );
    BasicProperties::default().with_headers(headers)
}

#[tokio::test]
async fn requests_on_one_channel_are_serialized() {
    let broker = FakeBroker::new();
    broker.reply_delay(Duration::from_millis(5));
    let channel = open_channel(&broker, test_config()).await;

    let exchanges: Vec<ExchangeDefinition> = (0..3)
        .map(|i| ExchangeDefinition::new(&format!("events-{i}")).direct())
        .collect();
    let queues: Vec<QueueDefinition> = (0..3)
        .map(|i| QueueDefinition::new(&format!("jobs-{i}")).durable())
        .collect();
    let bindings: Vec<QueueBinding> = (0..3)
        .map(|i| {
            QueueBinding::new(&format!("jobs-{i}"))
                .exchange("events-0")
                .routing_key("created")
        })
        .collect();

    let (declared, queued, bound, qos) = tokio::join!(
        join_all(exchanges.iter().map(|def| channel.exchange_declare(def))),
        join_all(queues.iter().map(|def| channel.queue_declare(def))),
        join_all(bindings.iter().map(|binding| channel.queue_bind(binding))),
        channel.qos(0, 10, false),
    );

    assert!(declared.iter().all(Result::is_ok));
    assert!(queued.iter().all(Result::is_ok));
    assert!(bound.iter().all(Result::is_ok));
    assert_eq!(qos, Ok(()));
    assert_eq!(broker.max_in_flight(), 1);
    assert_eq!(broker.exchanges().len(), 3);
    assert_eq!(broker.bindings().len(), 3);
}

#[tokio::test]
async fn requests_on_different_channels_run_concurrently() {
    let broker = FakeBroker::new();
    broker.reply_delay(Duration::from_millis(20));
    let first = open_channel(&broker, test_config()).await;
    let second = open_channel(&broker, test_config()).await;

    let orders = ExchangeDefinition::new("orders").topic();
    let invoices = ExchangeDefinition::new("invoices").topic();
    let (a, b) = tokio::join!(
        first.exchange_declare(&orders),
        second.exchange_declare(&invoices)
    );

    assert_eq!(a, Ok(()));
    assert_eq!(b, Ok(()));
    assert_eq!(broker.max_in_flight(), 2);
}

#[tokio::test]
async fn declare_without_reply_times_out() {
    let broker = FakeBroker::new();
    broker.silent_declares(true);
    let config = AmqpConfig {
        exchange_declare_timeout: Duration::from_millis(10),
        ..test_config()
    };
    let channel = open_channel(&broker, config).await;

    let started = Instant::now();
    let result = channel
        .exchange_declare(&ExchangeDefinition::new("orders").fanout())
        .await;
    let elapsed = started.elapsed();

    assert_eq!(
        result,
        Err(AmqpError::Timeout {
            operation: Operation::DeclareExchange,
            timeout: Duration::from_millis(10),
        })
    );
    assert!(elapsed >= Duration::from_millis(10), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(50), "{elapsed:?}");
    assert!(broker.exchanges().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reply_arriving_at_the_deadline_wins() {
    let broker = FakeBroker::new();
    broker.reply_delay(Duration::from_millis(10));
    let config = AmqpConfig {
        queue_declare_timeout: Duration::from_millis(10),
        ..test_config()
    };
    let channel = open_channel(&broker, config).await;

    let result = channel
        .queue_declare(&QueueDefinition::new("deadline"))
        .await;

    assert_eq!(result.map(|ok| ok.queue), Ok("deadline".to_owned()));
    assert_eq!(broker.queues().len(), 1);
}

#[tokio::test]
async fn pending_request_fails_with_the_closing_error() {
    let broker = FakeBroker::new();
    broker.silent_declares(true);
    let channel = open_channel(&broker, test_config()).await;

    let pending = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .queue_declare(&QueueDefinition::new("never-declared"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let closing = AmqpError::ChannelClosed("PRECONDITION_FAILED - inequivalent arg".to_owned());
    channel.mark_closed(closing.clone());

    let result = pending.await.unwrap();
    assert_eq!(result, Err(closing.clone()));
    assert!(!channel.is_open());

    let next = channel
        .exchange_declare(&ExchangeDefinition::new("orders"))
        .await;
    assert_eq!(next, Err(closing));
}

#[tokio::test]
async fn broker_side_close_stops_consumers_and_fails_requests() {
    let broker = FakeBroker::new();
    let channel = open_channel(&broker, test_config()).await;
    let (sender, _received) = mpsc::unbounded_channel();
    channel
        .consume(
            &ConsumerDefinition::new("orders"),
            Arc::new(AckingHandler { received: sender }),
        )
        .await
        .unwrap();

    let reason = "PRECONDITION_FAILED - unknown delivery tag 3";
    let closing = AmqpError::ChannelClosed(reason.to_owned());
    broker.close_channel(channel.number(), reason);

    assert!(!channel.is_open());
    assert_eq!(channel.closing_error(), closing);
    assert_eq!(channel.consumer_tag(), None);
    assert_eq!(
        channel.queue_declare(&QueueDefinition::new("orders")).await,
        Err(closing)
    );
}

#[tokio::test]
async fn unnamed_closed_channel_rejects_publish() {
    let broker = FakeBroker::new();
    let channel = open_channel(&broker, test_config()).await;

    assert_eq!(channel.close().await, Ok(()));
    assert_eq!(channel.close().await, Ok(()));

    let result = channel
        .publish(&Context::new(), &PublishMessage::new("orders", "created", "{}"))
        .await;

    assert!(matches!(result, Err(AmqpError::ChannelClosed(_))));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn publish_keeps_caller_headers_and_sets_a_message_id() {
    let broker = FakeBroker::new();
    let channel = open_channel(&broker, test_config()).await;

    let msg = PublishMessage::new("", "orders", r#"{"id":1}"#)
        .header("tenant", HeaderValue::LongString("acme".to_owned()))
        .kind("order.created")
        .propagate_trace();
    channel.publish(&Context::new(), &msg).await.unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    let props = &published[0].properties;
    assert!(props.message_id().is_some());
    assert_eq!(
        props.kind().as_ref().map(|kind| kind.as_str()),
        Some("order.created")
    );
    let headers = props.headers().clone().unwrap();
    assert_eq!(
        headers.inner().get("tenant"),
        Some(&AMQPValue::LongString(LongString::from("acme")))
    );
}

#[tokio::test]
async fn consumer_receives_and_acks_messages() {
    let broker = FakeBroker::new();
    let channel = open_channel(&broker, test_config()).await;
    channel
        .queue_declare(&QueueDefinition::new("orders"))
        .await
        .unwrap();

    let (sender, mut received) = mpsc::unbounded_channel();
    let tag = channel
        .consume(
            &ConsumerDefinition::new("orders"),
            Arc::new(AckingHandler { received: sender }),
        )
        .await
        .unwrap();
    assert!(tag.starts_with("ctag-"));
    assert_eq!(channel.consumer_tag(), Some(tag.clone()));

    for id in 1..=2 {
        let msg = PublishMessage::new("", "orders", format!(r#"{{"id":{id}}}"#));
        channel.publish(&Context::new(), &msg).await.unwrap();
    }

    let (first, body) = received.recv().await.unwrap();
    assert_eq!(first.consumer_tag, tag);
    assert_eq!(first.exchange, "");
    assert_eq!(first.routing_key, "orders");
    assert_eq!(body, br#"{"id":1}"#);

    let (second, _) = received.recv().await.unwrap();
    assert!(second.delivery_tag > first.delivery_tag);
    assert_eq!(
        broker.acks(),
        vec![first.delivery_tag, second.delivery_tag]
    );
}

#[tokio::test]
async fn handler_errors_do_not_stop_the_consumer() {
    let broker = FakeBroker::new();
    let channel = open_channel(&broker, test_config()).await;

    channel
        .consume(
            &ConsumerDefinition::new("invoices").tag("billing"),
            Arc::new(FailingHandler),
        )
        .await
        .unwrap();

    for _ in 0..2 {
        let msg = PublishMessage::new("", "invoices", "{}");
        channel.publish(&Context::new(), &msg).await.unwrap();
    }

    assert!(eventually(|| broker.nacks().len() == 2).await);
    assert!(broker.nacks().iter().all(|(_, requeue)| !requeue));
    assert_eq!(channel.consumer_tag().as_deref(), Some("billing"));
}

#[tokio::test]
async fn cancel_stops_the_active_consumer() {
    let broker = FakeBroker::new();
    let channel = open_channel(&broker, test_config()).await;

    let (sender, _received) = mpsc::unbounded_channel();
    channel
        .consume(
            &ConsumerDefinition::new("orders"),
            Arc::new(AckingHandler { received: sender }),
        )
        .await
        .unwrap();
    assert_eq!(broker.subscribers(), 1);

    assert_eq!(channel.cancel(None).await, Ok(()));
    assert_eq!(channel.consumer_tag(), None);
    assert_eq!(broker.subscribers(), 0);
    assert!(matches!(
        channel.cancel(None).await,
        Err(AmqpError::InvalidState(_))
    ));
}

#[tokio::test]
async fn broker_names_anonymous_queues() {
    let broker = FakeBroker::new();
    let channel = open_channel(&broker, test_config()).await;

    let declared = channel
        .queue_declare(&QueueDefinition::new("").exclusive())
        .await
        .unwrap();

    assert!(declared.queue.starts_with("amq.gen-"));
    assert_eq!(declared.message_count, 0);
}

#[tokio::test]
async fn topology_declares_retry_and_dead_letter_queues_first() {
    let broker = FakeBroker::new();
    let channel = open_channel(&broker, test_config()).await;

    AmqpTopology::new(channel.clone())
        .exchange(ExchangeDefinition::new("orders").direct().durable())
        .queue(
            QueueDefinition::new("orders-created")
                .durable()
                .with_dlq()
                .with_retry(5_000, 3),
        )
        .queue_binding(
            QueueBinding::new("orders-created")
                .exchange("orders")
                .routing_key("created"),
        )
        .install()
        .await
        .unwrap();

    let queues = broker.queues();
    let names: Vec<&str> = queues.iter().map(|queue| queue.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["orders-created-retry", "orders-created-dlq", "orders-created"]
    );
    assert_eq!(
        queues[2]
            .arguments
            .inner()
            .get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        Some(&AMQPValue::LongString(LongString::from(
            "orders-created-retry"
        )))
    );
    assert_eq!(broker.exchanges(), vec!["orders".to_owned()]);
    assert_eq!(
        broker.bindings(),
        vec![(
            "orders-created".to_owned(),
            "orders".to_owned(),
            "created".to_owned()
        )]
    );

    channel
        .publish(
            &Context::new(),
            &PublishMessage::new("orders", "created", "{}"),
        )
        .await
        .unwrap();
    let (sender, mut received) = mpsc::unbounded_channel();
    channel
        .consume(
            &ConsumerDefinition::new("orders-created"),
            Arc::new(AckingHandler { received: sender }),
        )
        .await
        .unwrap();
    let (info, _) = received.recv().await.unwrap();
    assert_eq!(info.exchange, "orders");
}

#[tokio::test]
async fn exhausted_retries_move_the_message_to_the_dlq() {
    let broker = FakeBroker::new();
    let channel = open_channel(&broker, test_config()).await;
    let queue = QueueDefinition::new("payments")
        .durable()
        .with_dlq()
        .with_retry(1_000, 2);

    channel
        .consume(
            &ConsumerDefinition::new("payments").retry_policy(&queue),
            Arc::new(UnsettledFailingHandler),
        )
        .await
        .unwrap();

    let first_attempt = PublishMessage::new("", "payments", "first");
    channel.publish(&Context::new(), &first_attempt).await.unwrap();
    assert!(eventually(|| broker.nacks().len() == 1).await);
    assert!(!broker.nacks()[0].1);
    assert!(broker.acks().is_empty());

    let last_attempt = PublishMessage::new("", "payments", "last").properties(retried(2));
    channel.publish(&Context::new(), &last_attempt).await.unwrap();
    assert!(eventually(|| broker.acks().len() == 1).await);

    let published = broker.published();
    let dead = published
        .iter()
        .find(|msg| msg.routing_key == "payments-dlq")
        .unwrap();
    assert_eq!(dead.exchange, "");
    assert_eq!(dead.body, b"last");
    assert!(dead
        .properties
        .headers()
        .as_ref()
        .is_some_and(|headers| headers.inner().contains_key(AMQP_HEADERS_X_DEATH)));
    assert_eq!(broker.nacks().len(), 1);
}
