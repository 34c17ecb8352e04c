// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel
//!
//! A [`Channel`] performs protocol operations over one protocol channel of
//! the shared [`Connection`]. Outbound requests are serialized by a
//! per-channel lock so at most one of them is in flight. Requests that wait
//! for a broker reply race the reply against the channel closing and against
//! the operation's timeout budget.
//!
//! A named channel survives reconnects from the publisher's point of view:
//! publishing on it while it is closed waits for the component to open its
//! replacement and publishes there.

use crate::{
    config::AmqpConfig,
    connection::Connection,
    consumer::{self, ConsumerDefinition, ConsumerHandler},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel::{
        self, Operation, OperationSpan, ANNOTATION_BODY, ANNOTATION_PROPERTIES, TAG_BROKER_URL,
        TAG_CHANNEL, TAG_CONSUMER_TAG, TAG_DELIVERY_TAG, TAG_EXCHANGE, TAG_QUEUE,
        TAG_ROUTING_KEY,
    },
    publisher::PublishMessage,
    queue::{QueueBinding, QueueDefinition},
    transport::{BrokerChannel, QueueDeclareOk},
};
use opentelemetry::{global::BoxedTracer, Context};
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Callback fired once when a channel closes without being asked to.
pub type ChannelCloseCallback = Box<dyn FnOnce(AmqpError) + Send>;

/// Finds the live channel registered under a name.
pub trait ChannelLookup: Send + Sync {
    fn channel(&self, name: &str) -> Option<Arc<Channel>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Channel {
    name: Option<String>,
    raw: Arc<dyn BrokerChannel>,
    connection: Arc<Connection>,
    lookup: Weak<dyn ChannelLookup>,
    config: Arc<AmqpConfig>,
    requests: tokio::sync::Mutex<()>,
    closed: watch::Sender<Option<AmqpError>>,
    on_close: Mutex<Option<ChannelCloseCallback>>,
    consumer_tag: Mutex<Option<String>>,
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,
    tracer: BoxedTracer,
}

impl Channel {
    /// Wraps an open protocol channel.
    ///
    /// A close initiated by the broker marks the channel closed.
    ///
    /// # Parameters
    /// * `name` - Name under which `lookup` finds the replacement after a reconnect
    /// * `raw` - The protocol channel, owned by this channel
    /// * `connection` - The connection the protocol channel belongs to
    /// * `config` - Timeout budgets and logging toggles
    /// * `lookup` - Registry of live channels, usually the component
    pub fn new(
        name: Option<String>,
        raw: Arc<dyn BrokerChannel>,
        connection: Arc<Connection>,
        config: Arc<AmqpConfig>,
        lookup: Weak<dyn ChannelLookup>,
    ) -> Arc<Channel> {
        let (closed, _) = watch::channel(None);

        Arc::new_cyclic(|this: &Weak<Channel>| {
            let this = this.clone();
            raw.on_error(Box::new(move |err| {
                if let Some(channel) = this.upgrade() {
                    channel.mark_closed(err);
                }
            }));

            Channel {
                name,
                raw,
                connection,
                lookup,
                config,
                requests: tokio::sync::Mutex::new(()),
                closed,
                on_close: Mutex::new(None),
                consumer_tag: Mutex::new(None),
                consumers: Mutex::new(HashMap::new()),
                tracer: otel::tracer(),
            }
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Protocol channel number.
    pub fn number(&self) -> u16 {
        self.raw.id()
    }

    pub fn is_open(&self) -> bool {
        self.closed.borrow().is_none() && self.raw.is_open()
    }

    /// Tag of the most recently registered consumer that is still active.
    pub fn consumer_tag(&self) -> Option<String> {
        lock(&self.consumer_tag).clone()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn config(&self) -> &AmqpConfig {
        &self.config
    }

    pub(crate) fn tracer(&self) -> &BoxedTracer {
        &self.tracer
    }

    pub(crate) fn masked_url(&self) -> &str {
        self.connection.masked_url()
    }

    /// Registers the callback fired when the channel closes unexpectedly.
    pub(crate) fn set_close_callback(&self, callback: ChannelCloseCallback) {
        *lock(&self.on_close) = Some(callback);
    }

    /// Error the channel was closed with, or a generic one if it is still open.
    pub fn closing_error(&self) -> AmqpError {
        self.closed.borrow().clone().unwrap_or_else(|| {
            AmqpError::ChannelClosed(format!("channel {} is closed", self.number()))
        })
    }

    /// Marks the channel closed with `err`.
    ///
    /// Only the first call has an effect: the error is stored, pending
    /// requests fail with it, consumers stop and the close callback fires.
    pub fn mark_closed(&self, err: AmqpError) {
        let first = self.closed.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(err.clone());
            true
        });
        if !first {
            return;
        }

        warn!(
            channel = self.number(),
            error = err.to_string(),
            "channel closed"
        );
        self.stop_consumers();

        let callback = lock(&self.on_close).take();
        if let Some(callback) = callback {
            callback(err);
        }
    }

    fn span(&self, operation: Operation) -> OperationSpan {
        let span = OperationSpan::start(&self.tracer, operation, &Context::current());
        span.tag(TAG_CHANNEL, i64::from(self.number()));
        span
    }

    /// Issues one request and waits for its reply.
    ///
    /// The request is issued only once the channel lock is held. The reply,
    /// the channel closing and the timeout are polled in that order, so a
    /// reply ready at the deadline wins and exactly one outcome is produced.
    async fn request<T, F>(
        &self,
        span: &OperationSpan,
        operation: Operation,
        timeout: Duration,
        request: F,
    ) -> Result<T, AmqpError>
    where
        F: Future<Output = Result<T, AmqpError>>,
    {
        let _serialized = self.requests.lock().await;

        let already_closed = self.closed.borrow().clone();
        if let Some(err) = already_closed {
            span.record::<T>(&Err(err.clone()));
            return Err(err);
        }

        let mut closed = self.closed.subscribe();
        let result = tokio::select! {
            biased;
            reply = request => reply,
            err = wait_closed(&mut closed) => Err(err),
            _ = tokio::time::sleep(timeout) => Err(AmqpError::Timeout { operation, timeout }),
        };

        if let Err(err) = &result {
            if !err.is_timeout() && !self.raw.is_open() {
                self.mark_closed(err.clone());
            }
        }

        span.record(&result);
        result
    }

    /// Declares an exchange.
    ///
    /// # Parameters
    /// * `def` - The exchange definition
    ///
    /// # Returns
    /// Ok(()) once the broker confirmed the declaration, or the broker
    /// rejection, the closing error or a timeout after `exchange_declare_timeout`
    pub async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let span = self.span(Operation::DeclareExchange);
        span.tag(TAG_EXCHANGE, def.name().to_owned());
        debug!(channel = self.number(), "creating exchange: {}", def.name());

        let result = self
            .request(
                &span,
                Operation::DeclareExchange,
                self.config.exchange_declare_timeout,
                self.raw.exchange_declare(def),
            )
            .await;

        match &result {
            Ok(()) => debug!("exchange: {} was created", def.name()),
            Err(err) => error!(
                error = err.to_string(),
                name = def.name(),
                "error to declare the exchange"
            ),
        }
        result
    }

    /// Declares a queue and returns the broker's reply.
    ///
    /// The reply carries the queue name, which the broker generates when the
    /// definition's name is empty.
    pub async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueDeclareOk, AmqpError> {
        let span = self.span(Operation::DeclareQueue);
        span.tag(TAG_QUEUE, def.name().to_owned());
        debug!(channel = self.number(), "creating queue: {}", def.name());

        let result = self
            .request(
                &span,
                Operation::DeclareQueue,
                self.config.queue_declare_timeout,
                self.raw
                    .queue_declare(def.name(), def.options(), def.arguments()),
            )
            .await;

        match &result {
            Ok(ok) => debug!("queue: {} was created", ok.queue),
            Err(err) => error!(
                error = err.to_string(),
                name = def.name(),
                "error to declare the queue"
            ),
        }
        result
    }

    /// Binds a queue to an exchange under `bind_timeout`.
    pub async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let span = self.span(Operation::Bind);
        span.tag(TAG_QUEUE, binding.queue_name().to_owned());
        span.tag(TAG_EXCHANGE, binding.exchange_name().to_owned());
        span.tag(TAG_ROUTING_KEY, binding.key().to_owned());
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name(),
            binding.exchange_name(),
            binding.key()
        );

        let result = self
            .request(
                &span,
                Operation::Bind,
                self.config.bind_timeout,
                self.raw.queue_bind(
                    binding.queue_name(),
                    binding.exchange_name(),
                    binding.key(),
                    binding.arguments(),
                ),
            )
            .await;

        if let Err(err) = &result {
            error!(error = err.to_string(), "error to bind queue to exchange");
        }
        result
    }

    /// Sets the prefetch window under `qos_timeout`.
    pub async fn qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), AmqpError> {
        let span = self.span(Operation::Qos);
        span.tag("amqp.prefetch_count", i64::from(prefetch_count));

        self.request(
            &span,
            Operation::Qos,
            self.config.qos_timeout(),
            self.raw.basic_qos(prefetch_size, prefetch_count, global),
        )
        .await
    }

    /// Publishes a message.
    ///
    /// No broker reply is awaited, but the whole call, waiting for the
    /// replacement of a closed named channel included, is bounded by
    /// `publish_timeout`.
    ///
    /// # Parameters
    /// * `ctx` - Parent context of the publish span
    /// * `msg` - The message
    ///
    /// # Returns
    /// Ok(()) once the message was handed to the broker, the stored closing
    /// error for a closed unnamed channel or for a named one the broker closed
    /// while the connection stayed up, or a timeout
    pub async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError> {
        let span = OperationSpan::start(&self.tracer, Operation::Publish, ctx);
        span.tag(TAG_CHANNEL, i64::from(self.number()));
        span.tag(TAG_EXCHANGE, msg.exchange().to_owned());
        span.tag(TAG_ROUTING_KEY, msg.routing_key().to_owned());
        span.tag(TAG_BROKER_URL, self.masked_url().to_owned());

        let budget = self.config.publish_timeout;
        let result = match tokio::time::timeout(budget, self.publish_or_relay(&span, msg)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    channel = self.number(),
                    exchange = msg.exchange(),
                    "publish timed out"
                );
                Err(AmqpError::Timeout {
                    operation: Operation::Publish,
                    timeout: budget,
                })
            }
        };

        span.record(&result);
        result
    }

    async fn publish_or_relay(
        &self,
        span: &OperationSpan,
        msg: &PublishMessage,
    ) -> Result<(), AmqpError> {
        if self.is_open() {
            return self.publish_now(span, msg).await;
        }

        let Some(name) = self.name.as_deref() else {
            return Err(self.closing_error());
        };

        debug!(
            channel = name,
            "channel closed, waiting for its replacement to publish"
        );
        loop {
            let replacement = self
                .lookup
                .upgrade()
                .and_then(|lookup| lookup.channel(name));

            if let Some(replacement) = replacement {
                if !std::ptr::eq(Arc::as_ptr(&replacement), self) {
                    if replacement.is_open() {
                        span.tag(TAG_CHANNEL, i64::from(replacement.number()));
                        return replacement.publish_now(span, msg).await;
                    }
                } else if self.connection.is_connected() {
                    // Closed while the connection stays up: no replacement is coming.
                    return Err(self.closing_error());
                }
            }

            tokio::time::sleep(self.config.republish_poll_interval).await;
        }
    }

    async fn publish_now(
        &self,
        span: &OperationSpan,
        msg: &PublishMessage,
    ) -> Result<(), AmqpError> {
        let trace_headers = if msg.propagate_trace {
            span.inject()
        } else {
            BTreeMap::new()
        };
        let properties = msg.outgoing_properties(trace_headers);

        if self.config.log_out_props {
            span.annotate(
                ANNOTATION_PROPERTIES,
                otel::properties_to_json(&properties).to_string(),
            );
        }
        if self.config.log_out_body {
            span.annotate(ANNOTATION_BODY, otel::body_to_text(msg.body()));
        }

        let result = {
            let _serialized = self.requests.lock().await;
            self.raw
                .basic_publish(
                    msg.exchange(),
                    msg.routing_key(),
                    msg.body(),
                    properties,
                    msg.mandatory,
                )
                .await
        };

        if let Err(err) = &result {
            error!(error = err.to_string(), "error publishing message");
            if !self.raw.is_open() {
                self.mark_closed(err.clone());
            }
        }
        result
    }

    /// Registers a consumer and starts dispatching its deliveries to `handler`.
    ///
    /// # Returns
    /// The consumer tag, generated when the definition has none
    pub async fn consume(
        self: &Arc<Self>,
        def: &ConsumerDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String, AmqpError> {
        let consumer_tag = def
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("ctag-{}", Uuid::new_v4()));

        let span = self.span(Operation::Consume);
        span.tag(TAG_QUEUE, def.queue().to_owned());
        span.tag(TAG_CONSUMER_TAG, consumer_tag.clone());
        span.tag(TAG_BROKER_URL, self.masked_url().to_owned());

        let deliveries = self
            .request(
                &span,
                Operation::Consume,
                self.config.consume_timeout(),
                self.raw.basic_consume(
                    def.queue(),
                    &consumer_tag,
                    def.options(),
                    def.arguments(),
                ),
            )
            .await
            .inspect_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
            })?;

        let task = tokio::spawn(consumer::run(
            Arc::downgrade(self),
            consumer_tag.clone(),
            deliveries,
            handler,
            def.failure_policy(),
        ));

        if let Some(previous) = lock(&self.consumers).insert(consumer_tag.clone(), task) {
            previous.abort();
        }
        *lock(&self.consumer_tag) = Some(consumer_tag.clone());

        debug!(channel = self.number(), consumer_tag, "consumer registered");
        Ok(consumer_tag)
    }

    /// Acknowledges a delivery. No broker reply is awaited.
    pub async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        let span = self.span(Operation::Ack);
        span.tag(TAG_DELIVERY_TAG, delivery_tag as i64);

        let result = {
            let _serialized = self.requests.lock().await;
            self.raw.basic_ack(delivery_tag, multiple).await
        };

        if let Err(err) = &result {
            error!(error = err.to_string(), "error whiling ack msg");
        }
        span.record(&result);
        result
    }

    /// Rejects a delivery. No broker reply is awaited.
    pub async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let span = self.span(Operation::Nack);
        span.tag(TAG_DELIVERY_TAG, delivery_tag as i64);

        let result = {
            let _serialized = self.requests.lock().await;
            self.raw.basic_nack(delivery_tag, multiple, requeue).await
        };

        if let Err(err) = &result {
            error!(error = err.to_string(), "error whiling nack msg");
        }
        span.record(&result);
        result
    }

    /// Cancels a consumer, the active one when `consumer_tag` is `None`.
    pub async fn cancel(&self, consumer_tag: Option<&str>) -> Result<(), AmqpError> {
        let span = self.span(Operation::Cancel);

        let tag = match consumer_tag.map(str::to_owned).or_else(|| self.consumer_tag()) {
            Some(tag) => tag,
            None => {
                let result = Err(AmqpError::InvalidState(format!(
                    "channel {} has no active consumer",
                    self.number()
                )));
                span.record(&result);
                return result;
            }
        };
        span.tag(TAG_CONSUMER_TAG, tag.clone());

        self.request(
            &span,
            Operation::Cancel,
            self.config.cancel_timeout(),
            self.raw.basic_cancel(&tag),
        )
        .await?;

        if let Some(task) = lock(&self.consumers).remove(&tag) {
            task.abort();
        }
        let mut active = lock(&self.consumer_tag);
        if active.as_deref() == Some(tag.as_str()) {
            *active = None;
        }

        debug!(channel = self.number(), consumer_tag = tag, "consumer cancelled");
        Ok(())
    }

    /// Closes the channel on request of the application.
    ///
    /// The close callback does not fire.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let span = self.span(Operation::ChannelClose);

        lock(&self.on_close).take();
        self.mark_closed(AmqpError::ChannelClosed(format!(
            "channel {} closed by the application",
            self.number()
        )));

        let result = if self.raw.is_open() {
            let budget = self.config.channel_open_timeout;
            match tokio::time::timeout(budget, self.raw.close()).await {
                Ok(Err(err)) if err.is_closed() => Ok(()),
                Ok(result) => result,
                Err(_) => Err(AmqpError::Timeout {
                    operation: Operation::ChannelClose,
                    timeout: budget,
                }),
            }
        } else {
            Ok(())
        };

        span.record(&result);
        result
    }

    fn stop_consumers(&self) {
        for (_, task) in lock(&self.consumers).drain() {
            task.abort();
        }
        lock(&self.consumer_tag).take();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.stop_consumers();
    }
}

async fn wait_closed(closed: &mut watch::Receiver<Option<AmqpError>>) -> AmqpError {
    match closed.wait_for(|state| state.is_some()).await {
        Ok(state) => state.clone().unwrap_or(AmqpError::InternalError),
        Err(_) => AmqpError::ChannelClosed("channel dropped".to_owned()),
    }
}
