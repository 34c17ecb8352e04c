// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! [`Connection`] owns the single network connection to the broker. Connect
//! and close are serialized: only one of them is in flight at a time. An
//! unexpected closure reported by the broker invokes the callback registered
//! with [`Connection::connect`] exactly once; recovering from it is up to the
//! caller.

use crate::{
    config::AmqpConfig,
    errors::AmqpError,
    otel::{self, Operation, OperationSpan, TAG_BROKER_URL, TAG_CHANNEL},
    transport::{BrokerChannel, BrokerConnection, Connector},
};
use opentelemetry::{global::BoxedTracer, Context};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, warn};

/// Callback invoked with the connection and the error after an unexpected closure.
pub type OnClose = Box<dyn FnOnce(Arc<Connection>, AmqpError) + Send>;

/// Lifecycle states of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    Connecting,
    Connected,
    Closing,
    Closed,
}

pub struct Connection {
    config: Arc<AmqpConfig>,
    connector: Arc<dyn Connector>,
    masked_url: String,
    state: Mutex<ConnectionState>,
    handle: Mutex<Option<Arc<dyn BrokerConnection>>>,
    on_close: Mutex<Option<OnClose>>,
    operation: tokio::sync::Mutex<()>,
    tracer: BoxedTracer,
    me: Weak<Connection>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    pub fn new(config: Arc<AmqpConfig>, connector: Arc<dyn Connector>) -> Arc<Connection> {
        let masked_url = otel::mask_url(&config.url);

        Arc::new_cyclic(|me| Connection {
            config,
            connector,
            masked_url,
            state: Mutex::new(ConnectionState::None),
            handle: Mutex::new(None),
            on_close: Mutex::new(None),
            operation: tokio::sync::Mutex::new(()),
            tracer: otel::tracer(),
            me: me.clone(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
            && lock(&self.handle)
                .as_ref()
                .is_some_and(|handle| handle.is_connected())
    }

    /// Broker URL with the password redacted.
    pub fn masked_url(&self) -> &str {
        &self.masked_url
    }

    /// Opens the connection to the broker.
    ///
    /// # Parameters
    /// * `on_close` - Invoked if the broker later closes the connection unexpectedly
    ///
    /// # Returns
    /// `InvalidState` while connecting or connected, `Timeout` once
    /// `connect_timeout` elapsed, or the transport error. The state is
    /// `Closed` after any failure.
    pub async fn connect(&self, on_close: OnClose) -> Result<(), AmqpError> {
        let _operation = self.operation.lock().await;

        {
            let mut state = lock(&self.state);
            if matches!(
                *state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return Err(AmqpError::InvalidState(format!(
                    "connection is {:?}",
                    *state
                )));
            }
            *state = ConnectionState::Connecting;
        }

        let span = OperationSpan::start(&self.tracer, Operation::Connect, &Context::current());
        span.tag(TAG_BROKER_URL, self.masked_url.clone());
        debug!(url = self.masked_url, "creating amqp connection...");

        let budget = self.config.connect_timeout;
        let result = match tokio::time::timeout(
            budget,
            self.connector
                .connect(&self.config.url, &self.config.connection_name),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AmqpError::Timeout {
                operation: Operation::Connect,
                timeout: budget,
            }),
        };
        span.record(&result);

        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                *lock(&self.state) = ConnectionState::Closed;
                return Err(err);
            }
        };

        *lock(&self.on_close) = Some(on_close);
        *lock(&self.handle) = Some(handle.clone());
        *lock(&self.state) = ConnectionState::Connected;

        let me = self.me.clone();
        handle.on_error(Box::new(move |err| {
            if let Some(connection) = me.upgrade() {
                connection.closed_by_broker(err);
            }
        }));

        debug!("amqp connected");
        Ok(())
    }

    fn closed_by_broker(self: Arc<Self>, err: AmqpError) {
        *lock(&self.state) = ConnectionState::Closed;
        lock(&self.handle).take();

        let callback = lock(&self.on_close).take();
        match callback {
            Some(callback) => {
                warn!(error = err.to_string(), "connection closed by the broker");
                callback(self, err);
            }
            None => debug!(error = err.to_string(), "connection error after close"),
        }
    }

    /// Closes the connection.
    ///
    /// Closing a connection that was never opened, is already closed, or was
    /// dropped by the broker returns `Ok`. The close callback is discarded
    /// first, so an explicit close never reports an unexpected closure.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let _operation = self.operation.lock().await;

        {
            let mut state = lock(&self.state);
            if matches!(*state, ConnectionState::None | ConnectionState::Closed) {
                *state = ConnectionState::Closed;
                return Ok(());
            }
            *state = ConnectionState::Closing;
        }
        lock(&self.on_close).take();

        let Some(handle) = lock(&self.handle).take() else {
            *lock(&self.state) = ConnectionState::Closed;
            return Ok(());
        };

        if !handle.is_connected() {
            debug!("broker already closed the connection");
            *lock(&self.state) = ConnectionState::Closed;
            return Ok(());
        }

        let span = OperationSpan::start(&self.tracer, Operation::Close, &Context::current());
        span.tag(TAG_BROKER_URL, self.masked_url.clone());

        let budget = self.config.connect_timeout;
        let result = match tokio::time::timeout(budget, handle.close()).await {
            Ok(Err(err)) if err.is_closed() => {
                debug!(error = err.to_string(), "connection already gone");
                Ok(())
            }
            Ok(result) => result,
            Err(_) => Err(AmqpError::Timeout {
                operation: Operation::Close,
                timeout: budget,
            }),
        };
        span.record(&result);

        *lock(&self.state) = ConnectionState::Closed;
        debug!("amqp connection closed");
        result
    }

    /// Opens a protocol channel under `channel_open_timeout`.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let handle = match (self.state(), lock(&self.handle).clone()) {
            (ConnectionState::Connected, Some(handle)) => handle,
            (state, _) => {
                return Err(AmqpError::ConnectionClosed(format!(
                    "cannot open a channel, connection is {state:?}"
                )))
            }
        };

        let span = OperationSpan::start(&self.tracer, Operation::ChannelOpen, &Context::current());
        span.tag(TAG_BROKER_URL, self.masked_url.clone());
        debug!("creating amqp channel...");

        let budget = self.config.channel_open_timeout;
        let result = match tokio::time::timeout(budget, handle.create_channel()).await {
            Ok(result) => result,
            Err(_) => Err(AmqpError::Timeout {
                operation: Operation::ChannelOpen,
                timeout: budget,
            }),
        };
        span.record(&result);

        match result {
            Ok(channel) => {
                span.tag(TAG_CHANNEL, i64::from(channel.id()));
                debug!(channel = channel.id(), "channel created");
                Ok(channel)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(err)
            }
        }
    }
}
