// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Component
//!
//! [`AmqpComponent`] owns the lifecycle of one broker connection and the
//! channels the application declares through [`ChannelFactory`] values.
//!
//! The first connection, made by [`AmqpComponent::prepare`], gives up after
//! `connect_max_attempts`. Once connected, a connection lost to the broker is
//! re-established without an attempt limit: the channels are reopened and
//! prepared again, and started again when the component was started.

use crate::{
    channel::{Channel, ChannelLookup},
    config::AmqpConfig,
    connection::{Connection, OnClose},
    errors::AmqpError,
    transport::{Connector, LapinConnector},
};
use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, Weak,
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Produces the application logic of one channel.
///
/// `build` is called every time the channel is opened, on the first
/// connection and after each reconnect.
pub trait ChannelFactory: Send + Sync {
    /// Name used to find the live channel, see [`AmqpComponent::channel`].
    fn name(&self) -> Option<String> {
        None
    }

    fn build(&self) -> Arc<dyn ChannelHandler>;
}

/// Lifecycle hooks of the application logic bound to one channel.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Runs right after the channel is opened, before any `prepare`.
    async fn init(&self, _channel: &Arc<Channel>) -> Result<(), AmqpError> {
        Ok(())
    }

    /// Declares what the channel needs. Runs concurrently with the
    /// `prepare` of every other channel.
    async fn prepare(&self, _channel: &Arc<Channel>) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn start(&self, _channel: &Arc<Channel>) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn stop(&self, _channel: &Arc<Channel>) -> Result<(), AmqpError> {
        Ok(())
    }

    /// The channel closed without being asked to.
    async fn on_close(&self, _channel: &Arc<Channel>, _err: &AmqpError) {}

    async fn health(&self, _channel: &Arc<Channel>) -> bool {
        true
    }
}

/// Health of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelHealth {
    pub name: Option<String>,
    pub number: u16,
    pub open: bool,
    pub healthy: bool,
    pub consumer_tag: Option<String>,
}

/// Health of the component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub connected: bool,
    pub started: bool,
    pub channels: Vec<ChannelHealth>,
}

impl ComponentHealth {
    pub fn is_healthy(&self) -> bool {
        self.connected && self.channels.iter().all(|channel| channel.healthy)
    }
}

#[derive(Clone)]
struct ActiveChannel {
    channel: Arc<Channel>,
    handler: Arc<dyn ChannelHandler>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn first_error(results: Vec<Result<(), AmqpError>>) -> Result<(), AmqpError> {
    results.into_iter().collect()
}

pub struct AmqpComponent {
    config: Arc<AmqpConfig>,
    connector: Arc<dyn Connector>,
    factories: Vec<Arc<dyn ChannelFactory>>,
    connection: Mutex<Option<Arc<Connection>>>,
    channels: Mutex<Vec<ActiveChannel>>,
    connecting: tokio::sync::Mutex<()>,
    started: AtomicBool,
    stopped: AtomicBool,
    me: Weak<AmqpComponent>,
}

impl AmqpComponent {
    /// Creates a component connecting through `lapin`.
    pub fn new(
        config: AmqpConfig,
        factories: Vec<Arc<dyn ChannelFactory>>,
    ) -> Result<Arc<AmqpComponent>, AmqpError> {
        AmqpComponent::with_connector(config, Arc::new(LapinConnector), factories)
    }

    /// Creates a component connecting through `connector`.
    pub fn with_connector(
        config: AmqpConfig,
        connector: Arc<dyn Connector>,
        factories: Vec<Arc<dyn ChannelFactory>>,
    ) -> Result<Arc<AmqpComponent>, AmqpError> {
        config
            .validate()
            .map_err(|err| AmqpError::ConfigError(err.to_string()))?;

        Ok(Arc::new_cyclic(|me| AmqpComponent {
            config: Arc::new(config),
            connector,
            factories,
            connection: Mutex::new(None),
            channels: Mutex::new(vec![]),
            connecting: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            me: me.clone(),
        }))
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    /// The current connection, if any attempt was made.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        lock(&self.connection).clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Live channels in factory order.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        lock(&self.channels)
            .iter()
            .map(|active| active.channel.clone())
            .collect()
    }

    /// Connects to the broker and prepares every channel.
    ///
    /// # Returns
    /// `PrepareFailed` once `connect_max_attempts` attempts failed
    pub async fn prepare(&self) -> Result<(), AmqpError> {
        let _connecting = self.connecting.lock().await;
        self.connect(self.config.connect_max_attempts).await
    }

    /// Runs the connect loop. The caller holds the `connecting` lock.
    async fn connect(&self, max_attempts: Option<u32>) -> Result<(), AmqpError> {
        let mut attempt: u32 = 0;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(AmqpError::Stopped);
            }
            attempt = attempt.saturating_add(1);

            match self.connect_once().await {
                Ok(()) => break,
                Err(err) => {
                    warn!(
                        attempt,
                        error = err.to_string(),
                        "failure to connect to the broker"
                    );

                    if max_attempts.is_some_and(|max| attempt >= max) {
                        error!(attempt, "giving up connecting to the broker");
                        return Err(AmqpError::PrepareFailed {
                            attempts: attempt,
                            reason: err.to_string(),
                        });
                    }

                    tokio::time::sleep(self.config.retry_delay(attempt)).await;
                }
            }
        }

        if self.stopped.load(Ordering::SeqCst) {
            self.shutdown_connection().await;
            return Err(AmqpError::Stopped);
        }

        info!(attempt, "amqp component connected");

        if self.is_started() {
            debug!("restarting channels after reconnect");
            self.start_channels().await?;
        }

        Ok(())
    }

    async fn connect_once(&self) -> Result<(), AmqpError> {
        let previous = lock(&self.connection).take();
        if let Some(previous) = previous {
            if let Err(err) = previous.close().await {
                debug!(error = err.to_string(), "failure to close the previous connection");
            }
        }

        let connection = Connection::new(self.config.clone(), self.connector.clone());
        *lock(&self.connection) = Some(connection.clone());

        let runtime = Handle::try_current().map_err(|_| AmqpError::InternalError)?;
        let me = self.me.clone();
        let on_close: OnClose = Box::new(move |connection, err| {
            if let Some(component) = me.upgrade() {
                runtime.spawn(component.on_disconnect(connection, err));
            }
        });

        let opened = match connection.connect(on_close).await {
            Ok(()) => self.open_channels(&connection).await,
            Err(err) => Err(err),
        };

        match opened {
            Ok(channels) => {
                *lock(&self.channels) = channels;
                Ok(())
            }
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(
                        error = close_err.to_string(),
                        "failure to close the half-open connection"
                    );
                }
                Err(err)
            }
        }
    }

    /// Opens and prepares one channel per factory.
    ///
    /// Nothing is published to the component until every `prepare` succeeded.
    async fn open_channels(
        &self,
        connection: &Arc<Connection>,
    ) -> Result<Vec<ActiveChannel>, AmqpError> {
        let runtime = Handle::try_current().map_err(|_| AmqpError::InternalError)?;
        let mut opened = Vec::with_capacity(self.factories.len());

        for factory in &self.factories {
            let raw = connection.open_channel().await?;
            let lookup: Weak<dyn ChannelLookup> = self.me.clone();
            let channel = Channel::new(
                factory.name(),
                raw,
                connection.clone(),
                self.config.clone(),
                lookup,
            );
            let handler = factory.build();

            let weak_channel = Arc::downgrade(&channel);
            let close_handler = handler.clone();
            let handle = runtime.clone();
            channel.set_close_callback(Box::new(move |err| {
                if let Some(channel) = weak_channel.upgrade() {
                    handle.spawn(async move {
                        close_handler.on_close(&channel, &err).await;
                    });
                }
            }));

            handler.init(&channel).await?;
            opened.push(ActiveChannel { channel, handler });
        }

        let prepared = join_all(
            opened
                .iter()
                .map(|active| active.handler.prepare(&active.channel)),
        )
        .await;
        first_error(prepared)?;

        debug!(channels = opened.len(), "channels prepared");
        Ok(opened)
    }

    /// Reacts to the broker closing `connection`.
    ///
    /// Boxed because the reconnect it runs registers this handler again.
    fn on_disconnect(
        self: Arc<Self>,
        connection: Arc<Connection>,
        err: AmqpError,
    ) -> BoxFuture<'static, ()> {
        async move {
            let _connecting = self.connecting.lock().await;

            let current = lock(&self.connection).clone();
            if !current.is_some_and(|current| Arc::ptr_eq(&current, &connection)) {
                debug!("ignoring the closure of a replaced connection");
                return;
            }

            warn!(error = err.to_string(), "connection lost, reconnecting");

            let channels = std::mem::take(&mut *lock(&self.channels));
            for active in &channels {
                active.channel.mark_closed(err.clone());
            }
            drop(channels);

            if self.stopped.load(Ordering::SeqCst) {
                return;
            }

            if let Err(err) = self.connect(None).await {
                error!(error = err.to_string(), "reconnect aborted");
            }
        }
        .boxed()
    }

    /// Starts every channel concurrently.
    pub async fn start(&self) -> Result<(), AmqpError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AmqpError::Stopped);
        }

        self.started.store(true, Ordering::SeqCst);
        self.start_channels().await
    }

    async fn start_channels(&self) -> Result<(), AmqpError> {
        let channels = lock(&self.channels).clone();

        let started = join_all(
            channels
                .iter()
                .map(|active| active.handler.start(&active.channel)),
        )
        .await;
        first_error(started)
    }

    /// Stops every channel concurrently, then closes the channels and the
    /// connection. The component does not reconnect afterwards.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);

        let channels = std::mem::take(&mut *lock(&self.channels));

        let stopped = join_all(
            channels
                .iter()
                .map(|active| active.handler.stop(&active.channel)),
        )
        .await;

        for result in join_all(channels.iter().map(|active| active.channel.close())).await {
            if let Err(err) = result {
                debug!(error = err.to_string(), "failure to close a channel");
            }
        }

        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            connection.close().await?;
        }

        info!("amqp component stopped");
        first_error(stopped)
    }

    async fn shutdown_connection(&self) {
        let channels = std::mem::take(&mut *lock(&self.channels));
        drop(channels);

        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                debug!(error = err.to_string(), "failure to close the connection");
            }
        }
    }

    /// Looks up the live channel named `name`.
    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        lock(&self.channels)
            .iter()
            .find(|active| active.channel.name() == Some(name))
            .map(|active| active.channel.clone())
    }

    pub async fn health(&self) -> ComponentHealth {
        let channels = lock(&self.channels).clone();
        let connected = self
            .connection()
            .is_some_and(|connection| connection.is_connected());

        let reports = join_all(channels.iter().map(|active| async move {
            let open = active.channel.is_open();
            let healthy = open && active.handler.health(&active.channel).await;

            ChannelHealth {
                name: active.channel.name().map(str::to_owned),
                number: active.channel.number(),
                open,
                healthy,
                consumer_tag: active.channel.consumer_tag(),
            }
        }))
        .await;

        ComponentHealth {
            connected,
            started: self.is_started(),
            channels: reports,
        }
    }
}

impl ChannelLookup for AmqpComponent {
    fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        AmqpComponent::channel(self, name)
    }
}
