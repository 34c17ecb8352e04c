// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Component
//!
//! Asynchronous AMQP 0-9-1 client layer: a managed broker connection, serialized
//! and timed channel operations, OpenTelemetry spans around every protocol
//! operation, and a component that connects, prepares and reconnects the
//! channels an application declares.

pub mod channel;
pub mod component;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod logging;
pub mod otel;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod transport;

pub use channel::Channel;
pub use component::{AmqpComponent, ChannelFactory, ChannelHandler, ComponentHealth};
pub use config::AmqpConfig;
pub use connection::{Connection, ConnectionState};
pub use consumer::{ConsumerDefinition, ConsumerHandler, DeliverInfo};
pub use errors::AmqpError;
pub use publisher::PublishMessage;
