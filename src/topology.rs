// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares exchanges, queues and the bindings between them through a
//! [`Channel`], so every step is instrumented, timed and serialized like any
//! other channel operation. Queues configured with a retry queue or a DLQ get
//! those declared first.

use crate::{
    channel::Channel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares everything on the broker.
    async fn install(&self) -> Result<(), AmqpError>;
}

pub struct AmqpTopology {
    channel: Arc<Channel>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<Channel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Every queue to declare, in declaration order: a queue's retry queue
    /// and DLQ precede it.
    pub(crate) fn queue_plan(&self) -> Vec<QueueDefinition> {
        let mut plan = vec![];

        for def in &self.queues {
            plan.extend(def.retry_definition());
            plan.extend(def.dlq_definition());
            plan.push(def.clone());
        }

        plan
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue, replacing an earlier definition with the same name.
    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|queue| queue.name() != def.name());
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology.
    ///
    /// Exchanges are declared first, then queues, then bindings. The first
    /// failure aborts the installation.
    async fn install(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.channel.exchange_declare(exch).await?;
        }

        for def in self.queue_plan() {
            self.channel.queue_declare(&def).await?;
        }

        for binding in &self.queues_binding {
            self.channel.queue_bind(binding).await?;
        }

        debug!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.queues_binding.len(),
            "topology installed"
        );
        Ok(())
    }
}
