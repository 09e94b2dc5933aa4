//! Broker - Transport Adapter
//!
//! ## Responsibilities
//!
//! - Queue declaration (durable request queues, ephemeral reply queues)
//! - Durable publish with routing by logical queue name
//! - At-least-once consumption with explicit ack
//!
//! Two implementations share the [`Transport`] seam: [`AmqpTransport`] for
//! RabbitMQ and [`MemoryTransport`] for in-process use in tests.

mod amqp;
mod memory;

pub use amqp::{AmqpTransport, BrokerConfig};
pub use memory::MemoryTransport;

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Queue declaration flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Request queues: survive broker restarts
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }

    /// Reply channels: non-durable, removed once their consumer goes away
    pub fn ephemeral() -> Self {
        Self {
            durable: false,
            auto_delete: true,
        }
    }
}

/// Message to publish
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub persistent: bool,
}

impl OutboundMessage {
    /// Persistent JSON message without reply metadata
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            reply_to: None,
            correlation_id: None,
            persistent: true,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Acknowledgement handle carried by a delivery
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// Message received from a queue
pub struct Delivery {
    pub body: Vec<u8>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    acker: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        reply_to: Option<String>,
        correlation_id: Option<String>,
        acker: Option<Box<dyn Acknowledge>>,
    ) -> Self {
        Self {
            body,
            reply_to,
            correlation_id,
            acker,
        }
    }

    /// Acknowledge the delivery (no-op for transports without acks)
    pub async fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("reply_to", &self.reply_to)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

/// Active consumer on a queue
pub struct Subscription {
    pub consumer_tag: String,
    pub stream: BoxStream<'static, Result<Delivery>>,
}

/// Broker seam used by the correlation layer and the RPC client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declare a queue (idempotent for identical options)
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// Publish to the queue named `queue` via the default exchange
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()>;

    /// Start consuming from `queue`
    async fn consume(&self, queue: &str) -> Result<Subscription>;

    /// Cancel a consumer started by [`Transport::consume`]
    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()>;

    /// Delete a queue; deleting a missing queue is not an error
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Close the underlying connection
    async fn close(&self) -> Result<()>;
}
