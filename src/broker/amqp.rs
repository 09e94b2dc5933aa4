//! RabbitMQ transport over lapin

use super::{Acknowledge, Delivery, OutboundMessage, QueueOptions, Subscription, Transport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    ConfirmSelectOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// AMQP persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Broker connection parameters
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl BrokerConfig {
    /// AMQP URI for this configuration
    pub fn uri(&self) -> String {
        let vhost = if self.vhost.is_empty() || self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
        }
    }
}

/// Current link, re-established on demand once it goes down
struct LinkSlot<T> {
    current: RwLock<Option<T>>,
    closed: AtomicBool,
}

impl<T: Clone> LinkSlot<T> {
    fn new(initial: T) -> Self {
        Self {
            current: RwLock::new(Some(initial)),
            closed: AtomicBool::new(false),
        }
    }

    /// Healthy current link, or a fresh one from `connect`
    async fn get<H, C, Fut>(&self, healthy: H, connect: C) -> Result<T>
    where
        H: Fn(&T) -> bool,
        C: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("broker transport closed".to_string()));
        }
        if let Some(link) = self.current.read().await.as_ref() {
            if healthy(link) {
                return Ok(link.clone());
            }
        }

        let mut current = self.current.write().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("broker transport closed".to_string()));
        }
        // another caller may have reconnected while we waited
        if let Some(link) = current.as_ref() {
            if healthy(link) {
                return Ok(link.clone());
            }
            tracing::warn!("Broker link down, reconnecting");
        }
        *current = None;

        let link = connect().await?;
        *current = Some(link.clone());
        Ok(link)
    }

    /// Take the link and refuse to reconnect afterwards
    async fn shut(&self) -> Option<T> {
        self.closed.store(true, Ordering::SeqCst);
        self.current.write().await.take()
    }
}

/// One connection and its shared channel
#[derive(Clone)]
struct AmqpLink {
    connection: Arc<Connection>,
    channel: Channel,
}

impl AmqpLink {
    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// Explicitly constructed broker handle: one connection, one shared channel,
/// reopened on the next operation after the broker drops it
pub struct AmqpTransport {
    config: BrokerConfig,
    link: LinkSlot<AmqpLink>,
}

impl AmqpTransport {
    /// Connect to the broker and open the shared channel
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let link = open_link(config).await?;
        Ok(Self {
            config: config.clone(),
            link: LinkSlot::new(link),
        })
    }

    async fn channel(&self) -> Result<Channel> {
        let link = self
            .link
            .get(AmqpLink::is_connected, || open_link(&self.config))
            .await?;
        Ok(link.channel)
    }
}

async fn open_link(config: &BrokerConfig) -> Result<AmqpLink> {
    let connection = Connection::connect(&config.uri(), ConnectionProperties::default())
        .await
        .map_err(|e| {
            Error::Transport(format!(
                "cannot connect to {}:{}: {}",
                config.host, config.port, e
            ))
        })?;
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        vhost = %config.vhost,
        "Broker connected"
    );

    Ok(AmqpLink {
        connection: Arc::new(connection),
        channel,
    })
}

/// Publisher confirm outcome for a message sent to `queue`
fn check_confirmation(queue: &str, confirmation: &Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(Error::Transport(format!(
            "broker rejected message for {}",
            queue
        ))),
        Confirmation::NotRequested => Err(Error::Transport(format!(
            "no publisher confirm for {}: confirms not enabled on channel",
            queue
        ))),
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let reply_to = delivery
        .properties
        .reply_to()
        .as_ref()
        .map(|s| s.as_str().to_string());
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|s| s.as_str().to_string());

    Delivery::new(
        delivery.data,
        reply_to,
        correlation_id,
        Some(Box::new(AmqpAcker(delivery.acker))),
    )
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.channel()
            .await?
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if message.persistent {
            properties = properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }
        if let Some(reply_to) = message.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }
        if let Some(correlation_id) = message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }

        let confirmation = self
            .channel()
            .await?
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;
        check_confirmation(queue, &confirmation)
    }

    async fn consume(&self, queue: &str) -> Result<Subscription> {
        let consumer_tag = format!("ctag-{}", Uuid::new_v4());
        let consumer = self
            .channel()
            .await?
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let stream = consumer
            .map(|item| item.map(into_delivery).map_err(Error::from))
            .boxed();

        Ok(Subscription {
            consumer_tag,
            stream,
        })
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()> {
        self.channel()
            .await?
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.channel()
            .await?
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(link) = self.link.shut().await {
            if link.connection.status().connected() {
                link.connection.close(200, "shutdown").await?;
            }
        }
        tracing::info!("Broker connection closed");
        Ok(())
    }
}
