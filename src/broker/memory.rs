//! In-process transport
//!
//! Mirrors the broker semantics the scanner relies on: the default exchange
//! drops messages for undeclared queues, auto-delete queues disappear when
//! their consumer is cancelled. One consumer per queue.

use super::{Delivery, OutboundMessage, QueueOptions, Subscription, Transport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct MemoryQueue {
    options: QueueOptions,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Option<mpsc::UnboundedReceiver<Delivery>>,
    consumer_tag: Option<String>,
}

/// In-memory broker
#[derive(Default)]
pub struct MemoryTransport {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    fail_declares: AtomicBool,
    next_tag: AtomicU64,
    published: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, MemoryQueue>> {
        // A poisoned map is still structurally valid
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent declare fail (broker unreachable)
    pub fn set_fail_declares(&self, fail: bool) {
        self.fail_declares.store(fail, Ordering::SeqCst);
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.queues().contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of active consumers on `name` (0 or 1)
    pub fn consumer_count(&self, name: &str) -> usize {
        self.queues()
            .get(name)
            .map(|q| usize::from(q.consumer_tag.is_some()))
            .unwrap_or(0)
    }

    /// Total consumers across all queues
    pub fn total_consumers(&self) -> usize {
        self.queues()
            .values()
            .filter(|q| q.consumer_tag.is_some())
            .count()
    }

    /// Messages accepted by [`Transport::publish`] (including dropped ones)
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Run a fake peer on `queue`: every request body is handed to `handler`,
    /// and a `Some` result is published to the request's `reply_to`.
    /// Each request is served on its own task, so replies may complete out of order.
    pub async fn spawn_responder<F, Fut>(
        self: &Arc<Self>,
        queue: &str,
        handler: F,
    ) -> Result<JoinHandle<()>>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<serde_json::Value>> + Send + 'static,
    {
        self.declare_queue(queue, QueueOptions::durable()).await?;
        let mut subscription = self.consume(queue).await?;
        let transport = Arc::clone(self);
        let handler = Arc::new(handler);
        let queue = queue.to_string();

        Ok(tokio::spawn(async move {
            while let Some(Ok(delivery)) = subscription.stream.next().await {
                let _ = delivery.ack().await;
                let request: serde_json::Value = match serde_json::from_slice(&delivery.body) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "Responder got non-JSON body");
                        continue;
                    }
                };
                let Some(reply_to) = delivery.reply_to.clone() else {
                    continue;
                };
                let correlation_id = delivery.correlation_id.clone();
                let transport = Arc::clone(&transport);
                let handler = Arc::clone(&handler);

                tokio::spawn(async move {
                    if let Some(reply) = (*handler)(request).await {
                        let mut msg = OutboundMessage::new(reply.to_string().into_bytes());
                        msg.correlation_id = correlation_id;
                        let _ = transport.publish(&reply_to, msg).await;
                    }
                });
            }
        }))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        if self.fail_declares.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("cannot declare queue {}: broker unreachable", name)));
        }

        let mut queues = self.queues();
        if let Some(existing) = queues.get(name) {
            if existing.options != options {
                return Err(Error::Transport(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue {}",
                    name
                )));
            }
            return Ok(());
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        queues.insert(
            name.to_string(),
            MemoryQueue {
                options,
                sender,
                receiver: Some(receiver),
                consumer_tag: None,
            },
        );
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        self.published.fetch_add(1, Ordering::SeqCst);

        let queues = self.queues();
        match queues.get(queue) {
            Some(q) => {
                let delivery =
                    Delivery::new(message.body, message.reply_to, message.correlation_id, None);
                if q.sender.send(delivery).is_err() {
                    tracing::debug!(queue = %queue, "Consumer gone, message dropped");
                }
            }
            None => {
                tracing::debug!(queue = %queue, "No such queue, message dropped");
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Subscription> {
        let mut queues = self.queues();
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| Error::Transport(format!("NOT_FOUND - no queue '{}'", queue)))?;
        let receiver = q
            .receiver
            .take()
            .ok_or_else(|| Error::Transport(format!("queue '{}' already has a consumer", queue)))?;

        let consumer_tag = format!("mem-ctag-{}", self.next_tag.fetch_add(1, Ordering::SeqCst));
        q.consumer_tag = Some(consumer_tag.clone());

        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|d| (Ok(d), rx))
        })
        .boxed();

        Ok(Subscription {
            consumer_tag,
            stream,
        })
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()> {
        let mut queues = self.queues();
        let found = queues
            .iter()
            .find(|(_, q)| q.consumer_tag.as_deref() == Some(consumer_tag))
            .map(|(name, q)| (name.clone(), q.options.auto_delete));

        if let Some((name, auto_delete)) = found {
            if auto_delete {
                queues.remove(&name);
            } else if let Some(q) = queues.get_mut(&name) {
                q.consumer_tag = None;
            }
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.queues().remove(name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.queues().clear();
        Ok(())
    }
}
