//! CorrelationManager - Ephemeral Reply Channels
//!
//! ## Responsibilities
//!
//! - Declare one private, auto-deleting reply queue per outstanding call
//! - Run one background consumer per reply queue, resolving a single-use promise
//! - Tear the queue and its consumer down deterministically on `close`
//!
//! A reply is matched to its call purely by arriving on that call's own
//! queue; there is no shared correlation table.

use crate::broker::{QueueOptions, Subscription, Transport};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Reply queue name prefix
pub const REPLY_QUEUE_PREFIX: &str = "response_queue_";

/// Registry entry owning one reply queue's consumer
struct ReplyHandle {
    consumer_tag: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Freshly opened reply channel
#[derive(Debug)]
pub struct ReplyChannel {
    /// Queue name, used as `reply_to`
    pub name: String,
    /// Resolved with the body of the first message delivered on the queue
    pub promise: oneshot::Receiver<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

/// Reply queue declared but not yet registered; deleted if `open` is abandoned
struct PendingQueue {
    transport: Arc<dyn Transport>,
    name: Option<String>,
}

impl PendingQueue {
    fn new(transport: Arc<dyn Transport>, name: String) -> Self {
        Self {
            transport,
            name: Some(name),
        }
    }

    /// Ownership passed to the registry, or nothing was declared
    fn disarm(mut self) {
        self.name = None;
    }

    async fn discard(mut self) {
        if let Some(name) = self.name.take() {
            if let Err(e) = self.transport.delete_queue(&name).await {
                tracing::warn!(channel = %name, error = %e, "Failed to delete unregistered reply queue");
            }
        }
    }
}

impl Drop for PendingQueue {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(channel = %name, "Open abandoned, deleting reply queue in background");
                handle.spawn(async move {
                    if let Err(e) = transport.delete_queue(&name).await {
                        tracing::warn!(channel = %name, error = %e, "Failed to delete abandoned reply queue");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(channel = %name, "No runtime to delete abandoned reply queue");
            }
        }
    }
}

/// CorrelationManager instance
pub struct CorrelationManager {
    transport: Arc<dyn Transport>,
    registry: Mutex<HashMap<String, ReplyHandle>>,
}

impl CorrelationManager {
    /// Create new CorrelationManager over a shared transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            registry: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, ReplyHandle>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Declare a reply queue and start consuming it
    pub async fn open(&self) -> Result<ReplyChannel> {
        let name = format!("{}{}", REPLY_QUEUE_PREFIX, Uuid::new_v4());
        let pending = PendingQueue::new(Arc::clone(&self.transport), name.clone());

        if let Err(e) = self
            .transport
            .declare_queue(&name, QueueOptions::ephemeral())
            .await
        {
            pending.disarm();
            return Err(Error::Transport(format!("reply queue declare failed: {}", e)));
        }

        let subscription = match self.transport.consume(&name).await {
            Ok(sub) => sub,
            Err(e) => {
                pending.discard().await;
                return Err(Error::Transport(format!("reply queue consume failed: {}", e)));
            }
        };

        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let consumer_tag = subscription.consumer_tag.clone();
        let task = tokio::spawn(consume_first(
            name.clone(),
            subscription,
            tx,
            cancel.clone(),
        ));

        self.registry().insert(
            name.clone(),
            ReplyHandle {
                consumer_tag,
                cancel,
                task,
            },
        );

        pending.disarm();

        tracing::debug!(channel = %name, "Reply channel opened");

        Ok(ReplyChannel {
            name,
            promise: rx,
            created_at: Utc::now(),
        })
    }

    /// Cancel the consumer and delete the queue. Idempotent; never fails.
    pub async fn close(&self, channel: &str) {
        let handle = self.registry().remove(channel);
        let Some(handle) = handle else {
            tracing::debug!(channel = %channel, "Reply channel already closed");
            return;
        };

        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            if e.is_panic() {
                tracing::error!(channel = %channel, "Reply consumer panicked");
            }
        }

        if let Err(e) = self.transport.cancel_consumer(&handle.consumer_tag).await {
            tracing::warn!(channel = %channel, error = %e, "Failed to cancel reply consumer");
        }
        if let Err(e) = self.transport.delete_queue(channel).await {
            tracing::warn!(channel = %channel, error = %e, "Failed to delete reply queue");
        }

        tracing::debug!(channel = %channel, "Reply channel closed");
    }

    /// Names of reply channels that are still open
    pub fn open_channels(&self) -> Vec<String> {
        self.registry().keys().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.registry().len()
    }

    /// Close every open reply channel (shutdown)
    pub async fn close_all(&self) {
        let channels = self.open_channels();
        if !channels.is_empty() {
            tracing::info!(count = channels.len(), "Closing outstanding reply channels");
        }
        for channel in channels {
            self.close(&channel).await;
        }
    }
}

/// Consumer loop: the first delivery resolves the promise, later ones are discarded
async fn consume_first(
    channel: String,
    mut subscription: Subscription,
    tx: oneshot::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    let mut tx = Some(tx);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = subscription.stream.next() => match next {
                Some(Ok(delivery)) => {
                    if let Err(e) = delivery.ack().await {
                        tracing::warn!(channel = %channel, error = %e, "Reply ack failed");
                    }
                    match tx.take() {
                        Some(sender) => {
                            // Receiver may already be gone after a timeout
                            let _ = sender.send(delivery.body);
                        }
                        None => {
                            tracing::debug!(channel = %channel, "Extra reply discarded");
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(channel = %channel, error = %e, "Reply consumer error");
                    break;
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryTransport, OutboundMessage};
    use std::time::Duration;

    fn manager() -> (Arc<MemoryTransport>, CorrelationManager) {
        let transport = Arc::new(MemoryTransport::new());
        let manager = CorrelationManager::new(transport.clone());
        (transport, manager)
    }

    #[tokio::test]
    async fn test_open_declares_and_consumes() {
        let (transport, manager) = manager();
        let reply = manager.open().await.unwrap();

        assert!(reply.name.starts_with(REPLY_QUEUE_PREFIX));
        assert!(transport.queue_exists(&reply.name));
        assert_eq!(transport.consumer_count(&reply.name), 1);
        assert_eq!(manager.open_count(), 1);

        manager.close(&reply.name).await;
    }

    #[tokio::test]
    async fn test_first_message_resolves_promise() {
        let (transport, manager) = manager();
        let reply = manager.open().await.unwrap();

        transport
            .publish(&reply.name, OutboundMessage::new(b"first".to_vec()))
            .await
            .unwrap();
        transport
            .publish(&reply.name, OutboundMessage::new(b"second".to_vec()))
            .await
            .unwrap();

        let body = tokio::time::timeout(Duration::from_secs(1), reply.promise)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, b"first");

        manager.close(&reply.name).await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, manager) = manager();
        let reply = manager.open().await.unwrap();

        manager.close(&reply.name).await;
        manager.close(&reply.name).await;

        assert!(!transport.queue_exists(&reply.name));
        assert_eq!(transport.total_consumers(), 0);
        assert_eq!(manager.open_count(), 0);
    }

    #[tokio::test]
    async fn test_close_after_resolution() {
        let (transport, manager) = manager();
        let reply = manager.open().await.unwrap();

        transport
            .publish(&reply.name, OutboundMessage::new(b"done".to_vec()))
            .await
            .unwrap();
        let body = reply.promise.await.unwrap();
        assert_eq!(body, b"done");

        manager.close(&reply.name).await;
        manager.close(&reply.name).await;
        assert!(!transport.queue_exists(&reply.name));
    }

    #[tokio::test]
    async fn test_close_without_resolution_drops_promise() {
        let (_transport, manager) = manager();
        let reply = manager.open().await.unwrap();

        manager.close(&reply.name).await;
        assert!(reply.promise.await.is_err());
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let (transport, manager) = manager();
        let a = manager.open().await.unwrap();
        let b = manager.open().await.unwrap();
        assert_ne!(a.name, b.name);

        transport
            .publish(&b.name, OutboundMessage::new(b"for-b".to_vec()))
            .await
            .unwrap();
        transport
            .publish(&a.name, OutboundMessage::new(b"for-a".to_vec()))
            .await
            .unwrap();

        assert_eq!(a.promise.await.unwrap(), b"for-a");
        assert_eq!(b.promise.await.unwrap(), b"for-b");

        manager.close_all().await;
        assert_eq!(manager.open_count(), 0);
        assert_eq!(transport.total_consumers(), 0);
    }

    /// Memory transport whose `consume` takes a while
    struct SlowConsume {
        inner: Arc<MemoryTransport>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Transport for SlowConsume {
        async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
            self.inner.declare_queue(name, options).await
        }

        async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
            self.inner.publish(queue, message).await
        }

        async fn consume(&self, queue: &str) -> Result<Subscription> {
            tokio::time::sleep(self.delay).await;
            self.inner.consume(queue).await
        }

        async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()> {
            self.inner.cancel_consumer(consumer_tag).await
        }

        async fn delete_queue(&self, name: &str) -> Result<()> {
            self.inner.delete_queue(name).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_abandoned_open_deletes_reply_queue() {
        let inner = Arc::new(MemoryTransport::new());
        let manager = CorrelationManager::new(Arc::new(SlowConsume {
            inner: inner.clone(),
            delay: Duration::from_millis(50),
        }));

        let abandoned = tokio::time::timeout(Duration::from_millis(10), manager.open()).await;
        assert!(abandoned.is_err());

        for _ in 0..30 {
            if inner.queue_names().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(inner.queue_names().is_empty());
        assert_eq!(manager.open_count(), 0);
    }

    #[tokio::test]
    async fn test_open_fails_when_declare_fails() {
        let (transport, manager) = manager();
        transport.set_fail_declares(true);

        let err = manager.open().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(manager.open_count(), 0);
        assert!(transport.queue_names().is_empty());
    }
}
