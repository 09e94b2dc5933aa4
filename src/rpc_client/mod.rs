//! RpcClient - Request/Response over the broker
//!
//! ## Responsibilities
//!
//! - Build the request envelope (`{request_id, data}` + `reply_to` metadata)
//! - Publish it and await the private reply channel under a timeout
//! - Always release the reply channel before returning
//!
//! Calls are independent: each owns its reply channel and promise, so any
//! number of them may be outstanding at once.

use crate::broker::{OutboundMessage, Transport};
use crate::correlation::{CorrelationManager, ReplyChannel};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Wire envelope; `reply_to` travels as transport metadata
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope<T> {
    pub request_id: String,
    pub data: T,
    #[serde(skip)]
    pub reply_to: String,
}

/// One in-flight call
#[derive(Debug)]
pub struct PendingRequest {
    pub request_id: String,
    pub reply: ReplyChannel,
}

impl PendingRequest {
    pub fn created_at(&self) -> DateTime<Utc> {
        self.reply.created_at
    }
}

/// Closes a reply channel if the owning call future is dropped mid-flight
struct ReleaseGuard {
    correlation: Arc<CorrelationManager>,
    channel: Option<String>,
}

impl ReleaseGuard {
    fn new(correlation: Arc<CorrelationManager>, channel: String) -> Self {
        Self {
            correlation,
            channel: Some(channel),
        }
    }

    async fn release(mut self) {
        if let Some(channel) = self.channel.take() {
            self.correlation.close(&channel).await;
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        let correlation = Arc::clone(&self.correlation);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(channel = %channel, "Call cancelled, releasing reply channel in background");
                handle.spawn(async move {
                    correlation.close(&channel).await;
                });
            }
            Err(_) => {
                tracing::warn!(channel = %channel, "No runtime to release reply channel");
            }
        }
    }
}

/// RpcClient instance
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    correlation: Arc<CorrelationManager>,
}

impl RpcClient {
    /// Create new RpcClient sharing the transport with its correlation manager
    pub fn new(transport: Arc<dyn Transport>, correlation: Arc<CorrelationManager>) -> Self {
        Self {
            transport,
            correlation,
        }
    }

    pub fn correlation(&self) -> &Arc<CorrelationManager> {
        &self.correlation
    }

    /// Call `queue` with `data` and decode the reply as `Resp`
    pub async fn call<Req, Resp>(&self, queue: &str, data: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let request_id = Uuid::new_v4().to_string();
        let reply = self.correlation.open().await?;
        let guard = ReleaseGuard::new(Arc::clone(&self.correlation), reply.name.clone());

        let pending = PendingRequest {
            request_id: request_id.clone(),
            reply,
        };
        let outcome = self.exchange(queue, data, pending, timeout).await;

        guard.release().await;

        let body = outcome?;
        serde_json::from_slice(&body).map_err(|e| {
            Error::MalformedResponse(format!(
                "reply to {} on {} not decodable: {}",
                request_id, queue, e
            ))
        })
    }

    /// Call `queue` and return the reply as untyped JSON
    pub async fn call_value<Req>(
        &self,
        queue: &str,
        data: &Req,
        timeout: Duration,
    ) -> Result<serde_json::Value>
    where
        Req: Serialize + Sync,
    {
        self.call(queue, data, timeout).await
    }

    async fn exchange<Req>(
        &self,
        queue: &str,
        data: &Req,
        pending: PendingRequest,
        timeout: Duration,
    ) -> Result<Vec<u8>>
    where
        Req: Serialize + Sync,
    {
        let created_at = pending.created_at();
        let PendingRequest { request_id, reply } = pending;

        let envelope = RequestEnvelope {
            request_id: request_id.clone(),
            data,
            reply_to: reply.name.clone(),
        };
        let body = serde_json::to_vec(&envelope)?;

        self.transport
            .publish(
                queue,
                OutboundMessage::new(body)
                    .with_reply_to(envelope.reply_to.clone())
                    .with_correlation_id(request_id.clone()),
            )
            .await?;

        tracing::debug!(
            queue = %queue,
            request_id = %request_id,
            reply_to = %envelope.reply_to,
            "RPC request published"
        );

        match tokio::time::timeout(timeout, reply.promise).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "reply channel for {} closed before a response arrived",
                request_id
            ))),
            Err(_) => {
                tracing::warn!(
                    queue = %queue,
                    request_id = %request_id,
                    timeout_ms = timeout.as_millis() as u64,
                    waited_ms = (Utc::now() - created_at).num_milliseconds(),
                    "RPC timed out"
                );
                Err(Error::RpcTimeout { request_id })
            }
        }
    }
}
