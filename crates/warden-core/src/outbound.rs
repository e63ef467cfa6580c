//! Outbound delivery seams.
//!
//! [`ChannelDelivery`] is the boundary to the messaging channel: the adapter
//! behind it owns chunking, formatting and wire details. [`OutboundRoute`]
//! is what the connection manager calls for agent-initiated traffic; the
//! [`OutboundRouter`] implementation resolves the sandbox back to a user,
//! delivers, and records the message.

use crate::error::Result;
use crate::store::{MessageRole, Store};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

/// Where an agent-initiated message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundSource {
    /// Proactive heartbeat with something to report
    Heartbeat,
    /// Scheduled job summary
    Cron,
}

impl OutboundSource {
    /// Stable string form used in message records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Cron => "cron",
        }
    }
}

/// Messaging-channel adapter boundary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelDelivery: Send + Sync {
    /// Deliver text to a user.
    async fn send_text(&self, phone: &str, text: &str) -> Result<()>;
    /// Show a "still working" indicator tied to the message being answered.
    async fn typing(&self, phone: &str, reply_to: &str) -> Result<()>;
    /// Mark an inbound message as read.
    async fn mark_read(&self, message_id: &str) -> Result<()>;
}

/// Sink for agent-initiated messages (heartbeat / cron), keyed by sandbox.
#[async_trait]
pub trait OutboundRoute: Send + Sync {
    /// Deliver agent-initiated text for a sandbox.
    async fn deliver(&self, sandbox_id: &str, text: &str, source: OutboundSource);
}

/// Default route: sandbox → owning user's channel address → deliver + record.
pub struct OutboundRouter {
    store: Store,
    delivery: Arc<dyn ChannelDelivery>,
}

impl OutboundRouter {
    /// Router over the shared store and channel adapter.
    pub fn new(store: Store, delivery: Arc<dyn ChannelDelivery>) -> Self {
        Self { store, delivery }
    }
}

#[async_trait]
impl OutboundRoute for OutboundRouter {
    async fn deliver(&self, sandbox_id: &str, text: &str, source: OutboundSource) {
        let phone = match self.store.phone_for_sandbox(sandbox_id).await {
            Ok(Some(phone)) => phone,
            Ok(None) => {
                error!(sandbox_id, "No user found for outbound message");
                return;
            }
            Err(e) => {
                error!(sandbox_id, error = %e, "Outbound user lookup failed");
                return;
            }
        };

        if let Err(e) = self.delivery.send_text(&phone, text).await {
            error!(sandbox_id, error = %e, "Outbound delivery failed");
            return;
        }

        if let Err(e) = self
            .store
            .record_message(
                sandbox_id,
                MessageRole::Assistant,
                text,
                "complete",
                source.as_str(),
            )
            .await
        {
            error!(sandbox_id, error = %e, "Could not record outbound message");
        }

        info!(sandbox_id, source = source.as_str(), "Delivered agent-initiated message");
    }
}
