//! Webhook-backed channel delivery.
//!
//! The real messaging adapter lives behind an HTTP webhook; this thin
//! client forwards outbound text, typing indicators and read receipts to
//! it. With no webhook configured everything is logged and dropped, which
//! keeps local development working without a channel.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};
use warden_core::error::{Error, Result};
use warden_core::outbound::ChannelDelivery;

pub struct WebhookDelivery {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl WebhookDelivery {
    pub fn new(outbound_url: String) -> Self {
        let base_url = if outbound_url.is_empty() {
            None
        } else {
            Some(outbound_url.trim_end_matches('/').to_string())
        };
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let Some(base) = &self.base_url else {
            debug!(path, "No outbound webhook configured, dropping");
            return Ok(());
        };
        let res = self
            .client
            .post(format!("{}{}", base, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("outbound webhook failed: {}", e)))?;
        if !res.status().is_success() {
            return Err(Error::Internal(format!(
                "outbound webhook returned {}",
                res.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelDelivery for WebhookDelivery {
    async fn send_text(&self, phone: &str, text: &str) -> Result<()> {
        if self.base_url.is_none() {
            info!(phone, text, "Outbound message (log-only)");
            return Ok(());
        }
        self.post("/messages", json!({ "to": phone, "text": text }))
            .await
    }

    async fn typing(&self, phone: &str, reply_to: &str) -> Result<()> {
        self.post("/typing", json!({ "to": phone, "replyTo": reply_to }))
            .await
    }

    async fn mark_read(&self, message_id: &str) -> Result<()> {
        self.post("/read", json!({ "messageId": message_id })).await
    }
}
