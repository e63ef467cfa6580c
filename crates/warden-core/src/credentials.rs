//! Per-sandbox OpenRouter API key provisioning.
//!
//! Each sandbox gets its own rate-limited key so one user cannot burn the
//! whole budget. Provisioning failures are non-fatal to the sandbox; the
//! agent simply runs without a provider key.

use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";

/// A freshly issued key plus the handle needed to revoke it later.
pub struct ProvisionedKey {
    /// The API key (injected into the container environment)
    pub key: String,
    /// Revocation handle persisted on the sandbox record
    pub handle: String,
}

#[derive(Deserialize)]
struct CreateKeyResponse {
    key: String,
    data: CreateKeyData,
}

#[derive(Deserialize)]
struct CreateKeyData {
    hash: String,
}

/// Issues and revokes per-sandbox provider keys.
pub struct CredentialProvisioner {
    client: reqwest::Client,
    api_base: String,
    provisioning_key: SecretString,
}

impl CredentialProvisioner {
    /// Provisioner against the production API.
    pub fn new(provisioning_key: SecretString) -> Self {
        Self::with_api_base(provisioning_key, DEFAULT_API_BASE.to_string())
    }

    /// Provisioner against a custom endpoint (tests).
    pub fn with_api_base(provisioning_key: SecretString, api_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
            provisioning_key,
        }
    }

    /// Issue a key capped at `limit` credits per `reset` period.
    pub async fn issue(&self, name: &str, limit: u32, reset: &str) -> Result<ProvisionedKey> {
        let res = self
            .client
            .post(format!("{}/keys", self.api_base))
            .bearer_auth(self.provisioning_key.expose_secret())
            .json(&json!({ "name": name, "limit": limit, "limitReset": reset }))
            .send()
            .await
            .map_err(|e| Error::Credential(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(Error::Credential(format!(
                "key creation failed: {} {}",
                status, body
            )));
        }

        let created: CreateKeyResponse = res
            .json()
            .await
            .map_err(|e| Error::Credential(e.to_string()))?;
        debug!(name, "Provisioned sandbox API key");
        Ok(ProvisionedKey {
            key: created.key,
            handle: created.data.hash,
        })
    }

    /// Revoke a previously issued key. A key that is already gone counts as
    /// revoked.
    pub async fn revoke(&self, handle: &str) -> Result<()> {
        let res = self
            .client
            .delete(format!("{}/keys/{}", self.api_base, handle))
            .bearer_auth(self.provisioning_key.expose_secret())
            .send()
            .await
            .map_err(|e| Error::Credential(e.to_string()))?;

        if !res.status().is_success() && res.status() != reqwest::StatusCode::NOT_FOUND {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(Error::Credential(format!(
                "key revocation failed: {} {}",
                status, body
            )));
        }
        Ok(())
    }
}
